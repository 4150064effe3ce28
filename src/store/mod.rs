//! Persistence layer.
//!
//! A single `Database` handle wraps the SQLite connection. The resource
//! container holds configuration-like entities as JSON documents keyed by
//! `(owner, kind, name, namespace)`; subtasks and background executions
//! get dedicated tables (see `schema.rs`).

pub mod executions;
pub mod resources;
pub mod schema;
pub mod subtasks;

pub use schema::*;

use chrono::{DateTime, Utc};
use resources::ResourceSpec;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid {kind} spec: {message}")]
    InvalidSpec { kind: ResourceKind, message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

impl ResourceRow {
    /// Parse and validate the document for this row's kind.
    pub fn spec(&self) -> StoreResult<ResourceSpec> {
        ResourceSpec::parse(self.kind, &self.json).map_err(|e| StoreError::InvalidSpec {
            kind: self.kind,
            message: e.to_string(),
        })
    }
}

/// Thread-safe database handle.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    // ==================== Resource container ====================

    /// Insert a resource after validating its document. Duplicate active
    /// identity `(owner, kind, name, namespace)` is a conflict.
    pub fn create_resource(
        &self,
        owner_id: i64,
        name: &str,
        namespace: &str,
        spec: &ResourceSpec,
    ) -> StoreResult<ResourceRow> {
        let kind = spec.kind();
        let json = spec.to_json().map_err(|e| StoreError::InvalidSpec {
            kind,
            message: e.to_string(),
        })?;
        let now = Utc::now();

        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO resources (owner_id, kind, name, namespace, json, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
                params![
                    owner_id,
                    kind.to_string(),
                    name,
                    namespace,
                    json.to_string(),
                    now.to_rfc3339(),
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Err(StoreError::Conflict(format!(
                        "{kind} '{namespace}/{name}' already exists"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
            let id = conn.last_insert_rowid();
            Ok(ResourceRow {
                id,
                owner_id,
                kind,
                name: name.to_string(),
                namespace: namespace.to_string(),
                json,
                is_active: true,
                created_at: now,
                updated_at: now,
            })
        })
    }

    /// Fetch an active resource by id.
    pub fn get_resource(&self, id: i64) -> StoreResult<ResourceRow> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RESOURCE_COLS} FROM resources WHERE id = ?1 AND is_active = 1"),
                params![id],
                row_to_resource,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("resource {id}")))
        })
    }

    /// Scoped lookup by identity. Returns `None` on miss.
    pub fn get_by_name(
        &self,
        owner_id: i64,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> StoreResult<Option<ResourceRow>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {RESOURCE_COLS} FROM resources
                         WHERE owner_id = ?1 AND kind = ?2 AND name = ?3 AND namespace = ?4
                           AND is_active = 1"
                    ),
                    params![owner_id, kind.to_string(), name, namespace],
                    row_to_resource,
                )
                .optional()?)
        })
    }

    /// Lookup with the public fallback: user scope first, then owner 0.
    pub fn get_with_fallback(
        &self,
        owner_id: i64,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> StoreResult<Option<ResourceRow>> {
        if let Some(row) = self.get_by_name(owner_id, kind, name, namespace)? {
            return Ok(Some(row));
        }
        if owner_id == PUBLIC_OWNER {
            return Ok(None);
        }
        self.get_by_name(PUBLIC_OWNER, kind, name, namespace)
    }

    /// List active resources of a kind for an owner, newest last.
    pub fn list_resources(
        &self,
        owner_id: i64,
        kind: ResourceKind,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<ResourceRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RESOURCE_COLS} FROM resources
                 WHERE owner_id = ?1 AND kind = ?2 AND is_active = 1
                 ORDER BY id ASC LIMIT ?3 OFFSET ?4"
            ))?;
            let rows = stmt.query_map(
                params![
                    owner_id,
                    kind.to_string(),
                    i64::try_from(limit).unwrap_or(i64::MAX),
                    i64::try_from(offset).unwrap_or(0)
                ],
                row_to_resource,
            )?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
    }

    /// List every active resource of a kind across owners. Used by the
    /// trigger scheduler's due scan.
    pub fn list_all_of_kind(&self, kind: ResourceKind) -> StoreResult<Vec<ResourceRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RESOURCE_COLS} FROM resources
                 WHERE kind = ?1 AND is_active = 1 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![kind.to_string()], row_to_resource)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
    }

    /// Read-modify-write of a resource document under the connection lock.
    /// The patched document is re-validated before being written back.
    pub fn update_json(
        &self,
        id: i64,
        patch: impl FnOnce(&mut Value) -> StoreResult<()>,
    ) -> StoreResult<ResourceRow> {
        self.with_conn(|conn| {
            let mut row = conn
                .query_row(
                    &format!(
                        "SELECT {RESOURCE_COLS} FROM resources WHERE id = ?1 AND is_active = 1"
                    ),
                    params![id],
                    row_to_resource,
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("resource {id}")))?;

            patch(&mut row.json)?;
            // Reject out-of-schema writes.
            ResourceSpec::parse(row.kind, &row.json).map_err(|e| StoreError::InvalidSpec {
                kind: row.kind,
                message: e.to_string(),
            })?;

            let now = Utc::now();
            conn.execute(
                "UPDATE resources SET json = ?1, updated_at = ?2 WHERE id = ?3",
                params![row.json.to_string(), now.to_rfc3339(), id],
            )?;
            row.updated_at = now;
            Ok(row)
        })
    }

    /// Deactivate a resource. Rows are never purged.
    pub fn soft_delete(&self, id: i64) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE resources SET is_active = 0, updated_at = ?1 WHERE id = ?2 AND is_active = 1",
                params![Utc::now().to_rfc3339(), id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("resource {id}")));
            }
            Ok(())
        })
    }

    // ==================== Task helpers ====================

    /// Create a task resource from a document; the row name is generated.
    pub fn create_task(&self, owner_id: i64, doc: &resources::TaskDoc) -> StoreResult<ResourceRow> {
        let name = format!("task-{}", uuid::Uuid::new_v4());
        self.create_resource(
            owner_id,
            &name,
            "default",
            &ResourceSpec::Task(Box::new(doc.clone())),
        )
    }

    /// Fetch an active task and its parsed document.
    pub fn get_task(&self, task_id: i64) -> StoreResult<(ResourceRow, resources::TaskDoc)> {
        let row = self.get_resource(task_id)?;
        if row.kind != ResourceKind::Task {
            return Err(StoreError::NotFound(format!("task {task_id}")));
        }
        let ResourceSpec::Task(doc) = row.spec()? else {
            return Err(StoreError::NotFound(format!("task {task_id}")));
        };
        Ok((row, *doc))
    }

    /// Patch a task document in place.
    pub fn update_task(
        &self,
        task_id: i64,
        patch: impl FnOnce(&mut resources::TaskDoc),
    ) -> StoreResult<resources::TaskDoc> {
        let mut patched: Option<resources::TaskDoc> = None;
        self.update_json(task_id, |json| {
            let mut doc: resources::TaskDoc =
                serde_json::from_value(json.clone()).map_err(|e| StoreError::InvalidSpec {
                    kind: ResourceKind::Task,
                    message: e.to_string(),
                })?;
            patch(&mut doc);
            doc.status.updated_at = Some(Utc::now());
            *json = serde_json::to_value(&doc).map_err(|e| StoreError::InvalidSpec {
                kind: ResourceKind::Task,
                message: e.to_string(),
            })?;
            patched = Some(doc);
            Ok(())
        })?;
        patched.ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))
    }

    /// Promote a PENDING task to RUNNING. Never regresses other statuses.
    pub fn promote_task_running(&self, task_id: i64) -> StoreResult<()> {
        self.update_task(task_id, |doc| {
            if doc.status.status == TaskStatus::Pending {
                doc.status.status = TaskStatus::Running;
            }
        })?;
        Ok(())
    }

    /// All active tasks with their parsed documents. Callers filter by
    /// labels and status; rows with documents that fail validation are
    /// skipped (and logged) rather than handed out.
    pub fn list_active_tasks(&self) -> StoreResult<Vec<(ResourceRow, resources::TaskDoc)>> {
        let rows = self.list_all_of_kind(ResourceKind::Task)?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            match row.spec() {
                Ok(ResourceSpec::Task(doc)) => tasks.push((row, *doc)),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(resource_id = row.id, error = %e, "skipping malformed task document");
                }
            }
        }
        Ok(tasks)
    }
}

const RESOURCE_COLS: &str =
    "id, owner_id, kind, name, namespace, json, is_active, created_at, updated_at";

fn row_to_resource(row: &Row<'_>) -> rusqlite::Result<ResourceRow> {
    let kind_raw: String = row.get(2)?;
    let json_raw: String = row.get(5)?;
    Ok(ResourceRow {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        kind: kind_raw.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        name: row.get(3)?,
        namespace: row.get(4)?,
        json: serde_json::from_str(&json_raw).unwrap_or(Value::Null),
        is_active: row.get(6)?,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
        updated_at: parse_datetime(&row.get::<_, String>(8)?),
    })
}

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::resources::*;
    use super::*;
    use serde_json::json;

    fn ghost_spec() -> ResourceSpec {
        ResourceSpec::Ghost(GhostSpec {
            system_prompt: "be helpful".into(),
            mcp_servers: json!({}),
            skills: vec!["search".into()],
        })
    }

    #[test]
    fn reopened_database_sees_persisted_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.db");

        {
            let db = Database::open(&path).unwrap();
            db.create_resource(7, "helper", "default", &ghost_spec()).unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert!(db
            .get_by_name(7, ResourceKind::Ghost, "helper", "default")
            .unwrap()
            .is_some());
    }

    #[test]
    fn create_and_lookup_resource() {
        let db = Database::open_in_memory().unwrap();
        let row = db.create_resource(7, "helper", "default", &ghost_spec()).unwrap();

        let fetched = db
            .get_by_name(7, ResourceKind::Ghost, "helper", "default")
            .unwrap()
            .unwrap();
        assert_eq!(fetched.id, row.id);
        assert!(matches!(fetched.spec().unwrap(), ResourceSpec::Ghost(_)));
    }

    #[test]
    fn duplicate_active_identity_conflicts() {
        let db = Database::open_in_memory().unwrap();
        db.create_resource(7, "helper", "default", &ghost_spec()).unwrap();
        let err = db
            .create_resource(7, "helper", "default", &ghost_spec())
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn soft_deleted_name_can_be_reused() {
        let db = Database::open_in_memory().unwrap();
        let row = db.create_resource(7, "helper", "default", &ghost_spec()).unwrap();
        db.soft_delete(row.id).unwrap();

        assert!(db
            .get_by_name(7, ResourceKind::Ghost, "helper", "default")
            .unwrap()
            .is_none());
        // Uniqueness applies among active rows only.
        db.create_resource(7, "helper", "default", &ghost_spec()).unwrap();
    }

    #[test]
    fn listing_pages_through_owned_resources() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..5 {
            db.create_resource(7, &format!("ghost-{i}"), "default", &ghost_spec())
                .unwrap();
        }
        db.create_resource(8, "other", "default", &ghost_spec()).unwrap();

        let first_page = db.list_resources(7, ResourceKind::Ghost, 3, 0).unwrap();
        let second_page = db.list_resources(7, ResourceKind::Ghost, 3, 3).unwrap();
        assert_eq!(first_page.len(), 3);
        assert_eq!(second_page.len(), 2);
        assert!(first_page.iter().all(|r| r.owner_id == 7));
    }

    #[test]
    fn fallback_prefers_user_scope() {
        let db = Database::open_in_memory().unwrap();
        db.create_resource(PUBLIC_OWNER, "helper", "default", &ghost_spec())
            .unwrap();
        let user_row = db.create_resource(7, "helper", "default", &ghost_spec()).unwrap();

        let hit = db
            .get_with_fallback(7, ResourceKind::Ghost, "helper", "default")
            .unwrap()
            .unwrap();
        assert_eq!(hit.id, user_row.id);

        let public_hit = db
            .get_with_fallback(8, ResourceKind::Ghost, "helper", "default")
            .unwrap()
            .unwrap();
        assert_eq!(public_hit.owner_id, PUBLIC_OWNER);
    }

    #[test]
    fn update_json_rejects_out_of_schema_patch() {
        let db = Database::open_in_memory().unwrap();
        let row = db.create_resource(7, "helper", "default", &ghost_spec()).unwrap();

        let err = db
            .update_json(row.id, |json| {
                *json = json!({"skills": "not-a-list"});
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidSpec { .. }));
    }

    #[test]
    fn task_promote_never_regresses() {
        let db = Database::open_in_memory().unwrap();
        let doc = TaskDoc {
            title: "t".into(),
            team_id: 1,
            workspace: None,
            labels: TaskLabels::default(),
            status: TaskStatusBlock::default(),
            app_data: json!({}),
            is_group_chat: false,
        };
        let row = db.create_task(7, &doc).unwrap();

        db.promote_task_running(row.id).unwrap();
        let (_, doc) = db.get_task(row.id).unwrap();
        assert_eq!(doc.status.status, TaskStatus::Running);

        db.update_task(row.id, |d| d.status.status = TaskStatus::Completed)
            .unwrap();
        db.promote_task_running(row.id).unwrap();
        let (_, doc) = db.get_task(row.id).unwrap();
        assert_eq!(doc.status.status, TaskStatus::Completed);
    }
}
