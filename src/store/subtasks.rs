//! Subtask table operations.
//!
//! `message_id` allocation and the PENDING→RUNNING claim both rely on the
//! connection lock plus conditional SQL, which is what makes concurrent
//! dispatchers safe without row locks.

use super::{
    parse_datetime, Database, StoreError, StoreResult, SubtaskResult, SubtaskRole, SubtaskRow,
    SubtaskStatus,
};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

/// Fields for inserting a subtask. `message_id` is allocated when `None`.
#[derive(Debug, Clone)]
pub struct NewSubtask {
    pub task_id: i64,
    pub team_id: i64,
    pub role: SubtaskRole,
    pub bot_ids: Vec<i64>,
    pub title: String,
    pub prompt: String,
    pub status: SubtaskStatus,
    pub message_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub executor_name: Option<String>,
    pub executor_namespace: Option<String>,
    pub new_session: bool,
    pub attachments: Option<Value>,
}

impl NewSubtask {
    pub fn user(task_id: i64, team_id: i64, prompt: impl Into<String>) -> Self {
        Self {
            task_id,
            team_id,
            role: SubtaskRole::User,
            bot_ids: vec![],
            title: String::new(),
            prompt: prompt.into(),
            status: SubtaskStatus::Completed,
            message_id: None,
            parent_id: None,
            executor_name: None,
            executor_namespace: None,
            new_session: false,
            attachments: None,
        }
    }

    pub fn assistant(task_id: i64, team_id: i64, parent_message_id: i64) -> Self {
        Self {
            task_id,
            team_id,
            role: SubtaskRole::Assistant,
            bot_ids: vec![],
            title: String::new(),
            prompt: String::new(),
            status: SubtaskStatus::Pending,
            message_id: None,
            parent_id: Some(parent_message_id),
            executor_name: None,
            executor_namespace: None,
            new_session: false,
            attachments: None,
        }
    }
}

/// Partial update reported by an executor callback.
#[derive(Debug, Clone, Default)]
pub struct SubtaskDelta {
    pub status: Option<SubtaskStatus>,
    pub progress: Option<u8>,
    pub title: Option<String>,
    pub result: Option<SubtaskResult>,
    pub error_message: Option<String>,
    pub executor_name: Option<String>,
    pub executor_namespace: Option<String>,
}

impl Database {
    /// Insert a subtask, allocating the next `message_id` for the task when
    /// one was not supplied. Allocation happens inside the connection lock
    /// so message ids stay strictly monotonic per task.
    pub fn create_subtask(&self, new: &NewSubtask) -> StoreResult<SubtaskRow> {
        self.with_conn(|conn| {
            let message_id = match new.message_id {
                Some(id) => id,
                None => conn.query_row(
                    "SELECT COALESCE(MAX(message_id), 0) + 1 FROM subtasks WHERE task_id = ?1",
                    params![new.task_id],
                    |row| row.get::<_, i64>(0),
                )?,
            };
            let now = Utc::now();
            let bot_ids = serde_json::to_string(&new.bot_ids).unwrap_or_else(|_| "[]".into());
            let attachments = new.attachments.as_ref().map(ToString::to_string);

            let inserted = conn.execute(
                "INSERT INTO subtasks (task_id, team_id, role, bot_ids, title, prompt, status,
                                       progress, message_id, parent_id, executor_name,
                                       executor_namespace, new_session, attachments,
                                       created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
                params![
                    new.task_id,
                    new.team_id,
                    new.role.to_string(),
                    bot_ids,
                    new.title,
                    new.prompt,
                    new.status.to_string(),
                    message_id,
                    new.parent_id,
                    new.executor_name,
                    new.executor_namespace,
                    new.new_session,
                    attachments,
                    now.to_rfc3339(),
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Err(StoreError::Conflict(format!(
                        "message_id {message_id} already exists in task {}",
                        new.task_id
                    )));
                }
                Err(e) => return Err(e.into()),
            }

            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {SUBTASK_COLS} FROM subtasks WHERE id = ?1"),
                params![id],
                row_to_subtask,
            )
            .map_err(StoreError::from)
        })
    }

    pub fn get_subtask(&self, id: i64) -> StoreResult<SubtaskRow> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {SUBTASK_COLS} FROM subtasks WHERE id = ?1"),
                params![id],
                row_to_subtask,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("subtask {id}")))
        })
    }

    /// All subtasks of a task in canonical order `(message_id, created_at)`.
    pub fn list_subtasks(&self, task_id: i64) -> StoreResult<Vec<SubtaskRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SUBTASK_COLS} FROM subtasks WHERE task_id = ?1
                 ORDER BY message_id ASC, created_at ASC"
            ))?;
            let rows = stmt.query_map(params![task_id], row_to_subtask)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
    }

    /// Subtasks with `message_id > after`, ascending. Used by history sync.
    pub fn list_subtasks_after(&self, task_id: i64, after: i64) -> StoreResult<Vec<SubtaskRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SUBTASK_COLS} FROM subtasks WHERE task_id = ?1 AND message_id > ?2
                 ORDER BY message_id ASC, created_at ASC"
            ))?;
            let rows = stmt.query_map(params![task_id, after], row_to_subtask)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
    }

    /// Claim a PENDING subtask for execution. The conditional update is the
    /// optimistic lock: exactly one caller wins.
    pub fn claim_subtask(&self, id: i64) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE subtasks SET status = 'RUNNING', updated_at = ?1
                 WHERE id = ?2 AND status = 'PENDING'",
                params![Utc::now().to_rfc3339(), id],
            )?;
            Ok(updated == 1)
        })
    }

    /// Reset a failed (or cancelled) assistant subtask back to PENDING for a
    /// same-id retry. Keeps `message_id` so ordering is preserved.
    pub fn reset_subtask_for_retry(&self, id: i64) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE subtasks SET status = 'PENDING', progress = 0, result = NULL,
                                     error_message = NULL, updated_at = ?1
                 WHERE id = ?2 AND role = 'ASSISTANT' AND status IN ('FAILED', 'CANCELLED')",
                params![Utc::now().to_rfc3339(), id],
            )?;
            Ok(updated == 1)
        })
    }

    /// Return a claimed subtask to PENDING after a failed hand-off so the
    /// next dispatch pass can retry it.
    pub fn release_claim(&self, id: i64) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE subtasks SET status = 'PENDING', updated_at = ?1
                 WHERE id = ?2 AND status = 'RUNNING'",
                params![Utc::now().to_rfc3339(), id],
            )?;
            Ok(updated == 1)
        })
    }

    /// Rerun a completed pipeline stage after the user revised its prompt.
    /// The stage keeps its `message_id` and starts a fresh session.
    pub fn reset_subtask_for_confirmation(&self, id: i64, prompt: &str) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE subtasks SET status = 'PENDING', progress = 0, result = NULL,
                                     error_message = NULL, prompt = ?1, new_session = 1,
                                     updated_at = ?2
                 WHERE id = ?3 AND role = 'ASSISTANT'",
                params![prompt, Utc::now().to_rfc3339(), id],
            )?;
            Ok(updated == 1)
        })
    }

    /// Persist a terminal (or progress) update on a subtask.
    pub fn update_subtask_status(
        &self,
        id: i64,
        status: SubtaskStatus,
        progress: u8,
        result: Option<&SubtaskResult>,
        error_message: Option<&str>,
    ) -> StoreResult<SubtaskRow> {
        self.with_conn(|conn| {
            let result_json = result.map(|r| serde_json::to_string(r).unwrap_or_default());
            let updated = conn.execute(
                "UPDATE subtasks SET status = ?1, progress = ?2,
                                     result = COALESCE(?3, result),
                                     error_message = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    status.to_string(),
                    progress,
                    result_json,
                    error_message,
                    Utc::now().to_rfc3339(),
                    id
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("subtask {id}")));
            }
            conn.query_row(
                &format!("SELECT {SUBTASK_COLS} FROM subtasks WHERE id = ?1"),
                params![id],
                row_to_subtask,
            )
            .map_err(StoreError::from)
        })
    }

    /// Apply an executor callback delta. `executor_name`, once set, is
    /// immutable; later deltas cannot rebind it.
    pub fn apply_subtask_delta(&self, id: i64, delta: &SubtaskDelta) -> StoreResult<SubtaskRow> {
        self.with_conn(|conn| {
            let current = conn
                .query_row(
                    &format!("SELECT {SUBTASK_COLS} FROM subtasks WHERE id = ?1"),
                    params![id],
                    row_to_subtask,
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("subtask {id}")))?;

            let status = delta.status.unwrap_or(current.status);
            let progress = delta.progress.unwrap_or(current.progress);
            let title = delta.title.clone().unwrap_or(current.title);
            let result_json = delta
                .result
                .as_ref()
                .map(|r| serde_json::to_string(r).unwrap_or_default());
            let (executor_name, executor_namespace) = if current.executor_name.is_some() {
                (current.executor_name.clone(), current.executor_namespace.clone())
            } else {
                (
                    delta.executor_name.clone(),
                    delta.executor_namespace.clone(),
                )
            };

            conn.execute(
                "UPDATE subtasks SET status = ?1, progress = ?2, title = ?3,
                                     result = COALESCE(?4, result), error_message = ?5,
                                     executor_name = ?6, executor_namespace = ?7,
                                     updated_at = ?8
                 WHERE id = ?9",
                params![
                    status.to_string(),
                    progress,
                    title,
                    result_json,
                    delta.error_message,
                    executor_name,
                    executor_namespace,
                    Utc::now().to_rfc3339(),
                    id
                ],
            )?;
            conn.query_row(
                &format!("SELECT {SUBTASK_COLS} FROM subtasks WHERE id = ?1"),
                params![id],
                row_to_subtask,
            )
            .map_err(StoreError::from)
        })
    }

    /// Bind the executor identity on first dispatch. No-op if already bound.
    pub fn bind_subtask_executor(
        &self,
        id: i64,
        executor_name: &str,
        executor_namespace: &str,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE subtasks SET executor_name = ?1, executor_namespace = ?2, updated_at = ?3
                 WHERE id = ?4 AND executor_name IS NULL",
                params![
                    executor_name,
                    executor_namespace,
                    Utc::now().to_rfc3339(),
                    id
                ],
            )?;
            Ok(())
        })
    }

    /// First PENDING assistant subtask of a task in canonical order.
    pub fn first_pending_assistant(&self, task_id: i64) -> StoreResult<Option<SubtaskRow>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {SUBTASK_COLS} FROM subtasks
                         WHERE task_id = ?1 AND role = 'ASSISTANT' AND status = 'PENDING'
                         ORDER BY message_id ASC, created_at ASC LIMIT 1"
                    ),
                    params![task_id],
                    row_to_subtask,
                )
                .optional()?)
        })
    }

    /// Whether any assistant subtask of the task is currently RUNNING.
    pub fn any_running_assistant(&self, task_id: i64) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM subtasks
                 WHERE task_id = ?1 AND role = 'ASSISTANT' AND status = 'RUNNING'",
                params![task_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }
}

const SUBTASK_COLS: &str = "id, task_id, team_id, role, bot_ids, title, prompt, result, status, \
                            progress, message_id, parent_id, executor_name, executor_namespace, \
                            error_message, new_session, attachments, created_at, updated_at";

fn row_to_subtask(row: &Row<'_>) -> rusqlite::Result<SubtaskRow> {
    let role_raw: String = row.get(3)?;
    let status_raw: String = row.get(8)?;
    let bot_ids_raw: String = row.get(4)?;
    let result_raw: Option<String> = row.get(7)?;
    let attachments_raw: Option<String> = row.get(16)?;

    Ok(SubtaskRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        team_id: row.get(2)?,
        role: role_raw.parse().map_err(conversion_err(3))?,
        bot_ids: serde_json::from_str(&bot_ids_raw).unwrap_or_default(),
        title: row.get(5)?,
        prompt: row.get(6)?,
        result: result_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        status: status_raw.parse().map_err(conversion_err(8))?,
        progress: row.get(9)?,
        message_id: row.get(10)?,
        parent_id: row.get(11)?,
        executor_name: row.get(12)?,
        executor_namespace: row.get(13)?,
        error_message: row.get(14)?,
        new_session: row.get(15)?,
        attachments: attachments_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: parse_datetime(&row.get::<_, String>(17)?),
        updated_at: parse_datetime(&row.get::<_, String>(18)?),
    })
}

fn conversion_err(col: usize) -> impl Fn(String) -> rusqlite::Error {
    move |e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn message_ids_are_monotonic_per_task() {
        let db = db();
        let user = db.create_subtask(&NewSubtask::user(1, 1, "hi")).unwrap();
        let assistant = db
            .create_subtask(&NewSubtask::assistant(1, 1, user.message_id))
            .unwrap();
        let other_task = db.create_subtask(&NewSubtask::user(2, 1, "yo")).unwrap();

        assert_eq!(user.message_id, 1);
        assert_eq!(assistant.message_id, 2);
        assert_eq!(assistant.parent_id, Some(1));
        assert_eq!(other_task.message_id, 1);
    }

    #[test]
    fn explicit_duplicate_message_id_conflicts() {
        let db = db();
        db.create_subtask(&NewSubtask::user(1, 1, "hi")).unwrap();

        let mut dup = NewSubtask::user(1, 1, "again");
        dup.message_id = Some(1);
        assert!(matches!(
            db.create_subtask(&dup).unwrap_err(),
            StoreError::Conflict(_)
        ));
    }

    #[test]
    fn claim_is_single_winner() {
        let db = db();
        let user = db.create_subtask(&NewSubtask::user(1, 1, "hi")).unwrap();
        let assistant = db
            .create_subtask(&NewSubtask::assistant(1, 1, user.message_id))
            .unwrap();

        assert!(db.claim_subtask(assistant.id).unwrap());
        assert!(!db.claim_subtask(assistant.id).unwrap());
        assert_eq!(
            db.get_subtask(assistant.id).unwrap().status,
            SubtaskStatus::Running
        );
    }

    #[test]
    fn retry_resets_only_failed_or_cancelled_assistants() {
        let db = db();
        let user = db.create_subtask(&NewSubtask::user(1, 1, "hi")).unwrap();
        let assistant = db
            .create_subtask(&NewSubtask::assistant(1, 1, user.message_id))
            .unwrap();

        // Running assistants cannot be retried in place.
        db.claim_subtask(assistant.id).unwrap();
        assert!(!db.reset_subtask_for_retry(assistant.id).unwrap());

        db.update_subtask_status(assistant.id, SubtaskStatus::Failed, 0, None, Some("boom"))
            .unwrap();
        assert!(db.reset_subtask_for_retry(assistant.id).unwrap());

        let row = db.get_subtask(assistant.id).unwrap();
        assert_eq!(row.status, SubtaskStatus::Pending);
        assert_eq!(row.message_id, assistant.message_id);
        assert!(row.error_message.is_none());
    }

    #[test]
    fn executor_binding_is_immutable() {
        let db = db();
        let user = db.create_subtask(&NewSubtask::user(1, 1, "hi")).unwrap();
        let assistant = db
            .create_subtask(&NewSubtask::assistant(1, 1, user.message_id))
            .unwrap();

        db.bind_subtask_executor(assistant.id, "exec-a", "ns").unwrap();
        db.bind_subtask_executor(assistant.id, "exec-b", "ns").unwrap();
        assert_eq!(
            db.get_subtask(assistant.id).unwrap().executor_name.as_deref(),
            Some("exec-a")
        );

        // Callback deltas cannot rebind either.
        let delta = SubtaskDelta {
            executor_name: Some("exec-c".into()),
            ..SubtaskDelta::default()
        };
        let row = db.apply_subtask_delta(assistant.id, &delta).unwrap();
        assert_eq!(row.executor_name.as_deref(), Some("exec-a"));
    }

    #[test]
    fn history_after_filters_by_message_id() {
        let db = db();
        for i in 0..4 {
            db.create_subtask(&NewSubtask::user(1, 1, format!("m{i}"))).unwrap();
        }
        let tail = db.list_subtasks_after(1, 2).unwrap();
        assert_eq!(
            tail.iter().map(|s| s.message_id).collect::<Vec<_>>(),
            vec![3, 4]
        );
    }
}
