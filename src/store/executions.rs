//! Background-execution table operations.
//!
//! One row per subscription firing. The trigger scheduler creates rows,
//! links them to tasks, and reaps the stale ones.

use super::{parse_datetime, BackgroundExecutionRow, Database, ExecutionStatus, StoreError,
            StoreResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

/// Fields for recording a new firing.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub subscription_id: i64,
    pub user_id: i64,
    pub trigger_type: String,
    pub trigger_reason: String,
    pub prompt: String,
}

impl Database {
    pub fn create_execution(&self, new: &NewExecution) -> StoreResult<BackgroundExecutionRow> {
        self.with_conn(|conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO background_executions
                     (subscription_id, user_id, task_id, trigger_type, trigger_reason, prompt,
                      status, retry_attempt, created_at, updated_at)
                 VALUES (?1, ?2, 0, ?3, ?4, ?5, 'PENDING', 0, ?6, ?6)",
                params![
                    new.subscription_id,
                    new.user_id,
                    new.trigger_type,
                    new.trigger_reason,
                    new.prompt,
                    now.to_rfc3339(),
                ],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {EXECUTION_COLS} FROM background_executions WHERE id = ?1"),
                params![id],
                row_to_execution,
            )
            .map_err(StoreError::from)
        })
    }

    pub fn get_execution(&self, id: i64) -> StoreResult<BackgroundExecutionRow> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {EXECUTION_COLS} FROM background_executions WHERE id = ?1"),
                params![id],
                row_to_execution,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))
        })
    }

    /// Move an execution to a new status, stamping started/completed times
    /// as appropriate for the target status.
    pub fn update_execution_status(
        &self,
        id: i64,
        status: ExecutionStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let started = matches!(status, ExecutionStatus::Running);
            let completed = matches!(
                status,
                ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
            );
            let updated = conn.execute(
                "UPDATE background_executions
                 SET status = ?1,
                     error_message = ?2,
                     started_at = CASE WHEN ?3 THEN ?4 ELSE started_at END,
                     completed_at = CASE WHEN ?5 THEN ?4 ELSE completed_at END,
                     updated_at = ?4
                 WHERE id = ?6",
                params![status.to_string(), error_message, started, now, completed, id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("execution {id}")));
            }
            Ok(())
        })
    }

    /// Bind the execution to the task that will run it.
    pub fn link_execution_task(&self, id: i64, task_id: i64) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE background_executions SET task_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![task_id, Utc::now().to_rfc3339(), id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("execution {id}")));
            }
            Ok(())
        })
    }

    pub fn increment_execution_retry(&self, id: i64) -> StoreResult<u32> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE background_executions
                 SET retry_attempt = retry_attempt + 1, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )?;
            conn.query_row(
                "SELECT retry_attempt FROM background_executions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }

    /// PENDING executions never linked to a task, older than the cutoff.
    /// These were enqueued but their execute job was lost.
    pub fn stale_pending_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> StoreResult<Vec<BackgroundExecutionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXECUTION_COLS} FROM background_executions
                 WHERE status = 'PENDING' AND task_id = 0 AND created_at < ?1
                 ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map(params![older_than.to_rfc3339()], row_to_execution)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
    }

    /// RUNNING executions whose `started_at` is older than the cutoff.
    pub fn stale_running_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> StoreResult<Vec<BackgroundExecutionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXECUTION_COLS} FROM background_executions
                 WHERE status = 'RUNNING' AND started_at IS NOT NULL AND started_at < ?1
                 ORDER BY started_at ASC"
            ))?;
            let rows = stmt.query_map(params![older_than.to_rfc3339()], row_to_execution)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
    }

    /// Record an execution whose retries are exhausted.
    pub fn insert_dead_letter(
        &self,
        subscription_id: i64,
        execution_id: i64,
        reason: &str,
        payload: &serde_json::Value,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO dead_letters (subscription_id, execution_id, reason, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    subscription_id,
                    execution_id,
                    reason,
                    payload.to_string(),
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }
}

const EXECUTION_COLS: &str = "id, subscription_id, user_id, task_id, trigger_type, trigger_reason, \
                              prompt, status, error_message, retry_attempt, started_at, \
                              completed_at, created_at, updated_at";

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<BackgroundExecutionRow> {
    let status_raw: String = row.get(7)?;
    Ok(BackgroundExecutionRow {
        id: row.get(0)?,
        subscription_id: row.get(1)?,
        user_id: row.get(2)?,
        task_id: row.get(3)?,
        trigger_type: row.get(4)?,
        trigger_reason: row.get(5)?,
        prompt: row.get(6)?,
        status: status_raw.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, e.into())
        })?,
        error_message: row.get(8)?,
        retry_attempt: row.get(9)?,
        started_at: row.get::<_, Option<String>>(10)?.map(|s| parse_datetime(&s)),
        completed_at: row.get::<_, Option<String>>(11)?.map(|s| parse_datetime(&s)),
        created_at: parse_datetime(&row.get::<_, String>(12)?),
        updated_at: parse_datetime(&row.get::<_, String>(13)?),
    })
}
