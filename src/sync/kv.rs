//! Ephemeral KV store and the streaming key families built on it.
//!
//! Key families:
//! - `streaming:content:<subtask_id>` — full text emitted so far, for resume
//! - `streaming:cancel:<subtask_id>` — cross-worker cancel flag
//! - `task:streaming:<task_id>` — registry entry while a task has a live
//!   assistant stream

use crate::store::{Database, StoreResult};
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Registry entry for a task's in-flight assistant stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStreamInfo {
    pub subtask_id: i64,
    pub user_id: i64,
    pub user_name: String,
}

#[derive(Clone)]
pub struct KvStore {
    db: Database,
}

const CONTENT_TTL: i64 = 3600;
const CANCEL_TTL: i64 = 600;
const STREAM_REGISTRY_TTL: i64 = 3600;

impl KvStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = ttl.map(|t| (Utc::now() + t).to_rfc3339());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
                params![key, value, expires_at],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let row: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT value, expires_at FROM kv_entries WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                Some((_, Some(expires_at))) if expires_at < now => {
                    conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
                    Ok(None)
                }
                Some((value, _)) => Ok(Some(value)),
                None => Ok(None),
            }
        })
    }

    pub fn delete(&self, key: &str) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    // ==================== Streaming key families ====================

    /// Persist the full response so far so a reconnecting client can resume.
    pub fn cache_stream_content(&self, subtask_id: i64, content: &str) -> StoreResult<()> {
        self.set(
            &format!("streaming:content:{subtask_id}"),
            content,
            Some(Duration::seconds(CONTENT_TTL)),
        )
    }

    pub fn stream_content(&self, subtask_id: i64) -> StoreResult<Option<String>> {
        self.get(&format!("streaming:content:{subtask_id}"))
    }

    pub fn clear_stream_content(&self, subtask_id: i64) -> StoreResult<()> {
        self.delete(&format!("streaming:content:{subtask_id}"))
    }

    /// Raise the cross-worker cancel flag for a stream.
    pub fn set_cancel_flag(&self, subtask_id: i64) -> StoreResult<()> {
        self.set(
            &format!("streaming:cancel:{subtask_id}"),
            "1",
            Some(Duration::seconds(CANCEL_TTL)),
        )
    }

    pub fn cancel_requested(&self, subtask_id: i64) -> StoreResult<bool> {
        Ok(self.get(&format!("streaming:cancel:{subtask_id}"))?.is_some())
    }

    pub fn clear_cancel_flag(&self, subtask_id: i64) -> StoreResult<()> {
        self.delete(&format!("streaming:cancel:{subtask_id}"))
    }

    /// Mark a task as having a live assistant stream.
    pub fn register_task_stream(&self, task_id: i64, info: &TaskStreamInfo) -> StoreResult<()> {
        let value = serde_json::to_string(info).unwrap_or_default();
        self.set(
            &format!("task:streaming:{task_id}"),
            &value,
            Some(Duration::seconds(STREAM_REGISTRY_TTL)),
        )
    }

    pub fn task_stream(&self, task_id: i64) -> StoreResult<Option<TaskStreamInfo>> {
        Ok(self
            .get(&format!("task:streaming:{task_id}"))?
            .and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    pub fn clear_task_stream(&self, task_id: i64) -> StoreResult<()> {
        self.delete(&format!("task:streaming:{task_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv() -> KvStore {
        KvStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn set_get_overwrite_delete() {
        let kv = kv();
        kv.set("k", "v1", None).unwrap();
        assert_eq!(kv.get("k").unwrap().as_deref(), Some("v1"));

        kv.set("k", "v2", None).unwrap();
        assert_eq!(kv.get("k").unwrap().as_deref(), Some("v2"));

        kv.delete("k").unwrap();
        assert!(kv.get("k").unwrap().is_none());
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let kv = kv();
        kv.set("k", "v", Some(Duration::seconds(-1))).unwrap();
        assert!(kv.get("k").unwrap().is_none());
    }

    #[test]
    fn cancel_flag_roundtrip() {
        let kv = kv();
        assert!(!kv.cancel_requested(701).unwrap());
        kv.set_cancel_flag(701).unwrap();
        assert!(kv.cancel_requested(701).unwrap());
        kv.clear_cancel_flag(701).unwrap();
        assert!(!kv.cancel_requested(701).unwrap());
    }

    #[test]
    fn task_stream_registry_roundtrip() {
        let kv = kv();
        let info = TaskStreamInfo {
            subtask_id: 101,
            user_id: 7,
            user_name: "ada".into(),
        };
        kv.register_task_stream(42, &info).unwrap();
        assert_eq!(kv.task_stream(42).unwrap().unwrap(), info);

        kv.clear_task_stream(42).unwrap();
        assert!(kv.task_stream(42).unwrap().is_none());
    }
}
