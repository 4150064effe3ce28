//! Wire events fanned out to rooms.
//!
//! Every server-initiated event is an `Envelope { event, data }`; `data`
//! always carries enough ids (`task_id`, `subtask_id`, `message_id`) for
//! clients to splice streams and reconcile with `history:sync`.

use crate::store::{SubtaskResult, SubtaskRow, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Room for events addressed to one user across their tasks.
pub fn user_room(user_id: i64) -> String {
    format!("user:{user_id}")
}

/// Room for events scoped to one task.
pub fn task_room(task_id: i64) -> String {
    format!("task:{task_id}")
}

/// One pub/sub message: a named event plus its JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn chat_start(task_id: i64, subtask_id: i64, message_id: i64, shell_type: &str) -> Self {
        Self::new(
            "chat:start",
            json!({
                "task_id": task_id,
                "subtask_id": subtask_id,
                "message_id": message_id,
                "shell_type": shell_type,
            }),
        )
    }

    /// Incremental content. `offset` is the byte count emitted *before*
    /// this chunk, so chunks partition the final text.
    pub fn chat_chunk(task_id: i64, subtask_id: i64, message_id: i64, content: &str, offset: usize) -> Self {
        Self::new(
            "chat:chunk",
            json!({
                "task_id": task_id,
                "subtask_id": subtask_id,
                "message_id": message_id,
                "content": content,
                "offset": offset,
            }),
        )
    }

    /// Thinking-step update; `result` carries the slim running list.
    pub fn chat_chunk_thinking(
        task_id: i64,
        subtask_id: i64,
        message_id: i64,
        offset: usize,
        thinking: Value,
    ) -> Self {
        Self::new(
            "chat:chunk",
            json!({
                "task_id": task_id,
                "subtask_id": subtask_id,
                "message_id": message_id,
                "content": "",
                "offset": offset,
                "result": {"thinking": thinking},
            }),
        )
    }

    pub fn chat_done(
        task_id: i64,
        subtask_id: i64,
        message_id: i64,
        offset: usize,
        result: &SubtaskResult,
    ) -> Self {
        Self::new(
            "chat:done",
            json!({
                "task_id": task_id,
                "subtask_id": subtask_id,
                "message_id": message_id,
                "offset": offset,
                "result": result,
            }),
        )
    }

    pub fn chat_error(task_id: i64, subtask_id: i64, message_id: i64, message: &str) -> Self {
        Self::new(
            "chat:error",
            json!({
                "task_id": task_id,
                "subtask_id": subtask_id,
                "message_id": message_id,
                "error": message,
            }),
        )
    }

    pub fn chat_cancelled(task_id: i64, subtask_id: i64, message_id: i64, offset: usize) -> Self {
        Self::new(
            "chat:cancelled",
            json!({
                "task_id": task_id,
                "subtask_id": subtask_id,
                "message_id": message_id,
                "offset": offset,
            }),
        )
    }

    /// Broadcast of a user's message to their group-chat peers.
    pub fn chat_message(subtask: &SubtaskRow, user_id: i64, user_name: &str) -> Self {
        Self::new(
            "chat:message",
            json!({
                "task_id": subtask.task_id,
                "subtask_id": subtask.id,
                "message_id": subtask.message_id,
                "content": subtask.prompt,
                "user_id": user_id,
                "user_name": user_name,
            }),
        )
    }

    pub fn task_created(task_id: i64, title: &str) -> Self {
        Self::new("task:created", json!({"task_id": task_id, "title": title}))
    }

    pub fn task_status(
        task_id: i64,
        status: TaskStatus,
        progress: u8,
        error_message: Option<&str>,
    ) -> Self {
        Self::new(
            "task:status",
            json!({
                "task_id": task_id,
                "status": status,
                "progress": progress,
                "error_message": error_message,
            }),
        )
    }
}
