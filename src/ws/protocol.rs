//! Wire protocol for the `/ws` namespace.
//!
//! JSON text frames both ways. Client frames are
//! `{event, data, ack?}`; the server echoes `ack` on the reply so the
//! client can match request/response, and pushes unsolicited events with
//! no `ack`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame sent by a client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub ack: Option<u64>,
}

/// Frame sent by the server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame {
    pub event: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl ServerFrame {
    pub fn reply(ack: Option<u64>, data: Value) -> Self {
        Self {
            event: "ack".to_string(),
            data,
            ack,
        }
    }

    pub fn push(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            ack: None,
        }
    }
}

// ============================================================================
// Event payloads
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskJoinPayload {
    pub task_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskLeavePayload {
    pub task_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSendPayload {
    pub team_id: i64,
    #[serde(default)]
    pub task_id: Option<i64>,
    pub message: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub is_group_chat: bool,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Value>,
    /// Model name forcing an override for this task.
    #[serde(default)]
    pub force_override_bot_model: Option<String>,
    #[serde(default)]
    pub git_domain: Option<String>,
    #[serde(default)]
    pub git_repo: Option<String>,
    #[serde(default)]
    pub git_repo_id: Option<i64>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub git_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCancelPayload {
    pub subtask_id: i64,
    #[serde(default)]
    pub partial_content: Option<String>,
    #[serde(default)]
    pub shell_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRetryPayload {
    pub task_id: i64,
    pub subtask_id: i64,
    #[serde(default)]
    pub use_model_override: bool,
    #[serde(default)]
    pub force_override_bot_model: Option<String>,
    #[serde(default)]
    pub force_override_bot_model_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResumePayload {
    pub task_id: i64,
    pub subtask_id: i64,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistorySyncPayload {
    pub task_id: i64,
    #[serde(default)]
    pub after_message_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillResponsePayload {
    pub request_id: String,
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmStagePayload {
    pub task_id: i64,
    pub confirmed_prompt: String,
    #[serde(default = "default_confirm_action")]
    pub action: String,
}

fn default_confirm_action() -> String {
    "continue".to_string()
}
