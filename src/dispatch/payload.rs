//! Executor dispatch-unit payloads.
//!
//! One unit per claimed subtask; the executor receives a JSON array of
//! these on `POST /dispatch`.

use crate::telemetry::TraceContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchUser {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_email: Option<String>,
    pub user_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchBot {
    pub id: i64,
    pub name: String,
    pub shell_type: String,
    #[serde(default)]
    pub agent_config: Value,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub mcp_servers: Value,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    /// Resolved model parameters; the API key inside is only opened at
    /// payload-build time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<crate::shell::ModelParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchUnit {
    pub subtask_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_next_id: Option<i64>,
    pub task_id: i64,
    /// Task type label (`online`, `offline`, ...).
    #[serde(rename = "type")]
    pub task_type: String,
    pub executor_name: String,
    pub executor_namespace: String,
    pub subtask_title: String,
    pub task_title: String,
    pub user: DispatchUser,
    pub bot: Vec<DispatchBot>,
    pub team_id: i64,
    pub team_namespace: String,
    /// Collaboration mode of the team.
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repo_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_url: Option<String>,
    pub prompt: String,
    pub auth_token: String,
    #[serde(default)]
    pub attachments: Vec<Value>,
    pub status: String,
    pub progress: u8,
    pub created_at: String,
    pub updated_at: String,
    /// The stage must not inherit conversation history.
    #[serde(default)]
    pub new_session: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<TraceContext>,
}
