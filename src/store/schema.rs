//! Database schema and row types.
//!
//! Configuration-like entities (Team, Bot, Ghost, Shell, Model,
//! Workspace, Task, Subscription) live in the polymorphic `resources`
//! container as schema-versioned JSON documents. Operational entities
//! (subtasks, background executions) get dedicated tables so status and
//! ordering predicates can be indexed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// SQL schema for initialization. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    namespace TEXT NOT NULL DEFAULT 'default',
    json TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_resources_identity
    ON resources(owner_id, kind, name, namespace) WHERE is_active = 1;
CREATE INDEX IF NOT EXISTS idx_resources_kind ON resources(kind, is_active);

CREATE TABLE IF NOT EXISTS subtasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    team_id INTEGER NOT NULL,
    role TEXT NOT NULL,
    bot_ids TEXT NOT NULL DEFAULT '[]',
    title TEXT NOT NULL DEFAULT '',
    prompt TEXT NOT NULL DEFAULT '',
    result TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    progress INTEGER NOT NULL DEFAULT 0,
    message_id INTEGER NOT NULL,
    parent_id INTEGER,
    executor_name TEXT,
    executor_namespace TEXT,
    error_message TEXT,
    new_session INTEGER NOT NULL DEFAULT 0,
    attachments TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    UNIQUE (task_id, message_id)
);

CREATE INDEX IF NOT EXISTS idx_subtasks_task ON subtasks(task_id, message_id);
CREATE INDEX IF NOT EXISTS idx_subtasks_status ON subtasks(status);

CREATE TABLE IF NOT EXISTS background_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subscription_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    task_id INTEGER NOT NULL DEFAULT 0,
    trigger_type TEXT NOT NULL,
    trigger_reason TEXT NOT NULL DEFAULT '',
    prompt TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    retry_attempt INTEGER NOT NULL DEFAULT 0,
    started_at TEXT,
    completed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_executions_status
    ON background_executions(status, created_at);
CREATE INDEX IF NOT EXISTS idx_executions_subscription
    ON background_executions(subscription_id);

CREATE TABLE IF NOT EXISTS locks (
    name TEXT PRIMARY KEY,
    token TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS kv_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at TEXT
);

CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subscription_id INTEGER NOT NULL,
    execution_id INTEGER NOT NULL,
    reason TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
"#;

// ============================================================================
// Resource container
// ============================================================================

/// Resource kinds held by the polymorphic container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ResourceKind {
    Team,
    Bot,
    Ghost,
    Shell,
    Model,
    Workspace,
    Task,
    Subscription,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Team => "Team",
            ResourceKind::Bot => "Bot",
            ResourceKind::Ghost => "Ghost",
            ResourceKind::Shell => "Shell",
            ResourceKind::Model => "Model",
            ResourceKind::Workspace => "Workspace",
            ResourceKind::Task => "Task",
            ResourceKind::Subscription => "Subscription",
        };
        f.write_str(s)
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Team" => Ok(ResourceKind::Team),
            "Bot" => Ok(ResourceKind::Bot),
            "Ghost" => Ok(ResourceKind::Ghost),
            "Shell" => Ok(ResourceKind::Shell),
            "Model" => Ok(ResourceKind::Model),
            "Workspace" => Ok(ResourceKind::Workspace),
            "Task" => Ok(ResourceKind::Task),
            "Subscription" => Ok(ResourceKind::Subscription),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

/// Owner id of publicly scoped resources.
pub const PUBLIC_OWNER: i64 = 0;

/// One row of the resource container. `json` is the raw document; typed
/// access goes through [`crate::store::resources::ResourceSpec`].
#[derive(Debug, Clone, Serialize)]
pub struct ResourceRow {
    pub id: i64,
    pub owner_id: i64,
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
    pub json: Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Task status
// ============================================================================

/// Task lifecycle status, reduced from subtask statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Cancelling,
    #[serde(rename = "PENDING_CONFIRMATION")]
    PendingConfirmation,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Cancelling => "CANCELLING",
            TaskStatus::PendingConfirmation => "PENDING_CONFIRMATION",
        };
        f.write_str(s)
    }
}

/// Status block embedded in a task document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusBlock {
    #[serde(default)]
    pub status: TaskStatus,
    /// Percent complete, 0..=100.
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Subtasks
// ============================================================================

/// Who authored a subtask turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubtaskRole {
    User,
    Assistant,
}

impl fmt::Display for SubtaskRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubtaskRole::User => f.write_str("USER"),
            SubtaskRole::Assistant => f.write_str("ASSISTANT"),
        }
    }
}

impl FromStr for SubtaskRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(SubtaskRole::User),
            "ASSISTANT" => Ok(SubtaskRole::Assistant),
            other => Err(format!("unknown subtask role: {other}")),
        }
    }
}

/// Subtask lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubtaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SubtaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubtaskStatus::Completed | SubtaskStatus::Failed | SubtaskStatus::Cancelled
        )
    }
}

impl fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubtaskStatus::Pending => "PENDING",
            SubtaskStatus::Running => "RUNNING",
            SubtaskStatus::Completed => "COMPLETED",
            SubtaskStatus::Failed => "FAILED",
            SubtaskStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

impl FromStr for SubtaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SubtaskStatus::Pending),
            "RUNNING" => Ok(SubtaskStatus::Running),
            "COMPLETED" => Ok(SubtaskStatus::Completed),
            "FAILED" => Ok(SubtaskStatus::Failed),
            "CANCELLED" => Ok(SubtaskStatus::Cancelled),
            other => Err(format!("unknown subtask status: {other}")),
        }
    }
}

/// Assistant output payload stored on completed subtasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResult {
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workbench: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_type: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub silent_exit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silent_exit_reason: Option<String>,
}

impl SubtaskResult {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }
}

/// One turn/step under a task.
#[derive(Debug, Clone, Serialize)]
pub struct SubtaskRow {
    pub id: i64,
    pub task_id: i64,
    pub team_id: i64,
    pub role: SubtaskRole,
    pub bot_ids: Vec<i64>,
    pub title: String,
    pub prompt: String,
    pub result: Option<SubtaskResult>,
    pub status: SubtaskStatus,
    pub progress: u8,
    /// Per-task monotonic ordering key.
    pub message_id: i64,
    /// For ASSISTANT rows, the `message_id` of the USER turn answered.
    pub parent_id: Option<i64>,
    pub executor_name: Option<String>,
    pub executor_namespace: Option<String>,
    pub error_message: Option<String>,
    /// Pipeline confirmation turns start with no inherited history.
    pub new_session: bool,
    pub attachments: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Background executions
// ============================================================================

/// Lifecycle of one subscription firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "CANCELLED" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One occurrence of a subscription firing.
#[derive(Debug, Clone, Serialize)]
pub struct BackgroundExecutionRow {
    pub id: i64,
    pub subscription_id: i64,
    pub user_id: i64,
    /// 0 until linked to the task that ran it.
    pub task_id: i64,
    pub trigger_type: String,
    pub trigger_reason: String,
    pub prompt: String,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub retry_attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
