//! Strongly-typed resource specs.
//!
//! Every kind held by the polymorphic container has a typed document;
//! the store validates on both read and write so out-of-schema JSON is
//! never handed to callers.

use super::schema::{ResourceKind, TaskStatusBlock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to another resource by `(name, namespace)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl ResourceRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: default_namespace(),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

// ============================================================================
// Team
// ============================================================================

/// How a team's members collaborate on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationModel {
    #[default]
    Solo,
    /// Accepted and persisted; scheduled like solo. The
    /// at-most-one-running-assistant invariant forbids concurrent fan-out.
    Parallel,
    Pipeline,
    GroupChat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub bot: ResourceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub require_confirmation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSpec {
    pub members: Vec<TeamMember>,
    #[serde(default)]
    pub collaboration_model: CollaborationModel,
}

// ============================================================================
// Bot / Ghost / Shell / Model / Workspace
// ============================================================================

/// Namespace scope consulted when resolving `bind_model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindModelScope {
    #[default]
    Public,
    User,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotSpec {
    pub ghost: ResourceRef,
    pub shell: ResourceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_ref: Option<ResourceRef>,
    /// Name of a model resource that overrides `model_ref` when non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_model: Option<String>,
    #[serde(default)]
    pub bind_model_type: BindModelScope,
    #[serde(default)]
    pub agent_config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GhostSpec {
    #[serde(default)]
    pub system_prompt: String,
    /// Map of MCP server name → connection config. `${{user.name}}`-style
    /// placeholders are substituted at stream setup.
    #[serde(default)]
    pub mcp_servers: Value,
    #[serde(default)]
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellSpec {
    /// Execution backend: `Chat` streams in-process; anything else is
    /// dispatched to an executor.
    pub shell_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
}

impl ShellSpec {
    pub fn is_direct_chat(&self) -> bool {
        self.shell_type == "Chat"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Sealed (encrypted-at-rest) API key; opened only while assembling a
    /// dispatch payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub config: Value,
}

/// Git repository binding carried by workspaces and tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
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
}

// ============================================================================
// Task
// ============================================================================

/// Task classification for dispatch quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Online,
    Offline,
    Subscription,
    Flow,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Online => "online",
            TaskType::Offline => "offline",
            TaskType::Subscription => "subscription",
            TaskType::Flow => "flow",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLabels {
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub user_interacted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default)]
    pub force_override_bot_model: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDoc {
    pub title: String,
    pub team_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceSpec>,
    #[serde(default)]
    pub labels: TaskLabels,
    #[serde(default)]
    pub status: TaskStatusBlock,
    /// Service endpoints the task exposes.
    #[serde(default)]
    pub app_data: Value,
    #[serde(default)]
    pub is_group_chat: bool,
}

// ============================================================================
// Subscription
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Cron {
        expression: String,
    },
    Interval {
        seconds: i64,
    },
    OneTime {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<DateTime<Utc>>,
    },
}

impl Trigger {
    pub fn type_name(&self) -> &'static str {
        match self {
            Trigger::Cron { .. } => "cron",
            Trigger::Interval { .. } => "interval",
            Trigger::OneTime { .. } => "one_time",
        }
    }
}

/// Scheduler-managed bookkeeping, kept apart from the user-authored spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInternal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_execution_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_task_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDoc {
    pub trigger: Trigger,
    pub team_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub preserve_history: bool,
    #[serde(default)]
    pub history_message_count: u32,
    #[serde(default)]
    pub enabled: bool,
    /// Present when this subscription rents another user's published one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rental_of: Option<i64>,
    #[serde(rename = "_internal", default)]
    pub internal: SubscriptionInternal,
}

// ============================================================================
// Validated sum type
// ============================================================================

/// A parsed, validated resource document.
#[derive(Debug, Clone)]
pub enum ResourceSpec {
    Team(TeamSpec),
    Bot(BotSpec),
    Ghost(GhostSpec),
    Shell(ShellSpec),
    Model(ModelSpec),
    Workspace(WorkspaceSpec),
    Task(Box<TaskDoc>),
    Subscription(Box<SubscriptionDoc>),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Team(_) => ResourceKind::Team,
            ResourceSpec::Bot(_) => ResourceKind::Bot,
            ResourceSpec::Ghost(_) => ResourceKind::Ghost,
            ResourceSpec::Shell(_) => ResourceKind::Shell,
            ResourceSpec::Model(_) => ResourceKind::Model,
            ResourceSpec::Workspace(_) => ResourceKind::Workspace,
            ResourceSpec::Task(_) => ResourceKind::Task,
            ResourceSpec::Subscription(_) => ResourceKind::Subscription,
        }
    }

    /// Parse a raw document for the given kind, validating its shape.
    pub fn parse(kind: ResourceKind, json: &Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            ResourceKind::Team => ResourceSpec::Team(serde_json::from_value(json.clone())?),
            ResourceKind::Bot => ResourceSpec::Bot(serde_json::from_value(json.clone())?),
            ResourceKind::Ghost => ResourceSpec::Ghost(serde_json::from_value(json.clone())?),
            ResourceKind::Shell => ResourceSpec::Shell(serde_json::from_value(json.clone())?),
            ResourceKind::Model => ResourceSpec::Model(serde_json::from_value(json.clone())?),
            ResourceKind::Workspace => {
                ResourceSpec::Workspace(serde_json::from_value(json.clone())?)
            }
            ResourceKind::Task => ResourceSpec::Task(serde_json::from_value(json.clone())?),
            ResourceKind::Subscription => {
                ResourceSpec::Subscription(serde_json::from_value(json.clone())?)
            }
        })
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            ResourceSpec::Team(s) => serde_json::to_value(s),
            ResourceSpec::Bot(s) => serde_json::to_value(s),
            ResourceSpec::Ghost(s) => serde_json::to_value(s),
            ResourceSpec::Shell(s) => serde_json::to_value(s),
            ResourceSpec::Model(s) => serde_json::to_value(s),
            ResourceSpec::Workspace(s) => serde_json::to_value(s),
            ResourceSpec::Task(s) => serde_json::to_value(s),
            ResourceSpec::Subscription(s) => serde_json::to_value(s),
        }
    }
}
