//! Chat backend seam.
//!
//! The streaming engine drives a [`ChatBackend`]; the production
//! implementation talks to the out-of-process chat shell over HTTP SSE.
//! Shell resources whose `shell_type` is anything but `Chat` are not
//! handled here at all — they go through the dispatcher to executors.

pub mod http;
pub mod sse;

#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("chat shell transport error: {0}")]
    Transport(String),
    #[error("chat shell returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("chat shell protocol error: {0}")]
    Protocol(String),
    /// Error reported by the backend itself; the message is already
    /// user-facing.
    #[error("{0}")]
    Upstream(String),
}

impl ShellError {
    /// Transient failures worth a retry; protocol and upstream errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ShellError::Transport(_) => true,
            ShellError::Status { status, .. } => *status >= 500,
            ShellError::Protocol(_) | ShellError::Upstream(_) => false,
        }
    }
}

/// One conversation turn handed to the backend as history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

/// Model parameters resolved from a Model resource. The API key is open
/// here; it only ever travels to the backend, never back to clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelParams {
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Request body for one streamed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub request_id: String,
    pub system_prompt: String,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelParams>,
    /// MCP server map after variable substitution.
    #[serde(default)]
    pub mcp_servers: Value,
    #[serde(default)]
    pub skills: Vec<String>,
    pub max_tool_requests: u32,
    pub user_id: i64,
    pub user_name: String,
    #[serde(default)]
    pub enable_web_search: bool,
    #[serde(default)]
    pub web_search_max_results: u32,
    /// Subscription runs may end silently instead of posting a message.
    #[serde(default)]
    pub allow_silent_exit: bool,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<crate::telemetry::TraceContext>,
}

/// Knowledge-base citation attached to a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub kb_id: i64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Lifecycle status of one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Started,
    Completed,
    Failed,
}

/// Events produced by a streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Started {
        request_id: String,
    },
    ContentDelta {
        text: String,
    },
    ReasoningDelta {
        text: String,
    },
    ToolStart {
        run_id: String,
        tool_name: String,
        title: Option<String>,
        input: Option<Value>,
    },
    ToolDone {
        run_id: String,
        tool_name: String,
        output: Option<Value>,
        error: Option<String>,
    },
    Done {
        value: String,
        sources: Vec<SourceRef>,
        silent_exit: bool,
        silent_exit_reason: Option<String>,
    },
    Cancelled,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ShellError>> + Send>>;

/// Backend that turns a [`ChatRequest`] into a stream of events.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn stream(&self, request: ChatRequest) -> Result<EventStream, ShellError>;

    /// Best-effort out-of-band cancel by request id.
    async fn cancel(&self, request_id: &str) -> Result<(), ShellError>;
}
