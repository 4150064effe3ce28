//! Streaming engine: in-process agent execution for direct-chat shells.
//!
//! The engine claims the assistant subtask, builds the conversation
//! context, drives the chat backend's event stream, fans incremental
//! events out through an emitter, and persists the terminal outcome before
//! handing the task to the reducer.

pub mod emitter;
pub mod engine;
pub mod skills;
pub mod state;

pub use emitter::{EventEmitter, RoomEmitter, SubscriptionEmitter};
pub use engine::StreamingEngine;
pub use skills::{SkillRegistry, SkillResponse};

use crate::shell::{ModelParams, ShellError};
use crate::store::StoreError;
use crate::telemetry::TraceContext;
use thiserror::Error;

/// Immutable, self-contained payload for one background stream. Extracted
/// from rows up front so the work unit owns everything it touches.
#[derive(Debug, Clone)]
pub struct StreamTaskData {
    pub task_id: i64,
    pub subtask_id: i64,
    pub message_id: i64,
    /// `message_id` of the USER turn being answered.
    pub parent_message_id: Option<i64>,
    pub team_id: i64,
    pub team_owner_id: i64,
    pub user_id: i64,
    pub user_name: String,
    /// The prompt for this turn. For confirmation stages this is the
    /// confirmed prompt carried by the subtask itself.
    pub prompt: String,
    /// When set, no history is loaded (pipeline confirmation stages).
    pub new_session: bool,
    pub history_limit: Option<usize>,
    pub shell_type: String,
    pub is_subscription: bool,
    /// Model override resolved by the caller, if any.
    pub model: Option<ModelParams>,
    pub auth_token: String,
    pub trace: Option<TraceContext>,
}

/// Terminal outcome of one stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed { value: String },
    Cancelled { partial: String },
    Failed { message: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("server is draining, refusing new streams")]
    Draining,
    #[error("subtask {0} is not pending")]
    AlreadyRunning(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Shell(#[from] ShellError),
}
