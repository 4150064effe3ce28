//! Cross-worker coordination: named TTL locks and an ephemeral KV store.
//!
//! Both ride on the shared database so every worker process sees the same
//! state. Locks use atomic conditional writes (set-if-absent with expiry);
//! the KV store backs streaming-content caches, cancel flags, and the
//! task-active-streaming registry.

mod kv;
mod lock;

pub use kv::{KvStore, TaskStreamInfo};
pub use lock::{LockService, LockToken};

/// Lock guarding the trigger scheduler's due scan.
pub const LOCK_CHECK_DUE_SUBSCRIPTIONS: &str = "check_due_subscriptions";
/// Lock gating one-time startup work (migrations, bootstrap).
pub const LOCK_STARTUP_INITIALIZATION: &str = "startup_initialization";
