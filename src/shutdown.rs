//! Graceful-shutdown coordinator.
//!
//! Three phases: running → draining → stopped. Ingress paths consult
//! `is_accepting` before taking on new work; every long-running stream
//! registers a guard on entry. `initiate` flips to draining, waits for
//! guards to drop (bounded by the configured timeout), then cancels the
//! stragglers through their tokens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Stopped,
}

struct Inner {
    phase: Phase,
    next_id: u64,
    streams: HashMap<u64, CancellationToken>,
}

pub struct ShutdownCoordinator {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl ShutdownCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                phase: Phase::Running,
                next_id: 0,
                streams: HashMap::new(),
            }),
            changed: Notify::new(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().unwrap().phase
    }

    /// Whether new connections and streams may start.
    pub fn is_accepting(&self) -> bool {
        self.phase() == Phase::Running
    }

    pub fn active_streams(&self) -> usize {
        self.inner.lock().unwrap().streams.len()
    }

    /// Register a long-running stream. Returns `None` once draining has
    /// begun; callers must refuse the work.
    pub fn register(self: &Arc<Self>) -> Option<StreamGuard> {
        let mut inner = self.inner.lock().unwrap();
        if inner.phase != Phase::Running {
            return None;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let token = CancellationToken::new();
        inner.streams.insert(id, token.clone());
        Some(StreamGuard {
            id,
            token,
            coordinator: Arc::clone(self),
        })
    }

    /// Begin draining: stop accepting, wait up to `timeout` for active
    /// streams to finish, then cancel whatever is left.
    pub async fn initiate(&self, timeout: Duration) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.phase != Phase::Running {
                return;
            }
            inner.phase = Phase::Draining;
        }
        tracing::info!(
            active = self.active_streams(),
            timeout_secs = timeout.as_secs(),
            "shutdown initiated, draining streams"
        );

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active_streams() == 0 {
                break;
            }
            let notified = self.changed.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let remaining: Vec<CancellationToken> = {
            let mut inner = self.inner.lock().unwrap();
            inner.phase = Phase::Stopped;
            inner.streams.drain().map(|(_, token)| token).collect()
        };
        if !remaining.is_empty() {
            tracing::warn!(cancelled = remaining.len(), "drain timed out, cancelling streams");
            for token in remaining {
                token.cancel();
            }
        }
        self.changed.notify_waiters();
    }

    fn unregister(&self, id: u64) {
        self.inner.lock().unwrap().streams.remove(&id);
        self.changed.notify_waiters();
    }
}

/// RAII registration for one in-flight stream.
pub struct StreamGuard {
    id: u64,
    token: CancellationToken,
    coordinator: Arc<ShutdownCoordinator>,
}

impl StreamGuard {
    /// Token the owning stream selects on; fires when shutdown gives up
    /// waiting.
    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.coordinator.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_registration_while_draining() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.register().unwrap();

        let c2 = Arc::clone(&coordinator);
        let drain = tokio::spawn(async move { c2.initiate(Duration::from_millis(200)).await });

        // Give initiate a moment to flip the phase.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!coordinator.is_accepting());
        assert!(coordinator.register().is_none());

        drop(guard);
        drain.await.unwrap();
        assert_eq!(coordinator.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn cancels_stragglers_after_timeout() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.register().unwrap();
        let token = guard.cancellation();

        coordinator.initiate(Duration::from_millis(50)).await;
        assert!(token.is_cancelled());
        drop(guard);
    }

    #[tokio::test]
    async fn drain_returns_once_streams_finish() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.register().unwrap();
        let token = guard.cancellation();

        let c2 = Arc::clone(&coordinator);
        let drain = tokio::spawn(async move { c2.initiate(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        drain.await.unwrap();

        // Finished before the timeout: no forced cancellation.
        assert!(!token.is_cancelled());
        assert_eq!(coordinator.phase(), Phase::Stopped);
    }
}
