//! Cross-worker skill request registry.
//!
//! A stream that needs a client-side skill parks a waiter under a request
//! id. The `skill:response` WS event may land on any worker: the local
//! fast path resolves through a oneshot, and the cross-worker path writes
//! the response into KV where the owning worker's poll picks it up.

use crate::sync::KvStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SkillRegistry {
    kv: KvStore,
    waiters: Mutex<HashMap<String, oneshot::Sender<SkillResponse>>>,
}

const REQUEST_TTL_SECS: i64 = 300;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

impl SkillRegistry {
    pub fn new(kv: KvStore) -> Self {
        Self {
            kv,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Register an outstanding request and wait for its response.
    pub async fn wait(&self, request_id: &str, timeout: Duration) -> Option<SkillResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .insert(request_id.to_string(), tx);
        let _ = self.kv.set(
            &format!("skill:request:{request_id}"),
            "pending",
            Some(chrono::Duration::seconds(REQUEST_TTL_SECS)),
        );

        let result = tokio::time::timeout(timeout, async {
            tokio::pin!(rx);
            loop {
                tokio::select! {
                    local = &mut rx => {
                        if let Ok(response) = local {
                            return Some(response);
                        }
                        return None;
                    }
                    () = tokio::time::sleep(POLL_INTERVAL) => {
                        if let Ok(Some(raw)) =
                            self.kv.get(&format!("skill:response:{request_id}"))
                        {
                            if let Ok(response) = serde_json::from_str(&raw) {
                                return Some(response);
                            }
                        }
                    }
                }
            }
        })
        .await
        .ok()
        .flatten();

        self.waiters.lock().unwrap().remove(request_id);
        let _ = self.kv.delete(&format!("skill:request:{request_id}"));
        let _ = self.kv.delete(&format!("skill:response:{request_id}"));
        result
    }

    /// Complete a request from any worker. Returns false when the request
    /// id is unknown everywhere.
    pub fn complete(&self, request_id: &str, response: SkillResponse) -> bool {
        if let Some(tx) = self.waiters.lock().unwrap().remove(request_id) {
            return tx.send(response).is_ok();
        }
        // Not ours: leave the response for the owning worker if the request
        // is still outstanding.
        match self.kv.get(&format!("skill:request:{request_id}")) {
            Ok(Some(_)) => {
                let raw = serde_json::to_string(&response).unwrap_or_default();
                self.kv
                    .set(
                        &format!("skill:response:{request_id}"),
                        &raw,
                        Some(chrono::Duration::seconds(REQUEST_TTL_SECS)),
                    )
                    .is_ok()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use std::sync::Arc;

    fn registry() -> Arc<SkillRegistry> {
        Arc::new(SkillRegistry::new(KvStore::new(
            Database::open_in_memory().unwrap(),
        )))
    }

    #[tokio::test]
    async fn local_completion_resolves_waiter() {
        let registry = registry();
        let waiter = Arc::clone(&registry);
        let handle = tokio::spawn(async move {
            waiter.wait("req-1", Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.complete(
            "req-1",
            SkillResponse {
                success: true,
                result: Some(serde_json::json!({"ok": true})),
                error: None,
            },
        ));

        let response = handle.await.unwrap().unwrap();
        assert!(response.success);
    }

    #[tokio::test]
    async fn cross_worker_completion_lands_via_kv() {
        let db = Database::open_in_memory().unwrap();
        let worker_a = Arc::new(SkillRegistry::new(KvStore::new(db.clone())));
        let worker_b = SkillRegistry::new(KvStore::new(db));

        let waiter = Arc::clone(&worker_a);
        let handle = tokio::spawn(async move {
            waiter.wait("req-9", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Worker B has no local waiter; it parks the response in KV.
        assert!(worker_b.complete(
            "req-9",
            SkillResponse {
                success: false,
                result: None,
                error: Some("denied".into()),
            },
        ));

        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.error.as_deref(), Some("denied"));
    }

    #[tokio::test]
    async fn unknown_request_returns_false() {
        let registry = registry();
        assert!(!registry.complete(
            "ghost",
            SkillResponse {
                success: true,
                result: None,
                error: None,
            },
        ));
    }

    #[tokio::test]
    async fn wait_times_out() {
        let registry = registry();
        let response = registry.wait("req-slow", Duration::from_millis(100)).await;
        assert!(response.is_none());
    }
}
