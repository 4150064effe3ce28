//! HTTP client for the executor service.

use super::payload::DispatchUnit;
use crate::reducer::ExecutorCleanup;
use crate::telemetry::RequestContext;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor transport error: {0}")]
    Transport(String),
    #[error("executor returned {status}: {message}")]
    Status { status: u16, message: String },
}

pub struct ExecutorClient {
    client: reqwest::Client,
    base_url: String,
}

impl ExecutorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    /// Hand a batch of dispatch units to the executor.
    pub async fn dispatch(
        &self,
        units: &[DispatchUnit],
        ctx: &RequestContext,
    ) -> Result<(), ExecutorError> {
        let mut builder = self.client.post(self.url("/dispatch")).json(units);
        if let Some(traceparent) = ctx.traceparent() {
            builder = builder.header("traceparent", traceparent);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| ExecutorError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Ask the executor to terminate a task's job. Idempotent on the
    /// executor side; the authoritative subtask transition arrives through
    /// the callback.
    pub async fn cancel(&self, task_id: i64) -> Result<(), ExecutorError> {
        let response = self
            .client
            .post(self.url("/cancel"))
            .json(&json!({"task_id": task_id}))
            .send()
            .await
            .map_err(|e| ExecutorError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Best-effort teardown of an executor instance.
    pub async fn delete(&self, executor_name: &str, executor_namespace: &str) {
        let result = self
            .client
            .post(self.url("/delete"))
            .json(&json!({
                "executor_name": executor_name,
                "executor_namespace": executor_namespace,
            }))
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(executor_name, error = %e, "executor delete failed");
        }
    }
}

#[async_trait]
impl ExecutorCleanup for ExecutorClient {
    async fn delete_executor(&self, executor_name: &str, executor_namespace: &str) {
        self.delete(executor_name, executor_namespace).await;
    }
}
