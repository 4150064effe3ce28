//! Inbound executor callback.
//!
//! Executors POST subtask deltas here as they make progress; every delta
//! flows through the task-state reducer.

use super::{bearer_user, ApiError, AppState};
use crate::store::subtasks::SubtaskDelta;
use crate::store::{SubtaskResult, SubtaskStatus};
use axum::{
    extract::State,
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct CallbackPayload {
    pub subtask_id: i64,
    #[serde(default)]
    pub subtask_title: Option<String>,
    #[serde(default)]
    pub task_title: Option<String>,
    pub status: String,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub executor_name: Option<String>,
    #[serde(default)]
    pub executor_namespace: Option<String>,
}

pub async fn executor_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CallbackPayload>,
) -> Result<Json<Value>, ApiError> {
    bearer_user(&headers, &state.settings)?;

    // Rejoin the dispatch trace when the executor echoes it back.
    let trace = extract_trace(&headers);
    let span = tracing::info_span!(
        "executor_callback",
        subtask_id = payload.subtask_id,
        trace_id = trace.as_ref().map_or("", |t| t.trace_id.as_str()),
    );
    let _enter = span.enter();

    let status: SubtaskStatus = payload
        .status
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;

    let delta = SubtaskDelta {
        status: Some(status),
        progress: payload.progress,
        title: payload.subtask_title,
        result: payload.result.map(parse_result),
        error_message: payload.error_message,
        executor_name: payload.executor_name,
        executor_namespace: payload.executor_namespace,
    };

    let subtask = state.db.apply_subtask_delta(payload.subtask_id, &delta)?;
    if let Some(task_title) = payload.task_title {
        state.db.update_task(subtask.task_id, |doc| {
            doc.title = task_title;
        })?;
    }
    state.reducer.apply(subtask.task_id)?;

    tracing::info!(
        subtask_id = subtask.id,
        task_id = subtask.task_id,
        status = %subtask.status,
        "executor callback applied"
    );
    Ok(Json(json!({"success": true})))
}

fn extract_trace(headers: &HeaderMap) -> Option<crate::telemetry::TraceContext> {
    let traceparent = headers.get("traceparent")?.to_str().ok()?;
    let tracestate = headers.get("tracestate").and_then(|v| v.to_str().ok());
    crate::telemetry::TraceContext::parse(traceparent, tracestate)
}

/// Executors send either a structured result object or a bare string.
fn parse_result(raw: Value) -> SubtaskResult {
    match raw {
        Value::String(text) => SubtaskResult::text(text),
        other => serde_json::from_value(other.clone())
            .unwrap_or_else(|_| SubtaskResult::text(other.to_string())),
    }
}
