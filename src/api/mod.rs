//! HTTP surface: the WebSocket upgrade, the executor callback, and the
//! pipeline confirmation endpoint.

pub mod callback;

use crate::auth::{self, AuthedUser};
use crate::bus::EventBus;
use crate::config::Settings;
use crate::dispatch::Dispatcher;
use crate::reducer::TaskReducer;
use crate::shutdown::ShutdownCoordinator;
use crate::store::Database;
use crate::streaming::{SkillRegistry, StreamingEngine};
use crate::sync::KvStore;
use crate::telemetry::SpanFilter;
use crate::ws::handlers::WsError;
use crate::ws::session::WsSession;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// Application state shared across handlers and the WS namespace.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub bus: EventBus,
    pub kv: KvStore,
    pub settings: Arc<Settings>,
    pub engine: Arc<StreamingEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub reducer: TaskReducer,
    pub skills: Arc<SkillRegistry>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub span_filter: Arc<SpanFilter>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(crate::ws::ws_handler))
        .route("/internal/callback", post(callback::executor_callback))
        .route("/api/tasks/:id/confirm-stage", post(confirm_stage))
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "accepting": state.shutdown.is_accepting(),
        "active_streams": state.shutdown.active_streams(),
    }))
}

/// HTTP variant of the pipeline confirmation; shares the WS handler.
async fn confirm_stage(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let user = bearer_user(&headers, &state.settings)?;
    let session = WsSession::new(user);
    if !body.is_object() {
        return Err(ApiError::BadRequest("expected a JSON object".into()));
    }
    body["task_id"] = json!(task_id);

    let output = crate::ws::handlers::dispatch_event(&state, &session, "confirm-stage", body)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(output.ack))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user = bearer_user(&headers, &state.settings)?;
    crate::ws::handlers::accessible_task(&state.db, user.user_id, task_id)
        .map_err(ApiError::from)?;
    state
        .dispatcher
        .cancel(task_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({"success": true})))
}

/// Validate the `Authorization: Bearer` header.
pub fn bearer_user(headers: &HeaderMap, settings: &Settings) -> Result<AuthedUser, ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;
    auth::validate_token(token, &settings.jwt_secret)
        .map_err(|e| ApiError::Unauthorized(e.to_string()))
}

// ============================================================================
// Error mapping
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<WsError> for ApiError {
    fn from(e: WsError) -> Self {
        match e {
            WsError::Unauthorized => ApiError::Unauthorized("not authenticated".into()),
            WsError::Forbidden(msg) => ApiError::Forbidden(msg),
            WsError::NotFound(what) => ApiError::NotFound(what),
            WsError::Validation(msg) => ApiError::BadRequest(msg),
            WsError::Conflict(msg) => ApiError::Conflict(msg),
            WsError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(e: crate::store::StoreError) -> Self {
        match e {
            crate::store::StoreError::NotFound(what) => ApiError::NotFound(what),
            crate::store::StoreError::Conflict(msg) => ApiError::Conflict(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}
