//! Handlers for the colon-routed `/ws` events.
//!
//! Each handler validates the payload, enforces row-level ownership, and
//! returns an ack plus optional room membership changes and direct events
//! for the calling socket.

use super::protocol::{
    ChatCancelPayload, ChatResumePayload, ChatRetryPayload, ChatSendPayload, ConfirmStagePayload,
    HistorySyncPayload, SkillResponsePayload, TaskJoinPayload, TaskLeavePayload,
};
use crate::api::AppState;
use crate::dispatch::model::resolve_model;
use crate::events::{task_room, user_room, Envelope};
use crate::reducer::ConfirmAction;
use crate::store::resources::{
    BotSpec, ResourceSpec, ShellSpec, TaskDoc, TaskLabels, TaskType, TeamSpec, WorkspaceSpec,
};
use crate::store::subtasks::NewSubtask;
use crate::store::{
    Database, ResourceKind, ResourceRow, StoreError, SubtaskResult, SubtaskRole, SubtaskRow,
    SubtaskStatus, TaskStatus, TaskStatusBlock,
};
use crate::streaming::{RoomEmitter, SkillResponse, StreamTaskData};
use crate::telemetry::RequestContext;
use crate::title;
use crate::ws::session::WsSession;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("not authenticated")]
    Unauthorized,
    #[error("access denied: {0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for WsError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => WsError::NotFound(what),
            StoreError::Conflict(msg) => WsError::Conflict(msg),
            other => WsError::Internal(other.to_string()),
        }
    }
}

impl WsError {
    pub fn kind(&self) -> &'static str {
        match self {
            WsError::Unauthorized => "authentication_failed",
            WsError::Forbidden(_) => "authorization_failed",
            WsError::NotFound(_) => "resource_not_found",
            WsError::Validation(_) => "validation_failed",
            WsError::Conflict(_) => "conflicting_state",
            WsError::Internal(_) => "internal_error",
        }
    }
}

/// What a handler asks the connection actor to do besides acking.
#[derive(Default)]
pub struct HandlerOutput {
    pub ack: Value,
    pub join_room: Option<String>,
    pub leave_room: Option<String>,
    /// Events delivered only to the calling socket.
    pub direct: Vec<Envelope>,
}

impl HandlerOutput {
    fn ack(ack: Value) -> Self {
        Self {
            ack,
            ..Self::default()
        }
    }
}

/// Central colon-event router. The connection actor restores request and
/// trace context before calling this.
pub async fn dispatch_event(
    state: &AppState,
    session: &WsSession,
    event: &str,
    data: Value,
) -> Result<HandlerOutput, WsError> {
    let ctx = RequestContext {
        request_id: session.request_id.clone(),
        ..RequestContext::new_root()
    }
    .with_user(session.user_id(), session.user_name());

    match event {
        "task:join" => task_join(state, session, parse(data)?),
        "task:leave" => task_leave(parse(data)?),
        "chat:send" => chat_send(state, session, &ctx, parse(data)?),
        "chat:cancel" => chat_cancel(state, session, parse(data)?).await,
        "chat:retry" => chat_retry(state, session, &ctx, parse(data)?),
        "chat:resume" => chat_resume(state, session, parse(data)?),
        "history:sync" => history_sync(state, session, parse(data)?),
        "skill:response" => skill_response(state, parse(data)?),
        "confirm-stage" => confirm_stage(state, session, &ctx, parse(data)?),
        other => Err(WsError::Validation(format!("unknown event: {other}"))),
    }
}

fn parse<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, WsError> {
    serde_json::from_value(data).map_err(|e| WsError::Validation(e.to_string()))
}

// ============================================================================
// task:join / task:leave
// ============================================================================

fn task_join(
    state: &AppState,
    session: &WsSession,
    payload: TaskJoinPayload,
) -> Result<HandlerOutput, WsError> {
    let (task_row, _) = accessible_task(&state.db, session.user_id(), payload.task_id)?;

    let streaming = match state.kv.task_stream(task_row.id).map_err(StoreError::from)? {
        Some(info) => {
            let cached = state
                .kv
                .stream_content(info.subtask_id)
                .map_err(StoreError::from)?
                .unwrap_or_default();
            json!({
                "subtask_id": info.subtask_id,
                "offset": cached.len(),
                "cached_content": cached,
            })
        }
        None => Value::Null,
    };

    let mut out = HandlerOutput::ack(json!({"streaming": streaming}));
    out.join_room = Some(task_room(task_row.id));
    Ok(out)
}

fn task_leave(payload: TaskLeavePayload) -> Result<HandlerOutput, WsError> {
    let mut out = HandlerOutput::ack(json!({"success": true}));
    out.leave_room = Some(task_room(payload.task_id));
    Ok(out)
}

// ============================================================================
// chat:send
// ============================================================================

fn chat_send(
    state: &AppState,
    session: &WsSession,
    ctx: &RequestContext,
    payload: ChatSendPayload,
) -> Result<HandlerOutput, WsError> {
    if payload.message.trim().is_empty() {
        return Err(WsError::Validation("message cannot be empty".into()));
    }

    let team_row = state
        .db
        .get_resource(payload.team_id)
        .map_err(|_| WsError::NotFound(format!("team {}", payload.team_id)))?;
    if team_row.kind != ResourceKind::Team {
        return Err(WsError::NotFound(format!("team {}", payload.team_id)));
    }
    let Ok(ResourceSpec::Team(team)) = team_row.spec() else {
        return Err(WsError::Internal("malformed team document".into()));
    };

    let shell = first_member_shell(&state.db, &team, team_row.owner_id);
    let direct_chat = shell.as_ref().is_some_and(|(_, s)| s.is_direct_chat());

    // Group chat only wakes the AI when the team is @-mentioned.
    let should_trigger_ai =
        !payload.is_group_chat || mentions_team(&payload.message, &team_row.name);

    // Create or reuse the task.
    let (task_row, doc) = match payload.task_id {
        Some(task_id) => accessible_task(&state.db, session.user_id(), task_id)?,
        None => {
            let doc = TaskDoc {
                title: payload
                    .title
                    .clone()
                    .unwrap_or_else(|| title::derive_title(&payload.message)),
                team_id: team_row.id,
                workspace: workspace_from(&payload),
                labels: TaskLabels {
                    task_type: parse_task_type(payload.task_type.as_deref()),
                    source: direct_chat.then(|| "chat_shell".to_string()),
                    user_interacted: true,
                    subscription_id: None,
                    execution_id: None,
                    model_id: payload.force_override_bot_model.clone(),
                    force_override_bot_model: payload.force_override_bot_model.is_some(),
                },
                status: TaskStatusBlock::default(),
                app_data: json!({}),
                is_group_chat: payload.is_group_chat,
            };
            let row = state.db.create_task(session.user_id(), &doc)?;
            state.bus.publish(
                &user_room(session.user_id()),
                Envelope::task_created(row.id, &doc.title),
            );
            (row, doc)
        }
    };

    // USER turn, completed on arrival.
    let mut user_turn = NewSubtask::user(task_row.id, team_row.id, payload.message.clone());
    user_turn.attachments =
        (!payload.attachments.is_empty()).then(|| Value::Array(payload.attachments.clone()));
    let user_subtask = state.db.create_subtask(&user_turn)?;

    // Peers in the task room see the message immediately; the connection
    // actor drops the sender's own copy.
    state.bus.publish(
        &task_room(task_row.id),
        Envelope::chat_message(&user_subtask, session.user_id(), session.user_name()),
    );

    if should_trigger_ai {
        let assistant = state.db.create_subtask(&NewSubtask::assistant(
            task_row.id,
            team_row.id,
            user_subtask.message_id,
        ))?;

        if direct_chat {
            let bot = shell.map(|(b, _)| b);
            trigger_stream(state, session, ctx, &task_row, &doc, &assistant, bot.as_ref());
        }
        // Executor shells: the assistant stays PENDING for the dispatcher.
    }

    Ok(HandlerOutput::ack(json!({
        "task_id": task_row.id,
        "subtask_id": user_subtask.id,
        "message_id": user_subtask.message_id,
    })))
}

/// Spawn the in-process stream for an assistant subtask.
fn trigger_stream(
    state: &AppState,
    session: &WsSession,
    ctx: &RequestContext,
    task_row: &ResourceRow,
    doc: &TaskDoc,
    assistant: &SubtaskRow,
    bot: Option<&BotSpec>,
) {
    let model = resolve_model(
        &state.db,
        &state.settings.secret_encryption_key,
        session.user_id(),
        &doc.labels,
        bot,
    );
    let ctx = ctx.child().with_task(task_row.id).with_subtask(assistant.id);
    tracing::info!(
        request_id = %ctx.request_id,
        task_id = task_row.id,
        subtask_id = assistant.id,
        "starting chat stream"
    );
    let data = StreamTaskData {
        task_id: task_row.id,
        subtask_id: assistant.id,
        message_id: assistant.message_id,
        parent_message_id: assistant.parent_id,
        team_id: doc.team_id,
        team_owner_id: task_row.owner_id,
        user_id: session.user_id(),
        user_name: session.user_name().to_string(),
        prompt: prompt_for(&state.db, assistant).unwrap_or_default(),
        new_session: assistant.new_session,
        history_limit: None,
        shell_type: "Chat".to_string(),
        is_subscription: false,
        model,
        auth_token: String::new(),
        trace: ctx.trace.clone(),
    };
    let engine = Arc::clone(&state.engine);
    let emitter = Arc::new(RoomEmitter::new(state.bus.clone(), task_room(task_row.id)));
    tokio::spawn(async move {
        if let Err(e) = engine.run_stream(data, emitter).await {
            tracing::error!(error = %e, "background stream failed to start");
        }
    });
}

/// The user prompt an assistant subtask answers: its own prompt for
/// confirmation stages, otherwise the parent USER turn's.
fn prompt_for(db: &Database, assistant: &SubtaskRow) -> Option<String> {
    if !assistant.prompt.is_empty() {
        return Some(assistant.prompt.clone());
    }
    let parent = assistant.parent_id?;
    db.list_subtasks(assistant.task_id)
        .ok()?
        .into_iter()
        .find(|s| s.role == SubtaskRole::User && s.message_id == parent)
        .map(|s| s.prompt)
}

// ============================================================================
// chat:cancel
// ============================================================================

async fn chat_cancel(
    state: &AppState,
    session: &WsSession,
    payload: ChatCancelPayload,
) -> Result<HandlerOutput, WsError> {
    let subtask = state.db.get_subtask(payload.subtask_id)?;
    accessible_task(&state.db, session.user_id(), subtask.task_id)?;

    // Cancel after terminal is a no-op and still succeeds.
    if subtask.status.is_terminal() {
        return Ok(HandlerOutput::ack(json!({"success": true})));
    }

    if subtask.executor_name.is_some() {
        // Executor-backed: push the cancel and settle the subtask here; the
        // callback remains authoritative if it lands first.
        state.dispatcher.cancel(subtask.task_id).await?;
        let result = SubtaskResult {
            value: payload.partial_content.clone().unwrap_or_default(),
            cancelled: true,
            shell_type: payload.shell_type.clone(),
            ..SubtaskResult::default()
        };
        state.db.update_subtask_status(
            subtask.id,
            SubtaskStatus::Completed,
            100,
            Some(&result),
            None,
        )?;
        let room = task_room(subtask.task_id);
        state.bus.publish(
            &room,
            Envelope::chat_cancelled(subtask.task_id, subtask.id, subtask.message_id, result.value.len()),
        );
        state.bus.publish(
            &room,
            Envelope::chat_done(
                subtask.task_id,
                subtask.id,
                subtask.message_id,
                result.value.len(),
                &result,
            ),
        );
        state.reducer.apply(subtask.task_id)?;
        return Ok(HandlerOutput::ack(json!({"success": true})));
    }

    // In-process stream: cross-worker flag plus local signal. The worker
    // that owns the stream persists the partial and emits the events.
    let local = state
        .engine
        .request_cancel(subtask.id)
        .await
        .map_err(|e| WsError::Internal(e.to_string()))?;

    let live_anywhere = state
        .kv
        .task_stream(subtask.task_id)
        .map_err(StoreError::from)?
        .is_some_and(|info| info.subtask_id == subtask.id);

    if !local && !live_anywhere {
        // No stream is running anywhere; settle the subtask directly so the
        // client is not left waiting.
        let result = SubtaskResult {
            value: payload.partial_content.unwrap_or_default(),
            cancelled: true,
            shell_type: payload.shell_type,
            ..SubtaskResult::default()
        };
        state.db.update_subtask_status(
            subtask.id,
            SubtaskStatus::Completed,
            100,
            Some(&result),
            None,
        )?;
        let room = task_room(subtask.task_id);
        state.bus.publish(
            &room,
            Envelope::chat_cancelled(subtask.task_id, subtask.id, subtask.message_id, result.value.len()),
        );
        state.bus.publish(
            &room,
            Envelope::chat_done(
                subtask.task_id,
                subtask.id,
                subtask.message_id,
                result.value.len(),
                &result,
            ),
        );
        state.reducer.apply(subtask.task_id)?;
    }

    Ok(HandlerOutput::ack(json!({"success": true})))
}

// ============================================================================
// chat:retry
// ============================================================================

fn chat_retry(
    state: &AppState,
    session: &WsSession,
    ctx: &RequestContext,
    payload: ChatRetryPayload,
) -> Result<HandlerOutput, WsError> {
    let (task_row, mut doc) = accessible_task(&state.db, session.user_id(), payload.task_id)?;
    let subtask = state.db.get_subtask(payload.subtask_id)?;
    if subtask.task_id != task_row.id {
        return Err(WsError::Validation("subtask does not belong to task".into()));
    }
    if subtask.role != SubtaskRole::Assistant {
        return Err(WsError::Validation("only assistant turns can be retried".into()));
    }

    // Model override: an explicit model rewrites the task labels; a bare
    // `use_model_override` falls through to the task's stored metadata.
    if payload.use_model_override {
        if let Some(model_name) = payload.force_override_bot_model.clone() {
            doc = state.db.update_task(task_row.id, |d| {
                d.labels.model_id = Some(model_name.clone());
                d.labels.force_override_bot_model = true;
            })?;
        }
    }

    // Same-id retry: the subtask keeps its message_id.
    if !state.db.reset_subtask_for_retry(subtask.id)? {
        return Err(WsError::Conflict(format!(
            "subtask {} is {} and cannot be retried",
            subtask.id, subtask.status
        )));
    }

    // A terminal task must rejoin the dispatchable pool.
    state.db.update_task(task_row.id, |d| {
        if d.status.status.is_terminal() {
            d.status.status = TaskStatus::Pending;
            d.status.completed_at = None;
        }
        d.status.error_message = None;
    })?;

    let team_row = state.db.get_resource(doc.team_id).ok();
    let team = team_row.as_ref().and_then(|row| match row.spec() {
        Ok(ResourceSpec::Team(team)) => Some(team),
        _ => None,
    });
    let shell = team
        .as_ref()
        .and_then(|t| first_member_shell(&state.db, t, task_row.owner_id));

    if shell.as_ref().is_some_and(|(_, s)| s.is_direct_chat()) {
        let assistant = state.db.get_subtask(subtask.id)?;
        let bot = shell.map(|(b, _)| b);
        trigger_stream(state, session, ctx, &task_row, &doc, &assistant, bot.as_ref());
    }

    Ok(HandlerOutput::ack(json!({
        "task_id": task_row.id,
        "subtask_id": subtask.id,
        "message_id": subtask.message_id,
    })))
}

// ============================================================================
// chat:resume / history:sync
// ============================================================================

fn chat_resume(
    state: &AppState,
    session: &WsSession,
    payload: ChatResumePayload,
) -> Result<HandlerOutput, WsError> {
    accessible_task(&state.db, session.user_id(), payload.task_id)?;
    let subtask = state.db.get_subtask(payload.subtask_id)?;

    let mut out = HandlerOutput::ack(json!({"success": true}));
    out.join_room = Some(task_room(payload.task_id));
    if let Some(remainder) = state
        .engine
        .resume_chunk(payload.subtask_id, payload.offset)
        .map_err(|e| WsError::Internal(e.to_string()))?
    {
        out.direct.push(Envelope::chat_chunk(
            payload.task_id,
            payload.subtask_id,
            subtask.message_id,
            &remainder,
            payload.offset,
        ));
    }
    Ok(out)
}

fn history_sync(
    state: &AppState,
    session: &WsSession,
    payload: HistorySyncPayload,
) -> Result<HandlerOutput, WsError> {
    accessible_task(&state.db, session.user_id(), payload.task_id)?;
    let subtasks = state
        .db
        .list_subtasks_after(payload.task_id, payload.after_message_id)?;
    Ok(HandlerOutput::ack(json!({
        "task_id": payload.task_id,
        "subtasks": subtasks,
    })))
}

// ============================================================================
// skill:response / confirm-stage
// ============================================================================

fn skill_response(
    state: &AppState,
    payload: SkillResponsePayload,
) -> Result<HandlerOutput, WsError> {
    let resolved = state.skills.complete(
        &payload.request_id,
        SkillResponse {
            success: payload.success,
            result: payload.result,
            error: payload.error,
        },
    );
    Ok(HandlerOutput::ack(json!({"success": resolved})))
}

fn confirm_stage(
    state: &AppState,
    session: &WsSession,
    ctx: &RequestContext,
    payload: ConfirmStagePayload,
) -> Result<HandlerOutput, WsError> {
    let (task_row, doc) = accessible_task(&state.db, session.user_id(), payload.task_id)?;
    let action = match payload.action.as_str() {
        "continue" => ConfirmAction::Continue,
        "retry" => ConfirmAction::Retry,
        other => return Err(WsError::Validation(format!("unknown action: {other}"))),
    };

    let outcome = state
        .reducer
        .confirm(task_row.id, &payload.confirmed_prompt, action)?;

    // Direct-chat pipelines start the confirmed stage immediately; executor
    // pipelines are picked up by the dispatcher's targeted pass.
    let team = match state.db.get_resource(doc.team_id).map(|r| r.spec()) {
        Ok(Ok(ResourceSpec::Team(team))) => Some(team),
        _ => None,
    };
    let shell = team
        .as_ref()
        .and_then(|t| first_member_shell(&state.db, t, task_row.owner_id));
    if shell.as_ref().is_some_and(|(_, s)| s.is_direct_chat()) {
        let assistant = state.db.get_subtask(outcome.subtask_id)?;
        let bot = shell.map(|(b, _)| b);
        trigger_stream(state, session, ctx, &task_row, &doc, &assistant, bot.as_ref());
    }

    Ok(HandlerOutput::ack(json!({
        "task_id": task_row.id,
        "subtask_id": outcome.subtask_id,
        "message_id": outcome.message_id,
    })))
}

// ============================================================================
// Shared lookups
// ============================================================================

/// Row-level ownership check: the task's owner, or any member of a group
/// chat task, may act on it.
pub fn accessible_task(
    db: &Database,
    user_id: i64,
    task_id: i64,
) -> Result<(ResourceRow, TaskDoc), WsError> {
    let (row, doc) = db
        .get_task(task_id)
        .map_err(|_| WsError::NotFound(format!("task {task_id}")))?;
    if row.owner_id != user_id && !doc.is_group_chat {
        return Err(WsError::Forbidden(format!(
            "task {task_id} does not belong to you"
        )));
    }
    Ok((row, doc))
}

/// First member's bot and shell, resolved with the scope fallback.
fn first_member_shell(
    db: &Database,
    team: &TeamSpec,
    owner_id: i64,
) -> Option<(BotSpec, ShellSpec)> {
    let member = team.members.first()?;
    let bot_row = db
        .get_with_fallback(owner_id, ResourceKind::Bot, &member.bot.name, &member.bot.namespace)
        .ok()
        .flatten()?;
    let ResourceSpec::Bot(bot) = bot_row.spec().ok()? else {
        return None;
    };
    let shell_row = db
        .get_with_fallback(owner_id, ResourceKind::Shell, &bot.shell.name, &bot.shell.namespace)
        .ok()
        .flatten()?;
    let ResourceSpec::Shell(shell) = shell_row.spec().ok()? else {
        return None;
    };
    Some((bot, shell))
}

fn mentions_team(message: &str, team_name: &str) -> bool {
    message.contains(&format!("@{team_name}"))
}

fn parse_task_type(raw: Option<&str>) -> TaskType {
    match raw {
        Some("offline") => TaskType::Offline,
        Some("subscription") => TaskType::Subscription,
        Some("flow") => TaskType::Flow,
        _ => TaskType::Online,
    }
}

fn workspace_from(payload: &ChatSendPayload) -> Option<WorkspaceSpec> {
    if payload.git_domain.is_none()
        && payload.git_repo.is_none()
        && payload.git_url.is_none()
        && payload.branch_name.is_none()
    {
        return None;
    }
    Some(WorkspaceSpec {
        git_domain: payload.git_domain.clone(),
        git_repo: payload.git_repo.clone(),
        git_repo_id: payload.git_repo_id,
        branch_name: payload.branch_name.clone(),
        git_url: payload.git_url.clone(),
    })
}
