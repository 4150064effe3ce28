//! The streaming engine proper.

use super::emitter::EventEmitter;
use super::state::StreamState;
use super::{EngineError, StreamOutcome, StreamTaskData};
use crate::config::Settings;
use crate::events::Envelope;
use crate::reducer::TaskReducer;
use crate::shell::{ChatBackend, ChatRequest, HistoryTurn, StreamEvent};
use crate::shutdown::ShutdownCoordinator;
use crate::store::resources::{GhostSpec, ResourceSpec};
use crate::store::{Database, ResourceKind, SubtaskResult, SubtaskRole, SubtaskStatus};
use crate::sync::{KvStore, TaskStreamInfo};
use crate::telemetry::SpanFilter;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How often the accumulated response is flushed to the resume cache.
const CACHE_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Memory-recall requests must not stall stream setup.
const MEMORY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct ActiveStream {
    cancel: CancellationToken,
    request_id: String,
}

pub struct StreamingEngine {
    db: Database,
    kv: KvStore,
    backend: Arc<dyn ChatBackend>,
    reducer: TaskReducer,
    shutdown: Arc<ShutdownCoordinator>,
    semaphore: Arc<Semaphore>,
    settings: Arc<Settings>,
    span_filter: SpanFilter,
    http: reqwest::Client,
    active: Mutex<HashMap<i64, ActiveStream>>,
}

impl StreamingEngine {
    pub fn new(
        db: Database,
        kv: KvStore,
        backend: Arc<dyn ChatBackend>,
        reducer: TaskReducer,
        shutdown: Arc<ShutdownCoordinator>,
        settings: Arc<Settings>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(MEMORY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            db,
            kv,
            backend,
            reducer,
            shutdown,
            semaphore: Arc::new(Semaphore::new(settings.max_concurrent_streams)),
            span_filter: SpanFilter::from_settings(&settings),
            settings,
            http,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Run one assistant stream to completion. Returns the terminal
    /// outcome; every terminal path persists the subtask and re-reduces
    /// the task before returning.
    pub async fn run_stream(
        &self,
        data: StreamTaskData,
        emitter: Arc<dyn EventEmitter>,
    ) -> Result<StreamOutcome, EngineError> {
        let _permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Draining)?;
        let Some(guard) = self.shutdown.register() else {
            return Err(EngineError::Draining);
        };

        if !self.db.claim_subtask(data.subtask_id)? {
            return Err(EngineError::AlreadyRunning(data.subtask_id));
        }
        self.db.promote_task_running(data.task_id)?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        self.active.lock().unwrap().insert(
            data.subtask_id,
            ActiveStream {
                cancel: cancel.clone(),
                request_id: request_id.clone(),
            },
        );
        // A stale flag from an earlier attempt must not kill this stream.
        self.kv.clear_cancel_flag(data.subtask_id)?;
        self.kv.register_task_stream(
            data.task_id,
            &TaskStreamInfo {
                subtask_id: data.subtask_id,
                user_id: data.user_id,
                user_name: data.user_name.clone(),
            },
        )?;

        emitter.emit(&Envelope::chat_start(
            data.task_id,
            data.subtask_id,
            data.message_id,
            &data.shell_type,
        ));

        let outcome = self
            .drive(&data, &request_id, cancel, guard.cancellation(), &emitter)
            .await;

        self.active.lock().unwrap().remove(&data.subtask_id);
        let _ = self.kv.clear_task_stream(data.task_id);
        drop(guard);

        match &outcome {
            Ok(outcome) => {
                tracing::info!(
                    task_id = data.task_id,
                    subtask_id = data.subtask_id,
                    outcome = ?std::mem::discriminant(outcome),
                    "stream finished"
                );
            }
            Err(e) => {
                tracing::error!(
                    task_id = data.task_id,
                    subtask_id = data.subtask_id,
                    error = %e,
                    "stream failed before streaming began"
                );
            }
        }
        outcome
    }

    #[allow(clippy::too_many_lines)] // the stream loop is one state machine
    async fn drive(
        &self,
        data: &StreamTaskData,
        request_id: &str,
        cancel: CancellationToken,
        shutdown: CancellationToken,
        emitter: &Arc<dyn EventEmitter>,
    ) -> Result<StreamOutcome, EngineError> {
        enum Terminal {
            Done { value: String, silent: Option<String>, silent_exit: bool },
            Cancelled,
            ToolLimit,
            Failed(String),
        }

        let request = self.build_request(data, request_id).await?;
        let mut stream = match self.backend.stream(request.clone()).await {
            Ok(stream) => stream,
            // Transient upstream failures get one short-backoff retry;
            // anything else is reported as a failed stream.
            Err(e) if e.is_retryable() => {
                tracing::warn!(subtask_id = data.subtask_id, error = %e, "stream start failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                match self.backend.stream(request).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        let message = e.to_string();
                        self.finish_failed(data, emitter, &StreamState::new(), &message)?;
                        return Ok(StreamOutcome::Failed { message });
                    }
                }
            }
            Err(e) => {
                let message = e.to_string();
                self.finish_failed(data, emitter, &StreamState::new(), &message)?;
                return Ok(StreamOutcome::Failed { message });
            }
        };

        let mut state = StreamState::new();
        let mut tool_requests: u32 = 0;
        let mut last_flush = Instant::now();

        let terminal = loop {
            // Dual cancel check before the next token or tool event: the
            // in-process signal and the cross-worker flag.
            if cancel.is_cancelled() || shutdown.is_cancelled() {
                break Terminal::Cancelled;
            }
            if self.kv.cancel_requested(data.subtask_id)? {
                break Terminal::Cancelled;
            }

            let event = tokio::select! {
                () = cancel.cancelled() => break Terminal::Cancelled,
                () = shutdown.cancelled() => break Terminal::Cancelled,
                event = stream.next() => event,
            };

            match event {
                None => break Terminal::Done {
                    value: state.full_response.clone(),
                    silent: None,
                    silent_exit: false,
                },
                Some(Ok(StreamEvent::Started { .. })) => {}
                Some(Ok(StreamEvent::ContentDelta { text })) => {
                    let offset = state.append_content(&text);
                    // Per-chunk send spans are suppressed unless explicitly
                    // re-enabled; they overwhelm the trace backend.
                    if self.span_filter.allows_send_receive() {
                        tracing::trace!(
                            subtask_id = data.subtask_id,
                            offset,
                            len = text.len(),
                            "chunk emitted"
                        );
                    }
                    emitter.emit(&Envelope::chat_chunk(
                        data.task_id,
                        data.subtask_id,
                        data.message_id,
                        &text,
                        offset,
                    ));
                    if last_flush.elapsed() >= CACHE_FLUSH_INTERVAL {
                        self.kv
                            .cache_stream_content(data.subtask_id, &state.full_response)?;
                        last_flush = Instant::now();
                    }
                }
                Some(Ok(StreamEvent::ReasoningDelta { .. })) => {
                    // Reasoning text is not part of the persisted response.
                }
                Some(Ok(StreamEvent::ToolStart { run_id, tool_name, title, input })) => {
                    tool_requests += 1;
                    if tool_requests > self.settings.chat_tool_max_requests {
                        break Terminal::ToolLimit;
                    }
                    state.tool_started(&run_id, &tool_name, title, input);
                    emitter.emit(&Envelope::chat_chunk_thinking(
                        data.task_id,
                        data.subtask_id,
                        data.message_id,
                        state.offset,
                        state.slim_thinking(),
                    ));
                }
                Some(Ok(StreamEvent::ToolDone { run_id, tool_name, output, error })) => {
                    state.tool_finished(&run_id, &tool_name, output, error);
                    emitter.emit(&Envelope::chat_chunk_thinking(
                        data.task_id,
                        data.subtask_id,
                        data.message_id,
                        state.offset,
                        state.slim_thinking(),
                    ));
                }
                Some(Ok(StreamEvent::Done { value, sources, silent_exit, silent_exit_reason })) => {
                    state.add_sources(sources);
                    break Terminal::Done {
                        value: if value.is_empty() {
                            state.full_response.clone()
                        } else {
                            value
                        },
                        silent: silent_exit_reason,
                        silent_exit,
                    };
                }
                Some(Ok(StreamEvent::Cancelled)) => break Terminal::Cancelled,
                Some(Err(e)) => break Terminal::Failed(e.to_string()),
            }
        };

        match terminal {
            Terminal::Done { value, silent, silent_exit } => {
                let offset = state.offset;
                let mut result = std::mem::take(&mut state).into_result(
                    value.clone(),
                    &data.shell_type,
                    false,
                );
                result.silent_exit = silent_exit;
                result.silent_exit_reason = silent;
                self.db.update_subtask_status(
                    data.subtask_id,
                    SubtaskStatus::Completed,
                    100,
                    Some(&result),
                    None,
                )?;
                emitter.emit(&Envelope::chat_done(
                    data.task_id,
                    data.subtask_id,
                    data.message_id,
                    offset,
                    &result,
                ));
                self.cleanup_kv(data.subtask_id);
                self.reducer.apply(data.task_id)?;
                Ok(StreamOutcome::Completed { value })
            }
            Terminal::Cancelled => {
                // Out-of-band cancel toward the backend; the authoritative
                // state is what we persist here.
                let _ = self.backend.cancel(request_id).await;
                let partial = state.full_response.clone();
                let offset = state.offset;
                let result = std::mem::take(&mut state).into_result(
                    partial.clone(),
                    &data.shell_type,
                    true,
                );
                self.db.update_subtask_status(
                    data.subtask_id,
                    SubtaskStatus::Completed,
                    100,
                    Some(&result),
                    None,
                )?;
                emitter.emit(&Envelope::chat_cancelled(
                    data.task_id,
                    data.subtask_id,
                    data.message_id,
                    offset,
                ));
                emitter.emit(&Envelope::chat_done(
                    data.task_id,
                    data.subtask_id,
                    data.message_id,
                    offset,
                    &result,
                ));
                self.cleanup_kv(data.subtask_id);
                self.reducer.apply(data.task_id)?;
                Ok(StreamOutcome::Cancelled { partial })
            }
            Terminal::ToolLimit => {
                let message = format!(
                    "tool iteration limit reached ({})",
                    self.settings.chat_tool_max_requests
                );
                self.finish_failed(data, emitter, &state, &message)?;
                Ok(StreamOutcome::Failed { message })
            }
            Terminal::Failed(message) => {
                self.finish_failed(data, emitter, &state, &message)?;
                Ok(StreamOutcome::Failed { message })
            }
        }
    }

    /// Persist a FAILED subtask keeping any partial text, emit
    /// `chat:error`, and reduce the task.
    fn finish_failed(
        &self,
        data: &StreamTaskData,
        emitter: &Arc<dyn EventEmitter>,
        state: &StreamState,
        message: &str,
    ) -> Result<(), EngineError> {
        let result = (!state.full_response.is_empty())
            .then(|| SubtaskResult::text(state.full_response.clone()));
        self.db.update_subtask_status(
            data.subtask_id,
            SubtaskStatus::Failed,
            0,
            result.as_ref(),
            Some(message),
        )?;
        emitter.emit(&Envelope::chat_error(
            data.task_id,
            data.subtask_id,
            data.message_id,
            message,
        ));
        self.cleanup_kv(data.subtask_id);
        self.reducer.apply(data.task_id)?;
        Ok(())
    }

    fn cleanup_kv(&self, subtask_id: i64) {
        let _ = self.kv.clear_stream_content(subtask_id);
        let _ = self.kv.clear_cancel_flag(subtask_id);
    }

    /// Cancel a stream by subtask id. Sets the cross-worker flag always;
    /// when the stream runs in this process the local signal fires too.
    /// Returns whether the stream was local.
    pub async fn request_cancel(&self, subtask_id: i64) -> Result<bool, EngineError> {
        self.kv.set_cancel_flag(subtask_id)?;
        let entry = self.active.lock().unwrap().get(&subtask_id).cloned();
        match entry {
            Some(active) => {
                active.cancel.cancel();
                let _ = self.backend.cancel(&active.request_id).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replay cached content past `offset`. Returns `None` when nothing is
    /// cached or the offset already covers it.
    pub fn resume_chunk(&self, subtask_id: i64, offset: usize) -> Result<Option<String>, EngineError> {
        let Some(cached) = self.kv.stream_content(subtask_id)? else {
            return Ok(None);
        };
        Ok(cached.get(offset..).filter(|s| !s.is_empty()).map(str::to_string))
    }

    // ==================== Context build ====================

    async fn build_request(
        &self,
        data: &StreamTaskData,
        request_id: &str,
    ) -> Result<ChatRequest, EngineError> {
        let (ghost, member_prompt) = self.load_team_context(data);

        let history = if data.new_session {
            Vec::new()
        } else {
            self.load_history(data)?
        };

        let mut system_prompt = ghost
            .as_ref()
            .map(|g| g.system_prompt.clone())
            .unwrap_or_default();
        if let Some(extra) = member_prompt {
            if !extra.is_empty() {
                if !system_prompt.is_empty() {
                    system_prompt.push_str("\n\n");
                }
                system_prompt.push_str(&extra);
            }
        }
        if let Some(fragment) = self.memory_fragment(data).await {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(&fragment);
        }

        let mcp_servers = self.merged_mcp_servers(ghost.as_ref(), data);
        let skills = ghost.map(|g| g.skills).unwrap_or_default();
        let attachments = self.load_attachments(data)?;

        Ok(ChatRequest {
            request_id: request_id.to_string(),
            system_prompt,
            history,
            prompt: data.prompt.clone(),
            model: data.model.clone(),
            mcp_servers,
            skills,
            max_tool_requests: self.settings.chat_tool_max_requests,
            user_id: data.user_id,
            user_name: data.user_name.clone(),
            enable_web_search: self.settings.web_search_enabled,
            web_search_max_results: self.settings.web_search_default_max_results,
            allow_silent_exit: data.is_subscription,
            attachments,
            trace_context: data.trace.as_ref().map(crate::telemetry::TraceContext::child),
        })
    }

    /// Completed turns before the current user message, oldest first,
    /// optionally capped to the most recent `history_limit` turns.
    fn load_history(&self, data: &StreamTaskData) -> Result<Vec<HistoryTurn>, EngineError> {
        let cutoff = data.parent_message_id.unwrap_or(i64::MAX);
        let mut turns: Vec<HistoryTurn> = self
            .db
            .list_subtasks(data.task_id)?
            .into_iter()
            .filter(|s| s.message_id < cutoff && s.status == SubtaskStatus::Completed)
            .filter_map(|s| match s.role {
                SubtaskRole::User => Some(HistoryTurn {
                    role: "user".into(),
                    content: s.prompt,
                }),
                SubtaskRole::Assistant => {
                    let value = s.result.map(|r| r.value)?;
                    (!value.is_empty()).then(|| HistoryTurn {
                        role: "assistant".into(),
                        content: value,
                    })
                }
            })
            .collect();

        if let Some(limit) = data.history_limit {
            if turns.len() > limit {
                turns.drain(..turns.len() - limit);
            }
        }
        Ok(turns)
    }

    /// System-prompt inputs for the first team member's bot: its ghost and
    /// the member's per-team prompt addition.
    fn load_team_context(&self, data: &StreamTaskData) -> (Option<GhostSpec>, Option<String>) {
        let team = match self.db.get_resource(data.team_id).map(|r| r.spec()) {
            Ok(Ok(ResourceSpec::Team(spec))) => Some(spec),
            _ => None,
        };
        let Some(team_spec) = team else {
            return (None, None);
        };
        let Some(member) = team_spec.members.first().cloned() else {
            return (None, None);
        };

        let ghost = self
            .db
            .get_with_fallback(
                data.team_owner_id,
                ResourceKind::Bot,
                &member.bot.name,
                &member.bot.namespace,
            )
            .ok()
            .flatten()
            .and_then(|bot_row| match bot_row.spec() {
                Ok(ResourceSpec::Bot(bot)) => Some(bot),
                _ => None,
            })
            .and_then(|bot| {
                self.db
                    .get_with_fallback(
                        data.team_owner_id,
                        ResourceKind::Ghost,
                        &bot.ghost.name,
                        &bot.ghost.namespace,
                    )
                    .ok()
                    .flatten()
            })
            .and_then(|ghost_row| match ghost_row.spec() {
                Ok(ResourceSpec::Ghost(ghost)) => Some(ghost),
                _ => None,
            });

        (ghost, member.prompt)
    }

    /// Ghost MCP servers merged with globally configured ones, with
    /// `${{user.*}}` placeholders substituted.
    fn merged_mcp_servers(&self, ghost: Option<&GhostSpec>, data: &StreamTaskData) -> Value {
        let mut merged = serde_json::Map::new();
        if let Some(Value::Object(map)) = ghost.map(|g| &g.mcp_servers) {
            for (k, v) in map {
                merged.insert(k.clone(), v.clone());
            }
        }
        if self.settings.chat_mcp_enabled {
            if let Value::Object(map) = &self.settings.chat_mcp_servers {
                for (k, v) in map {
                    merged.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        let mut value = Value::Object(merged);
        substitute_placeholders(&mut value, data);
        value
    }

    fn load_attachments(&self, data: &StreamTaskData) -> Result<Vec<Value>, EngineError> {
        let Some(parent) = data.parent_message_id else {
            return Ok(Vec::new());
        };
        let attachments = self
            .db
            .list_subtasks(data.task_id)?
            .into_iter()
            .find(|s| s.role == SubtaskRole::User && s.message_id == parent)
            .and_then(|s| s.attachments)
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        Ok(attachments)
    }

    /// Long-term memory recall, merged into the system prompt. Degrades to
    /// nothing on timeout or error.
    async fn memory_fragment(&self, data: &StreamTaskData) -> Option<String> {
        if !self.settings.memory_enabled || self.settings.memory_base_url.is_empty() {
            return None;
        }
        let url = format!(
            "{}/recall",
            self.settings.memory_base_url.trim_end_matches('/')
        );
        let user_key = format!("{}{}", self.settings.memory_user_id_prefix, data.user_id);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("user_id", user_key.as_str()),
                ("query", data.prompt.as_str()),
            ])
            .query(&[("limit", self.settings.memory_max_results)])
            .send()
            .await
            .ok()?;
        let body: Value = response.json().await.ok()?;
        let fragments: Vec<String> = body
            .get("fragments")?
            .as_array()?
            .iter()
            .filter_map(|f| f.as_str().map(str::to_string))
            .collect();
        if fragments.is_empty() {
            return None;
        }
        Some(format!(
            "Relevant long-term memory:\n{}",
            fragments.join("\n")
        ))
    }
}

/// Replace `${{user.name}}` / `${{user.id}}` in every string leaf.
pub(crate) fn substitute_placeholders(value: &mut Value, data: &StreamTaskData) {
    match value {
        Value::String(s) => {
            if s.contains("${{") {
                *s = s
                    .replace("${{user.name}}", &data.user_name)
                    .replace("${{user.id}}", &data.user_id.to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_placeholders(item, data);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute_placeholders(item, data);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::task_room;
    use crate::shell::testing::ScriptedBackend;
    use crate::store::resources::{
        CollaborationModel, ResourceRef, TaskDoc, TaskLabels, TeamMember, TeamSpec,
    };
    use crate::store::subtasks::NewSubtask;
    use crate::bus::EventBus;
    use crate::store::{TaskStatus, TaskStatusBlock};
    use crate::streaming::RoomEmitter;
    use serde_json::json;

    struct Fixture {
        db: Database,
        bus: EventBus,
        kv: KvStore,
        backend: ScriptedBackend,
        engine: Arc<StreamingEngine>,
        task_id: i64,
        subtask_id: i64,
        message_id: i64,
        team_id: i64,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let bus = EventBus::new();
        let kv = KvStore::new(db.clone());
        let backend = ScriptedBackend::new();

        let team = TeamSpec {
            members: vec![TeamMember {
                bot: ResourceRef::new("bot"),
                prompt: None,
                role: None,
                require_confirmation: false,
            }],
            collaboration_model: CollaborationModel::Solo,
        };
        let team_row = db
            .create_resource(7, "team", "default", &ResourceSpec::Team(team))
            .unwrap();
        let task_row = db
            .create_task(
                7,
                &TaskDoc {
                    title: "t".into(),
                    team_id: team_row.id,
                    workspace: None,
                    labels: TaskLabels::default(),
                    status: TaskStatusBlock::default(),
                    app_data: json!({}),
                    is_group_chat: false,
                },
            )
            .unwrap();
        let user = db
            .create_subtask(&NewSubtask::user(task_row.id, team_row.id, "hi"))
            .unwrap();
        let assistant = db
            .create_subtask(&NewSubtask::assistant(task_row.id, team_row.id, user.message_id))
            .unwrap();

        let settings = Arc::new(crate::config::Settings::from_env());
        let reducer = TaskReducer::new(db.clone(), bus.clone());
        let engine = Arc::new(StreamingEngine::new(
            db.clone(),
            kv.clone(),
            Arc::new(backend.clone()),
            reducer,
            ShutdownCoordinator::new(),
            settings,
        ));

        Fixture {
            db,
            bus,
            kv,
            backend,
            engine,
            task_id: task_row.id,
            subtask_id: assistant.id,
            message_id: assistant.message_id,
            team_id: team_row.id,
        }
    }

    fn stream_data(f: &Fixture) -> StreamTaskData {
        StreamTaskData {
            task_id: f.task_id,
            subtask_id: f.subtask_id,
            message_id: f.message_id,
            parent_message_id: Some(f.message_id - 1),
            team_id: f.team_id,
            team_owner_id: 7,
            user_id: 7,
            user_name: "ada".into(),
            prompt: "hi".into(),
            new_session: false,
            history_limit: None,
            shell_type: "Chat".into(),
            is_subscription: false,
            model: None,
            auth_token: String::new(),
            trace: None,
        }
    }

    fn room_emitter(f: &Fixture) -> Arc<dyn EventEmitter> {
        Arc::new(RoomEmitter::new(f.bus.clone(), task_room(f.task_id)))
    }

    #[tokio::test]
    async fn happy_path_streams_chunks_then_completes() {
        let f = fixture();
        f.backend.push_text_response(&["he", "ll", "o"]);
        let mut room = f.bus.subscribe(&task_room(f.task_id));

        let outcome = f
            .engine
            .run_stream(stream_data(&f), room_emitter(&f))
            .await
            .unwrap();
        assert_eq!(outcome, StreamOutcome::Completed { value: "hello".into() });

        // chat:start, three chunks with covering offsets, chat:done.
        let start = room.recv().await.unwrap();
        assert_eq!(start.event, "chat:start");
        let mut seen = Vec::new();
        for _ in 0..3 {
            let chunk = room.recv().await.unwrap();
            assert_eq!(chunk.event, "chat:chunk");
            seen.push((
                chunk.data["content"].as_str().unwrap().to_string(),
                chunk.data["offset"].as_u64().unwrap(),
            ));
        }
        assert_eq!(
            seen,
            vec![
                ("he".to_string(), 0),
                ("ll".to_string(), 2),
                ("o".to_string(), 4)
            ]
        );
        let done = room.recv().await.unwrap();
        assert_eq!(done.event, "chat:done");
        assert_eq!(done.data["offset"], 5);
        assert_eq!(done.data["result"]["value"], "hello");

        let row = f.db.get_subtask(f.subtask_id).unwrap();
        assert_eq!(row.status, SubtaskStatus::Completed);
        assert_eq!(row.result.unwrap().value, "hello");

        // Reducer completed the task.
        let (_, doc) = f.db.get_task(f.task_id).unwrap();
        assert_eq!(doc.status.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn second_claim_loses_the_race() {
        let f = fixture();
        f.backend.push_text_response(&["x"]);
        f.engine
            .run_stream(stream_data(&f), room_emitter(&f))
            .await
            .unwrap();

        // Subtask is terminal now; another stream attempt must not start.
        let err = f
            .engine
            .run_stream(stream_data(&f), room_emitter(&f))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn cancel_persists_partial_and_emits_cancelled_then_done() {
        let f = fixture();
        f.backend.push_hanging_response(&["par", "tial"]);
        let mut room = f.bus.subscribe(&task_room(f.task_id));

        let engine = Arc::clone(&f.engine);
        let data = stream_data(&f);
        let emitter = room_emitter(&f);
        let handle = tokio::spawn(async move { engine.run_stream(data, emitter).await });

        // Drain start + two chunks, then cancel.
        for _ in 0..3 {
            room.recv().await.unwrap();
        }
        assert!(f.engine.request_cancel(f.subtask_id).await.unwrap());

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, StreamOutcome::Cancelled { partial: "partial".into() });

        let cancelled = room.recv().await.unwrap();
        assert_eq!(cancelled.event, "chat:cancelled");
        let done = room.recv().await.unwrap();
        assert_eq!(done.event, "chat:done");
        assert_eq!(done.data["result"]["cancelled"], true);

        let row = f.db.get_subtask(f.subtask_id).unwrap();
        assert_eq!(row.status, SubtaskStatus::Completed);
        let result = row.result.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.value, "partial");

        // Backend got the out-of-band cancel.
        assert!(!f.backend.cancelled_request_ids().is_empty());
    }

    #[tokio::test]
    async fn upstream_error_fails_subtask_and_task() {
        let f = fixture();
        f.backend.push_script(vec![
            Ok(StreamEvent::ContentDelta { text: "par".into() }),
            Err(crate::shell::ShellError::Upstream("model melted".into())),
        ]);
        let mut room = f.bus.subscribe(&task_room(f.task_id));

        let outcome = f
            .engine
            .run_stream(stream_data(&f), room_emitter(&f))
            .await
            .unwrap();
        assert!(matches!(outcome, StreamOutcome::Failed { .. }));

        room.recv().await.unwrap(); // chat:start
        room.recv().await.unwrap(); // chunk
        let error = room.recv().await.unwrap();
        assert_eq!(error.event, "chat:error");

        let row = f.db.get_subtask(f.subtask_id).unwrap();
        assert_eq!(row.status, SubtaskStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some("model melted"));
        // Partial text is preserved.
        assert_eq!(row.result.unwrap().value, "par");

        let (_, doc) = f.db.get_task(f.task_id).unwrap();
        assert_eq!(doc.status.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn tool_loop_bound_fails_stream() {
        let f = fixture();
        let mut script: Vec<Result<StreamEvent, crate::shell::ShellError>> = Vec::new();
        let limit = crate::config::Settings::from_env().chat_tool_max_requests;
        for i in 0..=limit {
            script.push(Ok(StreamEvent::ToolStart {
                run_id: format!("r{i}"),
                tool_name: "search".into(),
                title: None,
                input: None,
            }));
        }
        f.backend.push_script(script);

        let outcome = f
            .engine
            .run_stream(stream_data(&f), room_emitter(&f))
            .await
            .unwrap();
        let StreamOutcome::Failed { message } = outcome else {
            panic!("expected failure");
        };
        assert!(message.contains("tool iteration limit"));
    }

    #[tokio::test]
    async fn resume_returns_cached_suffix() {
        let f = fixture();
        f.kv.cache_stream_content(f.subtask_id, "hello").unwrap();

        assert_eq!(
            f.engine.resume_chunk(f.subtask_id, 2).unwrap().as_deref(),
            Some("llo")
        );
        assert!(f.engine.resume_chunk(f.subtask_id, 5).unwrap().is_none());
        assert!(f.engine.resume_chunk(999, 0).unwrap().is_none());
    }

    #[tokio::test]
    async fn new_session_skips_history() {
        let f = fixture();
        f.backend.push_text_response(&["ok"]);

        let mut data = stream_data(&f);
        data.new_session = true;
        f.engine.run_stream(data, room_emitter(&f)).await.unwrap();

        let requests = f.backend.requests();
        assert!(requests[0].history.is_empty());
    }
}
