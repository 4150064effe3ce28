//! Dispatcher: selects pending work for executor-backed shells and hands
//! it off over HTTP.
//!
//! Direct-chat (`Chat` shell) teams never pass through here — they stream
//! in-process. Everything else is claimed with a conditional update and
//! delivered as a dispatch unit; a lost hand-off releases the claim so the
//! next scan retries.

pub mod executor;
pub mod model;
pub mod payload;

pub use executor::{ExecutorClient, ExecutorError};
pub use payload::{DispatchBot, DispatchUnit, DispatchUser};

use crate::auth;
use crate::bus::EventBus;
use crate::config::Settings;
use crate::events::{task_room, Envelope};
use crate::shutdown::ShutdownCoordinator;
use crate::store::resources::{
    BotSpec, CollaborationModel, GhostSpec, ResourceSpec, ShellSpec, TaskDoc, TaskType, TeamSpec,
};
use crate::store::{
    Database, ResourceKind, ResourceRow, StoreResult, SubtaskRole, SubtaskRow, SubtaskStatus,
    TaskStatus,
};
use crate::telemetry::RequestContext;
use chrono::Timelike;
use std::sync::Arc;

/// Label predicate for candidate selection.
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub task_types: Vec<TaskType>,
    pub exclude_source: Option<String>,
}

impl TaskFilter {
    pub fn online() -> Self {
        Self {
            task_types: vec![TaskType::Online, TaskType::Subscription, TaskType::Flow],
            exclude_source: Some("chat_shell".to_string()),
        }
    }

    pub fn offline() -> Self {
        Self {
            task_types: vec![TaskType::Offline],
            exclude_source: Some("chat_shell".to_string()),
        }
    }

    fn matches(&self, doc: &TaskDoc) -> bool {
        if !self.task_types.contains(&doc.labels.task_type) {
            return false;
        }
        if let (Some(excluded), Some(source)) = (&self.exclude_source, &doc.labels.source) {
            if source == excluded {
                return false;
            }
        }
        true
    }
}

/// Summary of one successful hand-off.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub task_id: i64,
    pub subtask_id: i64,
    pub executor_name: String,
}

pub struct Dispatcher {
    db: Database,
    bus: EventBus,
    executor: Arc<ExecutorClient>,
    settings: Arc<Settings>,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        bus: EventBus,
        executor: Arc<ExecutorClient>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            db,
            bus,
            executor,
            settings,
        }
    }

    /// One dispatch pass. With `task_ids`, each named task is processed and
    /// `limit` is ignored; otherwise up to `limit` label-matching tasks are
    /// considered. Returns the successfully handed-off units.
    pub async fn dispatch(
        &self,
        filter: &TaskFilter,
        limit: usize,
        task_ids: Option<&[i64]>,
        ctx: &RequestContext,
    ) -> StoreResult<Vec<DispatchOutcome>> {
        let span = tracing::info_span!("dispatch", limit, targeted = task_ids.is_some());

        // Selection and claiming are synchronous; the span guard must not
        // be held across the hand-off await below.
        let claimed: Vec<(SubtaskRow, DispatchUnit, String)> = {
            let _enter = span.enter();
            let candidates = self.candidates(filter, limit, task_ids)?;

            let mut claimed = Vec::new();
            for (task_row, doc) in candidates {
                match self.claim_next(&task_row, &doc) {
                    Ok(Some((subtask, mut unit, shell_type))) => {
                        // Fire-and-forget hand-off: the trace context rides
                        // in the payload so the executor can rejoin the
                        // trace.
                        unit.trace_context = ctx
                            .trace
                            .as_ref()
                            .map(crate::telemetry::TraceContext::child);
                        claimed.push((subtask, unit, shell_type));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(task_id = task_row.id, error = %e, "skipping task during dispatch");
                    }
                }
            }
            claimed
        };

        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        let units: Vec<DispatchUnit> = claimed.iter().map(|(_, unit, _)| unit.clone()).collect();
        if let Err(e) = self.executor.dispatch(&units, &ctx.child()).await {
            tracing::error!(error = %e, count = units.len(), "dispatch hand-off failed, releasing claims");
            for (subtask, _, _) in &claimed {
                let _ = self.db.release_claim(subtask.id);
            }
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::with_capacity(claimed.len());
        for (subtask, unit, shell_type) in claimed {
            self.db
                .bind_subtask_executor(subtask.id, &unit.executor_name, &unit.executor_namespace)?;
            self.bus.publish(
                &task_room(subtask.task_id),
                Envelope::chat_start(
                    subtask.task_id,
                    subtask.id,
                    subtask.message_id,
                    &shell_type,
                ),
            );
            tracing::info!(
                task_id = subtask.task_id,
                subtask_id = subtask.id,
                executor = %unit.executor_name,
                "subtask dispatched"
            );
            outcomes.push(DispatchOutcome {
                task_id: subtask.task_id,
                subtask_id: subtask.id,
                executor_name: unit.executor_name,
            });
        }
        Ok(outcomes)
    }

    /// Move a task to CANCELLING and nudge the executor. The authoritative
    /// CANCELLED transition arrives via the callback. Cancel after a
    /// terminal status is absorbed.
    pub async fn cancel(&self, task_id: i64) -> StoreResult<()> {
        let (task_row, doc) = self.db.get_task(task_id)?;
        if doc.status.status.is_terminal() {
            return Ok(());
        }
        self.db.update_task(task_id, |d| {
            d.status.status = TaskStatus::Cancelling;
        })?;
        let ev = Envelope::task_status(task_id, TaskStatus::Cancelling, doc.status.progress, None);
        self.bus.publish(&task_room(task_id), ev.clone());
        self.bus
            .publish(&crate::events::user_room(task_row.owner_id), ev);

        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            if let Err(e) = executor.cancel(task_id).await {
                tracing::debug!(task_id, error = %e, "executor cancel push failed");
            }
        });
        Ok(())
    }

    /// Periodic scan driving the online/offline quotas and pipeline
    /// follow-ups.
    pub async fn run_loop(self: Arc<Self>, shutdown: Arc<ShutdownCoordinator>) {
        tracing::info!(
            interval_secs = self.settings.task_fetch_interval.as_secs(),
            "dispatcher loop started"
        );
        loop {
            if !shutdown.is_accepting() {
                break;
            }
            let ctx = RequestContext::new_root();

            let online_running = self.count_running(&TaskFilter::online());
            let online_slots = self
                .settings
                .max_concurrent_tasks
                .saturating_sub(online_running)
                .min(10);
            if online_slots > 0 {
                if let Err(e) = self
                    .dispatch(&TaskFilter::online(), online_slots, None, &ctx)
                    .await
                {
                    tracing::error!(error = %e, "online dispatch pass failed");
                }
            }

            let hour = chrono::Local::now().hour();
            if self.settings.offline_window_open(hour) {
                let offline_running = self.count_running(&TaskFilter::offline());
                let offline_slots = self
                    .settings
                    .max_offline_concurrent_tasks
                    .saturating_sub(offline_running)
                    .min(10);
                if offline_slots > 0 {
                    if let Err(e) = self
                        .dispatch(&TaskFilter::offline(), offline_slots, None, &ctx)
                        .await
                    {
                        tracing::error!(error = %e, "offline dispatch pass failed");
                    }
                }
            }

            // Pipeline tasks already running may have grown a fresh stage.
            match self.running_pipeline_task_ids() {
                Ok(ids) if !ids.is_empty() => {
                    if let Err(e) = self
                        .dispatch(&TaskFilter::online(), 0, Some(&ids), &ctx)
                        .await
                    {
                        tracing::error!(error = %e, "pipeline dispatch pass failed");
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "pipeline scan failed"),
            }

            tokio::time::sleep(self.settings.task_fetch_interval).await;
        }
        tracing::info!("dispatcher loop stopped");
    }

    // ==================== Selection ====================

    fn candidates(
        &self,
        filter: &TaskFilter,
        limit: usize,
        task_ids: Option<&[i64]>,
    ) -> StoreResult<Vec<(ResourceRow, TaskDoc)>> {
        if let Some(ids) = task_ids {
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                match self.db.get_task(*id) {
                    Ok(pair) => out.push(pair),
                    Err(e) => tracing::debug!(task_id = id, error = %e, "targeted task unavailable"),
                }
            }
            return Ok(out);
        }

        Ok(self
            .db
            .list_active_tasks()?
            .into_iter()
            .filter(|(_, doc)| {
                matches!(
                    doc.status.status,
                    TaskStatus::Pending | TaskStatus::Running
                ) && filter.matches(doc)
            })
            .take(limit)
            .collect())
    }

    fn count_running(&self, filter: &TaskFilter) -> usize {
        self.db
            .list_active_tasks()
            .map(|tasks| {
                tasks
                    .iter()
                    .filter(|(_, doc)| {
                        doc.status.status == TaskStatus::Running && filter.matches(doc)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    fn running_pipeline_task_ids(&self) -> StoreResult<Vec<i64>> {
        Ok(self
            .db
            .list_active_tasks()?
            .into_iter()
            .filter(|(_, doc)| doc.status.status == TaskStatus::Running)
            .filter(|(_, doc)| {
                self.team_context(doc.team_id)
                    .is_some_and(|(team, _, _, _)| {
                        team.collaboration_model == CollaborationModel::Pipeline
                    })
            })
            .map(|(row, _)| row.id)
            .collect())
    }

    /// Claim at most one pending assistant of this task and build its
    /// dispatch unit. `None` means nothing to do (no pending work, a stream
    /// already running, direct-chat team, or lost claim race).
    fn claim_next(
        &self,
        task_row: &ResourceRow,
        doc: &TaskDoc,
    ) -> StoreResult<Option<(SubtaskRow, DispatchUnit, String)>> {
        let Some((team, members)) = self.team_with_bots(doc.team_id) else {
            return Ok(None);
        };
        // Direct-chat shells stream in-process; never dispatch them.
        let Some((_, _, first_shell)) = members.first() else {
            return Ok(None);
        };
        if first_shell.is_direct_chat() {
            return Ok(None);
        }

        if self.db.any_running_assistant(task_row.id)? {
            return Ok(None);
        }
        let Some(subtask) = self.db.first_pending_assistant(task_row.id)? else {
            return Ok(None);
        };
        if !self.db.claim_subtask(subtask.id)? {
            return Ok(None);
        }
        self.db.promote_task_running(task_row.id)?;

        let subtask = self.db.get_subtask(subtask.id)?;
        let unit = self.build_unit(task_row, doc, &team, &members, &subtask)?;
        let shell_type = first_shell.shell_type.clone();
        Ok(Some((subtask, unit, shell_type)))
    }

    // ==================== Payload build ====================

    #[allow(clippy::type_complexity)]
    fn team_with_bots(
        &self,
        team_id: i64,
    ) -> Option<(TeamSpec, Vec<(ResourceRow, BotSpec, ShellSpec)>)> {
        let (team, owner) = {
            let row = self.db.get_resource(team_id).ok()?;
            let ResourceSpec::Team(spec) = row.spec().ok()? else {
                return None;
            };
            (spec, row.owner_id)
        };

        let mut members = Vec::with_capacity(team.members.len());
        for member in &team.members {
            let bot_row = self
                .db
                .get_with_fallback(owner, ResourceKind::Bot, &member.bot.name, &member.bot.namespace)
                .ok()
                .flatten()?;
            let ResourceSpec::Bot(bot) = bot_row.spec().ok()? else {
                return None;
            };
            let shell_row = self
                .db
                .get_with_fallback(owner, ResourceKind::Shell, &bot.shell.name, &bot.shell.namespace)
                .ok()
                .flatten()?;
            let ResourceSpec::Shell(shell) = shell_row.spec().ok()? else {
                return None;
            };
            members.push((bot_row, bot, shell));
        }
        Some((team, members))
    }

    fn team_context(
        &self,
        team_id: i64,
    ) -> Option<(TeamSpec, ResourceRow, BotSpec, ShellSpec)> {
        let row = self.db.get_resource(team_id).ok()?;
        let ResourceSpec::Team(team) = row.spec().ok()? else {
            return None;
        };
        let member = team.members.first()?.clone();
        let bot_row = self
            .db
            .get_with_fallback(row.owner_id, ResourceKind::Bot, &member.bot.name, &member.bot.namespace)
            .ok()
            .flatten()?;
        let ResourceSpec::Bot(bot) = bot_row.spec().ok()? else {
            return None;
        };
        let shell_row = self
            .db
            .get_with_fallback(row.owner_id, ResourceKind::Shell, &bot.shell.name, &bot.shell.namespace)
            .ok()
            .flatten()?;
        let ResourceSpec::Shell(shell) = shell_row.spec().ok()? else {
            return None;
        };
        Some((team, bot_row, bot, shell))
    }

    fn ghost_for(&self, owner: i64, bot: &BotSpec) -> Option<GhostSpec> {
        let row = self
            .db
            .get_with_fallback(owner, ResourceKind::Ghost, &bot.ghost.name, &bot.ghost.namespace)
            .ok()
            .flatten()?;
        match row.spec().ok()? {
            ResourceSpec::Ghost(ghost) => Some(ghost),
            _ => None,
        }
    }

    fn build_unit(
        &self,
        task_row: &ResourceRow,
        doc: &TaskDoc,
        team: &TeamSpec,
        members: &[(ResourceRow, BotSpec, ShellSpec)],
        subtask: &SubtaskRow,
    ) -> StoreResult<DispatchUnit> {
        let owner = task_row.owner_id;
        let subtasks = self.db.list_subtasks(task_row.id)?;

        // Confirmation stages carry their own prompt and session reset;
        // otherwise the prompt is the user turn plus the previous stage's
        // output.
        let prompt = if subtask.prompt.is_empty() {
            let user_prompt = subtask
                .parent_id
                .and_then(|parent| {
                    subtasks
                        .iter()
                        .find(|s| s.role == SubtaskRole::User && s.message_id == parent)
                })
                .map(|s| s.prompt.clone())
                .unwrap_or_default();
            let previous = subtasks
                .iter()
                .filter(|s| {
                    s.role == SubtaskRole::Assistant
                        && s.status == SubtaskStatus::Completed
                        && s.message_id < subtask.message_id
                })
                .last()
                .and_then(|s| s.result.as_ref())
                .map(|r| r.value.clone())
                .filter(|v| !v.is_empty());
            match previous {
                Some(prev) => format!("{user_prompt}\nPrevious execution result: {prev}"),
                None => user_prompt,
            }
        } else {
            subtask.prompt.clone()
        };

        let attachments = subtask
            .parent_id
            .and_then(|parent| {
                subtasks
                    .iter()
                    .find(|s| s.role == SubtaskRole::User && s.message_id == parent)
            })
            .and_then(|s| s.attachments.clone())
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();

        let subtask_next_id = subtasks
            .iter()
            .find(|s| {
                s.role == SubtaskRole::Assistant
                    && s.status == SubtaskStatus::Pending
                    && s.message_id > subtask.message_id
            })
            .map(|s| s.id);

        let bots: Vec<DispatchBot> = members
            .iter()
            .enumerate()
            .map(|(i, (bot_row, bot, shell))| {
                let ghost = self.ghost_for(owner, bot);
                let member = team.members.get(i);
                DispatchBot {
                    id: bot_row.id,
                    name: bot_row.name.clone(),
                    shell_type: shell.shell_type.clone(),
                    agent_config: bot.agent_config.clone(),
                    system_prompt: ghost
                        .as_ref()
                        .map(|g| g.system_prompt.clone())
                        .unwrap_or_default(),
                    mcp_servers: ghost
                        .as_ref()
                        .map(|g| g.mcp_servers.clone())
                        .unwrap_or_default(),
                    skills: ghost.map(|g| g.skills).unwrap_or_default(),
                    role: member.and_then(|m| m.role.clone()),
                    base_image: bot.base_image.clone(),
                    model: model::resolve_model(
                        &self.db,
                        &self.settings.secret_encryption_key,
                        owner,
                        &doc.labels,
                        Some(bot),
                    ),
                }
            })
            .collect();

        // Executor identity: sticky once a stage has run on one.
        let executor_name = subtask
            .executor_name
            .clone()
            .unwrap_or_else(|| format!("exec-task-{}", task_row.id));
        let executor_namespace = subtask
            .executor_namespace
            .clone()
            .unwrap_or_else(|| "executors".to_string());

        let auth_token = auth::issue_service_token(
            owner,
            &format!("user-{owner}"),
            chrono::Duration::hours(24),
            &self.settings.jwt_secret,
        )
        .unwrap_or_default();

        let workspace = doc.workspace.clone().unwrap_or_default();
        let mode = match team.collaboration_model {
            CollaborationModel::Solo => "solo",
            CollaborationModel::Parallel => "parallel",
            CollaborationModel::Pipeline => "pipeline",
            CollaborationModel::GroupChat => "group_chat",
        };

        Ok(DispatchUnit {
            subtask_id: subtask.id,
            subtask_next_id,
            task_id: task_row.id,
            task_type: doc.labels.task_type.as_str().to_string(),
            executor_name,
            executor_namespace,
            subtask_title: subtask.title.clone(),
            task_title: doc.title.clone(),
            user: DispatchUser {
                id: owner,
                name: format!("user-{owner}"),
                git_domain: workspace.git_domain.clone(),
                git_token: None,
                git_id: None,
                git_login: None,
                git_email: None,
                user_name: format!("user-{owner}"),
            },
            bot: bots,
            team_id: doc.team_id,
            team_namespace: "default".to_string(),
            mode: mode.to_string(),
            git_domain: workspace.git_domain,
            git_repo: workspace.git_repo,
            git_repo_id: workspace.git_repo_id,
            branch_name: workspace.branch_name,
            git_url: workspace.git_url,
            prompt,
            auth_token,
            attachments,
            status: subtask.status.to_string(),
            progress: subtask.progress,
            created_at: subtask.created_at.to_rfc3339(),
            updated_at: subtask.updated_at.to_rfc3339(),
            new_session: subtask.new_session,
            trace_context: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::resources::{ResourceRef, TaskLabels, TeamMember};
    use crate::store::subtasks::NewSubtask;
    use crate::store::TaskStatusBlock;
    use serde_json::json;

    struct Fixture {
        db: Database,
        dispatcher: Dispatcher,
        task_id: i64,
    }

    fn fixture(shell_type: &str, collaboration: CollaborationModel) -> Fixture {
        let db = Database::open_in_memory().unwrap();

        db.create_resource(
            0,
            "shell",
            "default",
            &ResourceSpec::Shell(ShellSpec {
                shell_type: shell_type.to_string(),
                runtime: None,
            }),
        )
        .unwrap();
        db.create_resource(
            0,
            "ghost",
            "default",
            &ResourceSpec::Ghost(GhostSpec {
                system_prompt: "be useful".into(),
                mcp_servers: json!({}),
                skills: vec![],
            }),
        )
        .unwrap();
        db.create_resource(
            0,
            "bot",
            "default",
            &ResourceSpec::Bot(BotSpec {
                ghost: ResourceRef::new("ghost"),
                shell: ResourceRef::new("shell"),
                model_ref: None,
                bind_model: None,
                bind_model_type: crate::store::resources::BindModelScope::Public,
                agent_config: json!({}),
                base_image: None,
            }),
        )
        .unwrap();
        let team_row = db
            .create_resource(
                0,
                "team",
                "default",
                &ResourceSpec::Team(TeamSpec {
                    members: vec![TeamMember {
                        bot: ResourceRef::new("bot"),
                        prompt: None,
                        role: None,
                        require_confirmation: false,
                    }],
                    collaboration_model: collaboration,
                }),
            )
            .unwrap();

        let task_row = db
            .create_task(
                7,
                &TaskDoc {
                    title: "build it".into(),
                    team_id: team_row.id,
                    workspace: None,
                    labels: TaskLabels {
                        task_type: TaskType::Online,
                        source: None,
                        ..TaskLabels::default()
                    },
                    status: TaskStatusBlock::default(),
                    app_data: json!({}),
                    is_group_chat: false,
                },
            )
            .unwrap();
        let user = db
            .create_subtask(&NewSubtask::user(task_row.id, team_row.id, "do the thing"))
            .unwrap();
        db.create_subtask(&NewSubtask::assistant(task_row.id, team_row.id, user.message_id))
            .unwrap();

        let settings = Arc::new(crate::config::Settings::from_env());
        let dispatcher = Dispatcher::new(
            db.clone(),
            EventBus::new(),
            Arc::new(ExecutorClient::new("http://127.0.0.1:1")),
            settings,
        );
        Fixture {
            db,
            dispatcher,
            task_id: task_row.id,
        }
    }

    #[tokio::test]
    async fn failed_hand_off_releases_the_claim() {
        // Executor base URL points nowhere, so the hand-off fails and the
        // claimed subtask must return to PENDING for the next scan.
        let f = fixture("ClaudeCode", CollaborationModel::Solo);
        let ctx = RequestContext::new_root();
        let outcomes = f
            .dispatcher
            .dispatch(&TaskFilter::online(), 10, None, &ctx)
            .await
            .unwrap();
        assert!(outcomes.is_empty());

        let pending = f.db.first_pending_assistant(f.task_id).unwrap();
        assert!(pending.is_some());
    }

    #[tokio::test]
    async fn direct_chat_teams_are_never_dispatched() {
        let f = fixture("Chat", CollaborationModel::Solo);
        let ctx = RequestContext::new_root();
        let outcomes = f
            .dispatcher
            .dispatch(&TaskFilter::online(), 10, None, &ctx)
            .await
            .unwrap();
        assert!(outcomes.is_empty());

        // Subtask untouched: still PENDING, never claimed.
        let pending = f.db.first_pending_assistant(f.task_id).unwrap().unwrap();
        assert_eq!(pending.status, SubtaskStatus::Pending);
    }

    #[tokio::test]
    async fn tasks_with_running_assistant_are_skipped() {
        let f = fixture("ClaudeCode", CollaborationModel::Solo);
        let pending = f.db.first_pending_assistant(f.task_id).unwrap().unwrap();
        f.db.claim_subtask(pending.id).unwrap();

        let (task_row, doc) = f.db.get_task(f.task_id).unwrap();
        let claimed = f.dispatcher.claim_next(&task_row, &doc).unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn unit_prompt_includes_previous_stage_result() {
        let f = fixture("ClaudeCode", CollaborationModel::Pipeline);

        // Finish stage 1 with a result, then add stage 2.
        let stage1 = f.db.first_pending_assistant(f.task_id).unwrap().unwrap();
        f.db.claim_subtask(stage1.id).unwrap();
        f.db.update_subtask_status(
            stage1.id,
            SubtaskStatus::Completed,
            100,
            Some(&crate::store::SubtaskResult::text("stage one output")),
            None,
        )
        .unwrap();
        let mut stage2 = NewSubtask::assistant(f.task_id, stage1.team_id, stage1.parent_id.unwrap());
        stage2.message_id = Some(stage1.message_id + 1);
        f.db.create_subtask(&stage2).unwrap();

        let (task_row, doc) = f.db.get_task(f.task_id).unwrap();
        let (subtask, unit, _) = f.dispatcher.claim_next(&task_row, &doc).unwrap().unwrap();
        assert_eq!(subtask.message_id, stage1.message_id + 1);
        assert_eq!(
            unit.prompt,
            "do the thing\nPrevious execution result: stage one output"
        );
        assert_eq!(unit.mode, "pipeline");
        assert!(!unit.auth_token.is_empty());
    }

    #[tokio::test]
    async fn cancel_after_terminal_is_absorbed() {
        let f = fixture("ClaudeCode", CollaborationModel::Solo);
        f.db.update_task(f.task_id, |d| {
            d.status.status = TaskStatus::Completed;
        })
        .unwrap();

        f.dispatcher.cancel(f.task_id).await.unwrap();
        let (_, doc) = f.db.get_task(f.task_id).unwrap();
        assert_eq!(doc.status.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_moves_running_task_to_cancelling() {
        let f = fixture("ClaudeCode", CollaborationModel::Solo);
        f.db.update_task(f.task_id, |d| {
            d.status.status = TaskStatus::Running;
        })
        .unwrap();

        f.dispatcher.cancel(f.task_id).await.unwrap();
        let (_, doc) = f.db.get_task(f.task_id).unwrap();
        assert_eq!(doc.status.status, TaskStatus::Cancelling);
    }
}
