//! Execution of one subscription firing.
//!
//! Prepares (or reuses) the task and its turn subtasks, links the
//! execution row, then either streams in-process (direct-chat teams,
//! behind the circuit breaker with retries) or leaves the assistant
//! PENDING for the dispatcher.

use super::TriggerScheduler;
use crate::dispatch::model::resolve_model;
use crate::store::resources::{ResourceSpec, SubscriptionDoc, TaskDoc, TaskLabels, TaskType};
use crate::store::subtasks::NewSubtask;
use crate::store::{ExecutionStatus, ResourceKind, StoreError, TaskStatus, TaskStatusBlock};
use crate::streaming::{StreamOutcome, StreamTaskData, SubscriptionEmitter};
use crate::telemetry::TraceContext;
use crate::title;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

const RETRY_BASE_MS: u64 = 2_000;
const RETRY_JITTER_MS: u64 = 1_000;

/// How the prepared execution will run.
enum ExecutionPath {
    /// In-process stream with the given payload.
    Direct(Box<StreamTaskData>),
    /// Executor-backed; the dispatcher and reducer own the rest.
    Executor,
}

struct Prepared {
    path: ExecutionPath,
    subtask_id: i64,
}

impl TriggerScheduler {
    /// Run one execution end to end, including retries and dead-lettering.
    pub async fn execute_subscription(self: Arc<Self>, subscription_id: i64, execution_id: i64) {
        let prepared = match self.prepare(subscription_id, execution_id) {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!(subscription_id, execution_id, error = %e, "execution setup failed");
                let _ = self.db.update_execution_status(
                    execution_id,
                    ExecutionStatus::Failed,
                    Some(&e.to_string()),
                );
                return;
            }
        };

        let data = match prepared.path {
            ExecutionPath::Executor => return,
            ExecutionPath::Direct(data) => *data,
        };

        let max_attempts = self.settings.flow_default_retry_count.max(1);
        let mut attempt: u32 = 0;
        loop {
            if self.breaker.is_open() {
                let _ = self.db.update_execution_status(
                    execution_id,
                    ExecutionStatus::Failed,
                    Some("AI circuit breaker open; execution skipped during cooldown"),
                );
                return;
            }

            let emitter = Arc::new(SubscriptionEmitter::new(self.db.clone(), execution_id));
            let outcome = self.streaming.run_stream(data.clone(), emitter).await;

            let error = match outcome {
                Ok(StreamOutcome::Completed { .. }) | Ok(StreamOutcome::Cancelled { .. }) => {
                    self.breaker.record_success();
                    return;
                }
                Ok(StreamOutcome::Failed { message }) => message,
                Err(e) => e.to_string(),
            };
            self.breaker.record_failure();
            attempt += 1;

            if attempt >= max_attempts {
                let _ = self.db.update_execution_status(
                    execution_id,
                    ExecutionStatus::Failed,
                    Some(&error),
                );
                let _ = self.db.insert_dead_letter(
                    subscription_id,
                    execution_id,
                    &error,
                    &serde_json::json!({
                        "task_id": data.task_id,
                        "subtask_id": data.subtask_id,
                        "attempts": attempt,
                    }),
                );
                tracing::error!(
                    subscription_id,
                    execution_id,
                    attempts = attempt,
                    error = %error,
                    "execution dead-lettered"
                );
                return;
            }

            // Exponential backoff with jitter, then rearm the subtask.
            let backoff = RETRY_BASE_MS * 2u64.pow(attempt - 1)
                + rand::thread_rng().gen_range(0..RETRY_JITTER_MS);
            tokio::time::sleep(Duration::from_millis(backoff)).await;

            let _ = self.db.increment_execution_retry(execution_id);
            let _ = self.db.reset_subtask_for_retry(prepared.subtask_id);
            let _ = self
                .db
                .update_execution_status(execution_id, ExecutionStatus::Running, None);
            tracing::warn!(
                subscription_id,
                execution_id,
                attempt,
                "retrying subscription execution"
            );
        }
    }

    /// Create or reuse the task, seed the turn subtasks, and link the
    /// execution.
    fn prepare(&self, subscription_id: i64, execution_id: i64) -> Result<Prepared, StoreError> {
        let (sub_row, doc) = self
            .subscription(subscription_id)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {subscription_id}")))?;
        let doc = self.overlay_rental(doc);
        let user_id = sub_row.owner_id;

        // Reuse the bound task only when history is preserved and the task
        // still exists.
        let existing = doc
            .preserve_history
            .then_some(doc.internal.bound_task_id)
            .flatten()
            .and_then(|task_id| self.db.get_task(task_id).ok());

        let (task_id, team_id) = match existing {
            Some((row, task_doc)) => {
                self.db.update_task(row.id, |d| {
                    d.labels.execution_id = Some(execution_id);
                    if !d.status.status.is_terminal() {
                        return;
                    }
                    // Rearm a finished task for the new firing.
                    d.status.status = TaskStatus::Pending;
                    d.status.progress = 0;
                    d.status.completed_at = None;
                    d.status.error_message = None;
                })?;
                (row.id, task_doc.team_id)
            }
            None => {
                let task_row = self.db.create_task(
                    user_id,
                    &TaskDoc {
                        title: title::derive_title(&doc.prompt),
                        team_id: doc.team_id,
                        workspace: doc.workspace.clone(),
                        labels: TaskLabels {
                            task_type: TaskType::Subscription,
                            source: Some("subscription".into()),
                            user_interacted: false,
                            subscription_id: Some(subscription_id),
                            execution_id: Some(execution_id),
                            model_id: doc.model_id.clone(),
                            force_override_bot_model: false,
                        },
                        status: TaskStatusBlock::default(),
                        app_data: serde_json::json!({}),
                        is_group_chat: false,
                    },
                )?;
                self.db.update_json(subscription_id, |json| {
                    if let Some(obj) = json.as_object_mut() {
                        let internal = obj
                            .entry("_internal")
                            .or_insert_with(|| serde_json::json!({}));
                        internal["boundTaskId"] = serde_json::json!(task_row.id);
                    }
                    Ok(())
                })?;
                (task_row.id, doc.team_id)
            }
        };

        let user_turn = self
            .db
            .create_subtask(&NewSubtask::user(task_id, team_id, doc.prompt.clone()))?;
        let assistant = self
            .db
            .create_subtask(&NewSubtask::assistant(task_id, team_id, user_turn.message_id))?;

        self.db.link_execution_task(execution_id, task_id)?;
        self.db
            .update_execution_status(execution_id, ExecutionStatus::Running, None)?;

        let direct = self.team_is_direct_chat(team_id, sub_row.owner_id);
        if !direct {
            return Ok(Prepared {
                path: ExecutionPath::Executor,
                subtask_id: assistant.id,
            });
        }

        let bot = self.first_bot(team_id, sub_row.owner_id);
        let labels = TaskLabels {
            model_id: doc.model_id.clone(),
            ..TaskLabels::default()
        };
        let model = resolve_model(
            &self.db,
            &self.settings.secret_encryption_key,
            user_id,
            &labels,
            bot.as_ref(),
        );

        let data = StreamTaskData {
            task_id,
            subtask_id: assistant.id,
            message_id: assistant.message_id,
            parent_message_id: assistant.parent_id,
            team_id,
            team_owner_id: sub_row.owner_id,
            user_id,
            user_name: format!("user-{user_id}"),
            prompt: doc.prompt.clone(),
            new_session: false,
            history_limit: doc
                .preserve_history
                .then_some(doc.history_message_count as usize),
            shell_type: "Chat".to_string(),
            is_subscription: true,
            model,
            auth_token: String::new(),
            trace: Some(TraceContext::new_root()),
        };

        Ok(Prepared {
            path: ExecutionPath::Direct(Box::new(data)),
            subtask_id: assistant.id,
        })
    }

    /// Rentals run the source subscription's team/prompt/workspace with
    /// this instance's trigger and model. History is never preserved
    /// across the rental boundary.
    fn overlay_rental(&self, doc: SubscriptionDoc) -> SubscriptionDoc {
        let Some(source_id) = doc.rental_of else {
            return doc;
        };
        let Some((_, source)) = self.subscription(source_id) else {
            tracing::warn!(source_id, "rental source subscription missing, using own spec");
            return doc;
        };
        SubscriptionDoc {
            team_id: source.team_id,
            prompt: source.prompt,
            workspace: source.workspace,
            preserve_history: false,
            history_message_count: 0,
            ..doc
        }
    }

    fn team_is_direct_chat(&self, team_id: i64, owner: i64) -> bool {
        self.first_bot(team_id, owner)
            .and_then(|bot| {
                self.db
                    .get_with_fallback(owner, ResourceKind::Shell, &bot.shell.name, &bot.shell.namespace)
                    .ok()
                    .flatten()
            })
            .and_then(|row| match row.spec() {
                Ok(ResourceSpec::Shell(shell)) => Some(shell.is_direct_chat()),
                _ => None,
            })
            .unwrap_or(false)
    }

    fn first_bot(
        &self,
        team_id: i64,
        owner: i64,
    ) -> Option<crate::store::resources::BotSpec> {
        let team_row = self.db.get_resource(team_id).ok()?;
        let ResourceSpec::Team(team) = team_row.spec().ok()? else {
            return None;
        };
        let member = team.members.first()?;
        let bot_row = self
            .db
            .get_with_fallback(owner, ResourceKind::Bot, &member.bot.name, &member.bot.namespace)
            .ok()
            .flatten()?;
        match bot_row.spec().ok()? {
            ResourceSpec::Bot(bot) => Some(bot),
            _ => None,
        }
    }
}
