//! Task-state reducer.
//!
//! Aggregates subtask status into task status. The decision itself is the
//! pure [`transition::reduce`]; this module loads the inputs, persists the
//! outcome, creates pipeline stages, and emits `task:status` (plus the
//! terminal `chat:done` mirror) to the task's rooms.

pub mod transition;

#[cfg(test)]
mod proptests;

pub use transition::{NextStage, Reduction, TaskView};

use crate::bus::EventBus;
use crate::events::{task_room, user_room, Envelope};
use crate::store::resources::{CollaborationModel, ResourceSpec, TeamSpec};
use crate::store::subtasks::NewSubtask;
use crate::store::{
    Database, ResourceKind, StoreError, StoreResult, SubtaskRole, SubtaskRow, SubtaskStatus,
    TaskStatus,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Best-effort teardown of executor resources once a task is terminal.
#[async_trait]
pub trait ExecutorCleanup: Send + Sync {
    async fn delete_executor(&self, executor_name: &str, executor_namespace: &str);
}

/// What to do with a stage awaiting confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmAction {
    /// Proceed to the next stage with the confirmed prompt.
    Continue,
    /// Rerun the current stage with the revised prompt.
    Retry,
}

/// Result of a confirmation, pointing at the stage that will run next.
#[derive(Debug, Clone)]
pub struct ConfirmOutcome {
    pub subtask_id: i64,
    pub message_id: i64,
}

#[derive(Clone)]
pub struct TaskReducer {
    db: Database,
    bus: EventBus,
    cleanup: Option<Arc<dyn ExecutorCleanup>>,
}

impl TaskReducer {
    pub fn new(db: Database, bus: EventBus) -> Self {
        Self {
            db,
            bus,
            cleanup: None,
        }
    }

    pub fn with_cleanup(mut self, cleanup: Arc<dyn ExecutorCleanup>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    /// Recompute and persist the task's status after a subtask update.
    pub fn apply(&self, task_id: i64) -> StoreResult<Reduction> {
        let (task_row, doc) = self.db.get_task(task_id)?;
        let subtasks = self.db.list_subtasks(task_id)?;
        let view = self.task_view(task_id, doc.status.status, doc.team_id)?;

        let reduction = transition::reduce(&view, &subtasks);

        self.db.update_task(task_id, |d| {
            d.status.status = reduction.status;
            d.status.progress = reduction.progress;
            d.status.error_message = reduction.error_message.clone();
            if reduction.result.is_some() {
                d.status.result = reduction.result.clone();
            }
            if reduction.completed && d.status.completed_at.is_none() {
                d.status.completed_at = Some(chrono::Utc::now());
            }
        })?;

        if let Some(next) = &reduction.next_stage {
            self.create_stage(task_id, &subtasks, next)?;
        }

        let status_event = Envelope::task_status(
            task_id,
            reduction.status,
            reduction.progress,
            reduction.error_message.as_deref(),
        );
        self.bus
            .publish(&user_room(task_row.owner_id), status_event.clone());
        self.bus.publish(&task_room(task_id), status_event);

        if reduction.status.is_terminal() {
            if let Some(subtask_id) = reduction.mirror_done_for {
                self.mirror_done(&subtasks, subtask_id);
            }
            self.teardown_executor(&subtasks);
            if let Some(execution_id) = doc.labels.execution_id {
                self.finish_execution(execution_id, &reduction);
            }
        }

        tracing::info!(
            task_id,
            status = %reduction.status,
            progress = reduction.progress,
            "task reduced"
        );
        Ok(reduction)
    }

    /// Handle a pipeline confirmation.
    pub fn confirm(
        &self,
        task_id: i64,
        confirmed_prompt: &str,
        action: ConfirmAction,
    ) -> StoreResult<ConfirmOutcome> {
        let (task_row, doc) = self.db.get_task(task_id)?;
        if doc.status.status != TaskStatus::PendingConfirmation {
            return Err(StoreError::Conflict(format!(
                "task {task_id} is {} and cannot be confirmed",
                doc.status.status
            )));
        }

        let subtasks = self.db.list_subtasks(task_id)?;
        let last = subtasks
            .iter()
            .rev()
            .find(|s| s.role == SubtaskRole::Assistant && s.status == SubtaskStatus::Completed)
            .ok_or_else(|| StoreError::Conflict("no completed stage to confirm".into()))?;

        let outcome = match action {
            ConfirmAction::Continue => {
                let mut new = NewSubtask::assistant(task_id, last.team_id, last.message_id);
                new.message_id = Some(last.message_id + 1);
                new.prompt = confirmed_prompt.to_string();
                new.new_session = true;
                new.bot_ids = last.bot_ids.clone();
                new.executor_name = last.executor_name.clone();
                new.executor_namespace = last.executor_namespace.clone();
                let row = self.db.create_subtask(&new)?;
                ConfirmOutcome {
                    subtask_id: row.id,
                    message_id: row.message_id,
                }
            }
            ConfirmAction::Retry => {
                if !self
                    .db
                    .reset_subtask_for_confirmation(last.id, confirmed_prompt)?
                {
                    return Err(StoreError::Conflict(format!(
                        "stage subtask {} cannot be rerun",
                        last.id
                    )));
                }
                ConfirmOutcome {
                    subtask_id: last.id,
                    message_id: last.message_id,
                }
            }
        };

        self.db.update_task(task_id, |d| {
            d.status.status = TaskStatus::Running;
            d.status.error_message = None;
        })?;

        let ev = Envelope::task_status(task_id, TaskStatus::Running, doc.status.progress, None);
        self.bus.publish(&user_room(task_row.owner_id), ev.clone());
        self.bus.publish(&task_room(task_id), ev);

        Ok(outcome)
    }

    fn task_view(
        &self,
        task_id: i64,
        status: TaskStatus,
        team_id: i64,
    ) -> StoreResult<TaskView> {
        let team = self.team_spec(team_id);
        let (collaboration, member_confirmation) = match team {
            Some(spec) => (
                spec.collaboration_model,
                spec.members.iter().map(|m| m.require_confirmation).collect(),
            ),
            None => (CollaborationModel::Solo, Vec::new()),
        };
        Ok(TaskView {
            task_id,
            status,
            collaboration,
            member_confirmation,
        })
    }

    fn team_spec(&self, team_id: i64) -> Option<TeamSpec> {
        let row = self.db.get_resource(team_id).ok()?;
        if row.kind != ResourceKind::Team {
            return None;
        }
        match row.spec() {
            Ok(ResourceSpec::Team(spec)) => Some(spec),
            _ => None,
        }
    }

    /// Create the next pipeline stage. Creation is keyed on `(task_id,
    /// message_id)`, so re-applying the same reduction is a no-op.
    fn create_stage(
        &self,
        task_id: i64,
        subtasks: &[SubtaskRow],
        next: &NextStage,
    ) -> StoreResult<()> {
        let team_id = subtasks.first().map_or(0, |s| s.team_id);
        let mut new = NewSubtask::assistant(task_id, team_id, next.parent_message_id);
        new.message_id = Some(next.message_id);
        new.bot_ids = next.bot_ids.clone();
        new.executor_name = next.executor_name.clone();
        new.executor_namespace = next.executor_namespace.clone();

        match self.db.create_subtask(&new) {
            Ok(row) => {
                tracing::info!(task_id, subtask_id = row.id, message_id = row.message_id, "pipeline stage created");
                Ok(())
            }
            Err(StoreError::Conflict(_)) => Ok(()), // stage already exists
            Err(e) => Err(e),
        }
    }

    /// Re-emit the final message of the deciding subtask so subscribers who
    /// joined late still see it.
    fn mirror_done(&self, subtasks: &[SubtaskRow], subtask_id: i64) {
        let Some(subtask) = subtasks.iter().find(|s| s.id == subtask_id) else {
            return;
        };
        let result = subtask.result.clone().unwrap_or_default();
        let offset = result.value.len();
        self.bus.publish(
            &task_room(subtask.task_id),
            Envelope::chat_done(
                subtask.task_id,
                subtask.id,
                subtask.message_id,
                offset,
                &result,
            ),
        );
    }

    /// Tasks spawned by the trigger scheduler carry their execution id in
    /// the labels; terminal reductions close that execution out.
    fn finish_execution(&self, execution_id: i64, reduction: &Reduction) {
        let status = match reduction.status {
            TaskStatus::Completed => crate::store::ExecutionStatus::Completed,
            TaskStatus::Cancelled => crate::store::ExecutionStatus::Cancelled,
            _ => crate::store::ExecutionStatus::Failed,
        };
        if let Err(e) = self.db.update_execution_status(
            execution_id,
            status,
            reduction.error_message.as_deref(),
        ) {
            tracing::warn!(execution_id, error = %e, "failed to close background execution");
        }
    }

    fn teardown_executor(&self, subtasks: &[SubtaskRow]) {
        let Some(cleanup) = &self.cleanup else { return };
        let Some(bound) = subtasks
            .iter()
            .rev()
            .find(|s| s.executor_name.is_some())
        else {
            return;
        };
        let (Some(name), namespace) = (
            bound.executor_name.clone(),
            bound.executor_namespace.clone().unwrap_or_default(),
        ) else {
            return;
        };
        let cleanup = Arc::clone(cleanup);
        tokio::spawn(async move {
            cleanup.delete_executor(&name, &namespace).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::resources::{TaskDoc, TaskLabels, TeamMember, ResourceRef};
    use crate::store::TaskStatusBlock;
    use serde_json::json;

    fn setup(members: &[(bool,)], collaboration: CollaborationModel) -> (Database, EventBus, i64) {
        let db = Database::open_in_memory().unwrap();
        let team = TeamSpec {
            members: members
                .iter()
                .map(|(confirm,)| TeamMember {
                    bot: ResourceRef::new("bot"),
                    prompt: None,
                    role: None,
                    require_confirmation: *confirm,
                })
                .collect(),
            collaboration_model: collaboration,
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
                    status: TaskStatusBlock {
                        status: TaskStatus::Running,
                        ..TaskStatusBlock::default()
                    },
                    app_data: json!({}),
                    is_group_chat: false,
                },
            )
            .unwrap();
        (db, EventBus::new(), task_row.id)
    }

    fn seed_round(db: &Database, task_id: i64) -> (SubtaskRow, SubtaskRow) {
        let user = db.create_subtask(&NewSubtask::user(task_id, 1, "plan")).unwrap();
        let assistant = db
            .create_subtask(&NewSubtask::assistant(task_id, 1, user.message_id))
            .unwrap();
        (user, assistant)
    }

    #[tokio::test]
    async fn completed_stage_with_confirmation_pauses_task() {
        let (db, bus, task_id) = setup(&[(true,), (false,)], CollaborationModel::Pipeline);
        let (_, assistant) = seed_round(&db, task_id);
        db.claim_subtask(assistant.id).unwrap();
        db.update_subtask_status(
            assistant.id,
            SubtaskStatus::Completed,
            100,
            Some(&crate::store::SubtaskResult::text("DRAFT")),
            None,
        )
        .unwrap();

        let reducer = TaskReducer::new(db.clone(), bus);
        let reduction = reducer.apply(task_id).unwrap();
        assert_eq!(reduction.status, TaskStatus::PendingConfirmation);

        // No stage 2 yet.
        assert_eq!(db.list_subtasks(task_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn confirm_continue_creates_fresh_session_stage() {
        let (db, bus, task_id) = setup(&[(true,), (false,)], CollaborationModel::Pipeline);
        let (_, assistant) = seed_round(&db, task_id);
        db.claim_subtask(assistant.id).unwrap();
        db.update_subtask_status(
            assistant.id,
            SubtaskStatus::Completed,
            100,
            Some(&crate::store::SubtaskResult::text("DRAFT")),
            None,
        )
        .unwrap();

        let reducer = TaskReducer::new(db.clone(), bus);
        reducer.apply(task_id).unwrap();
        let outcome = reducer
            .confirm(task_id, "DRAFT refined", ConfirmAction::Continue)
            .unwrap();

        let stage2 = db.get_subtask(outcome.subtask_id).unwrap();
        assert_eq!(stage2.message_id, assistant.message_id + 1);
        assert_eq!(stage2.parent_id, Some(assistant.message_id));
        assert_eq!(stage2.prompt, "DRAFT refined");
        assert!(stage2.new_session);
        assert_eq!(stage2.status, SubtaskStatus::Pending);

        let (_, doc) = db.get_task(task_id).unwrap();
        assert_eq!(doc.status.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn confirm_retry_reruns_same_stage() {
        let (db, bus, task_id) = setup(&[(true,), (false,)], CollaborationModel::Pipeline);
        let (_, assistant) = seed_round(&db, task_id);
        db.claim_subtask(assistant.id).unwrap();
        db.update_subtask_status(assistant.id, SubtaskStatus::Completed, 100, None, None)
            .unwrap();

        let reducer = TaskReducer::new(db.clone(), bus);
        reducer.apply(task_id).unwrap();
        let outcome = reducer
            .confirm(task_id, "try harder", ConfirmAction::Retry)
            .unwrap();
        assert_eq!(outcome.subtask_id, assistant.id);

        let row = db.get_subtask(assistant.id).unwrap();
        assert_eq!(row.status, SubtaskStatus::Pending);
        assert_eq!(row.prompt, "try harder");
        assert!(row.new_session);
    }

    #[tokio::test]
    async fn confirm_outside_pending_confirmation_conflicts() {
        let (db, bus, task_id) = setup(&[(false,)], CollaborationModel::Solo);
        let reducer = TaskReducer::new(db, bus);
        assert!(matches!(
            reducer.confirm(task_id, "x", ConfirmAction::Continue),
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn apply_twice_is_idempotent() {
        let (db, bus, task_id) = setup(&[(false,), (false,)], CollaborationModel::Pipeline);
        let (_, assistant) = seed_round(&db, task_id);
        db.claim_subtask(assistant.id).unwrap();
        db.update_subtask_status(assistant.id, SubtaskStatus::Completed, 100, None, None)
            .unwrap();

        let reducer = TaskReducer::new(db.clone(), bus);
        reducer.apply(task_id).unwrap();
        reducer.apply(task_id).unwrap();

        // Stage 2 created exactly once despite re-application.
        let assistants: Vec<_> = db
            .list_subtasks(task_id)
            .unwrap()
            .into_iter()
            .filter(|s| s.role == SubtaskRole::Assistant)
            .collect();
        assert_eq!(assistants.len(), 2);
    }

    #[tokio::test]
    async fn terminal_reduction_emits_status_and_mirror() {
        let (db, bus, task_id) = setup(&[(false,)], CollaborationModel::Solo);
        let (_, assistant) = seed_round(&db, task_id);
        db.claim_subtask(assistant.id).unwrap();
        db.update_subtask_status(
            assistant.id,
            SubtaskStatus::Completed,
            100,
            Some(&crate::store::SubtaskResult::text("hello")),
            None,
        )
        .unwrap();

        let mut room = bus.subscribe(&task_room(task_id));
        let reducer = TaskReducer::new(db, bus.clone());
        reducer.apply(task_id).unwrap();

        let first = room.recv().await.unwrap();
        assert_eq!(first.event, "task:status");
        assert_eq!(first.data["status"], "COMPLETED");
        let second = room.recv().await.unwrap();
        assert_eq!(second.event, "chat:done");
        assert_eq!(second.data["result"]["value"], "hello");
    }
}
