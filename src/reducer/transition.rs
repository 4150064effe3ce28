//! Pure task-state reduction.
//!
//! Task status is a function of the task's subtasks plus pipeline stage
//! metadata: same inputs, same reduction, no I/O. Effects (persisting the
//! status block, creating the next stage, emitting events) are applied by
//! [`super::TaskReducer`].

use crate::store::resources::CollaborationModel;
use crate::store::{SubtaskRole, SubtaskRow, SubtaskStatus, TaskStatus};
use serde_json::Value;

/// The slice of task state the reduction depends on.
#[derive(Debug, Clone)]
pub struct TaskView {
    pub task_id: i64,
    pub status: TaskStatus,
    pub collaboration: CollaborationModel,
    /// Ordered team members; only the confirmation flag matters here.
    pub member_confirmation: Vec<bool>,
}

/// A pipeline stage to create.
#[derive(Debug, Clone, PartialEq)]
pub struct NextStage {
    pub message_id: i64,
    pub parent_message_id: i64,
    pub executor_name: Option<String>,
    pub executor_namespace: Option<String>,
    pub bot_ids: Vec<i64>,
}

/// Outcome of reducing one task.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub status: TaskStatus,
    pub progress: u8,
    pub error_message: Option<String>,
    pub result: Option<Value>,
    /// Stamp `completed_at`.
    pub completed: bool,
    /// Pipeline stage to create (rule 4b).
    pub next_stage: Option<NextStage>,
    /// Subtask whose final message is mirrored to late subscribers.
    pub mirror_done_for: Option<i64>,
}

impl Reduction {
    fn status(status: TaskStatus, progress: u8) -> Self {
        Self {
            status,
            progress,
            error_message: None,
            result: None,
            completed: false,
            next_stage: None,
            mirror_done_for: None,
        }
    }
}

/// Reduce a task given its ordered subtasks. Rules are evaluated in order;
/// the first match wins.
pub fn reduce(task: &TaskView, subtasks: &[SubtaskRow]) -> Reduction {
    // Rule 1: cancel requested and some subtask already confirmed it.
    if task.status == TaskStatus::Cancelling
        && subtasks.iter().any(|s| s.status == SubtaskStatus::Cancelled)
    {
        let mut r = Reduction::status(TaskStatus::Cancelled, 100);
        r.completed = true;
        r.mirror_done_for = latest_non_pending(subtasks).map(|s| s.id);
        return r;
    }

    let Some(latest) = latest_non_pending(subtasks) else {
        // Nothing has run yet; keep the task where it is.
        return Reduction::status(task.status, 0);
    };

    match latest.status {
        // Rule 2
        SubtaskStatus::Cancelled => {
            let mut r = Reduction::status(TaskStatus::Cancelled, 100);
            r.completed = true;
            r.mirror_done_for = Some(latest.id);
            r
        }
        // Rule 3
        SubtaskStatus::Failed => {
            let mut r = Reduction::status(TaskStatus::Failed, latest.progress);
            r.error_message = latest.error_message.clone();
            r.result = latest
                .result
                .as_ref()
                .and_then(|res| serde_json::to_value(res).ok());
            r.completed = true;
            r.mirror_done_for = Some(latest.id);
            r
        }
        // Rule 4 applies to completed assistant turns; a completed USER
        // turn just means the assistant has not started yet.
        SubtaskStatus::Completed if latest.role == SubtaskRole::Assistant => {
            reduce_completed_assistant(task, subtasks, latest)
        }
        // Rule 5
        _ => reduce_running(subtasks),
    }
}

fn reduce_completed_assistant(
    task: &TaskView,
    subtasks: &[SubtaskRow],
    latest: &SubtaskRow,
) -> Reduction {
    if task.collaboration == CollaborationModel::Pipeline {
        let round = current_round(subtasks);
        // Stage index of the completed assistant within this round.
        let stage = round
            .iter()
            .position(|s| s.id == latest.id)
            .unwrap_or(round.len().saturating_sub(1));
        let stages_total = task.member_confirmation.len();
        let has_next = stage + 1 < stages_total;

        // Rule 4a: stage wants confirmation before handing off.
        if has_next && task.member_confirmation.get(stage).copied().unwrap_or(false) {
            let progress = stage_progress(stage + 1, stages_total);
            return Reduction::status(TaskStatus::PendingConfirmation, progress);
        }

        // Rule 4b: create the next stage and keep running.
        if has_next {
            let first_of_round = round.first().unwrap_or(&latest);
            let mut r = Reduction::status(
                TaskStatus::Running,
                stage_progress(stage + 1, stages_total),
            );
            r.next_stage = Some(NextStage {
                message_id: latest.message_id + 1,
                parent_message_id: latest.message_id,
                executor_name: first_of_round.executor_name.clone(),
                executor_namespace: first_of_round.executor_namespace.clone(),
                bot_ids: latest.bot_ids.clone(),
            });
            return r;
        }
    }

    // Rule 4c: all work done.
    let mut r = Reduction::status(TaskStatus::Completed, 100);
    r.completed = true;
    r.mirror_done_for = Some(latest.id);
    r
}

fn reduce_running(subtasks: &[SubtaskRow]) -> Reduction {
    let mut r = Reduction::status(TaskStatus::Running, 0);
    // Single-subtask tasks mirror that subtask's progress and outcome.
    if let [only] = subtasks {
        r.progress = only.progress;
        r.error_message = only.error_message.clone();
        r.result = only
            .result
            .as_ref()
            .and_then(|res| serde_json::to_value(res).ok());
    }
    r
}

/// Latest subtask (canonical order) that has left PENDING.
fn latest_non_pending(subtasks: &[SubtaskRow]) -> Option<&SubtaskRow> {
    subtasks
        .iter()
        .rev()
        .find(|s| s.status != SubtaskStatus::Pending)
}

/// Assistant subtasks created after the last USER turn, in order.
fn current_round(subtasks: &[SubtaskRow]) -> Vec<&SubtaskRow> {
    let last_user_msg = subtasks
        .iter()
        .rev()
        .find(|s| s.role == SubtaskRole::User)
        .map_or(0, |s| s.message_id);
    subtasks
        .iter()
        .filter(|s| s.role == SubtaskRole::Assistant && s.message_id > last_user_msg)
        .collect()
}

fn stage_progress(stages_done: usize, stages_total: usize) -> u8 {
    if stages_total == 0 {
        return 0;
    }
    let pct = stages_done * 100 / stages_total;
    u8::try_from(pct.min(99)).unwrap_or(99)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SubtaskResult;
    use chrono::Utc;

    pub(crate) fn subtask(
        id: i64,
        message_id: i64,
        role: SubtaskRole,
        status: SubtaskStatus,
    ) -> SubtaskRow {
        SubtaskRow {
            id,
            task_id: 1,
            team_id: 1,
            role,
            bot_ids: vec![],
            title: String::new(),
            prompt: String::new(),
            result: None,
            status,
            progress: 0,
            message_id,
            parent_id: (role == SubtaskRole::Assistant).then(|| message_id - 1),
            executor_name: None,
            executor_namespace: None,
            error_message: None,
            new_session: false,
            attachments: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn task(collaboration: CollaborationModel, confirmations: &[bool]) -> TaskView {
        TaskView {
            task_id: 1,
            status: TaskStatus::Running,
            collaboration,
            member_confirmation: confirmations.to_vec(),
        }
    }

    #[test]
    fn cancelling_task_with_cancelled_subtask_finishes_cancelled() {
        let mut view = task(CollaborationModel::Solo, &[false]);
        view.status = TaskStatus::Cancelling;
        let subtasks = vec![
            subtask(1, 1, SubtaskRole::User, SubtaskStatus::Completed),
            subtask(2, 2, SubtaskRole::Assistant, SubtaskStatus::Cancelled),
        ];
        let r = reduce(&view, &subtasks);
        assert_eq!(r.status, TaskStatus::Cancelled);
        assert_eq!(r.progress, 100);
    }

    #[test]
    fn failed_assistant_fails_task_with_message() {
        let view = task(CollaborationModel::Solo, &[false]);
        let mut failed = subtask(2, 2, SubtaskRole::Assistant, SubtaskStatus::Failed);
        failed.error_message = Some("boom".into());
        let subtasks = vec![
            subtask(1, 1, SubtaskRole::User, SubtaskStatus::Completed),
            failed,
        ];
        let r = reduce(&view, &subtasks);
        assert_eq!(r.status, TaskStatus::Failed);
        assert_eq!(r.error_message.as_deref(), Some("boom"));
        assert_eq!(r.mirror_done_for, Some(2));
    }

    #[test]
    fn completed_user_turn_keeps_task_running() {
        let view = task(CollaborationModel::Solo, &[false]);
        let subtasks = vec![
            subtask(1, 1, SubtaskRole::User, SubtaskStatus::Completed),
            subtask(2, 2, SubtaskRole::Assistant, SubtaskStatus::Pending),
        ];
        let r = reduce(&view, &subtasks);
        assert_eq!(r.status, TaskStatus::Running);
        assert!(r.next_stage.is_none());
    }

    #[test]
    fn solo_completion_completes_task() {
        let view = task(CollaborationModel::Solo, &[false]);
        let subtasks = vec![
            subtask(1, 1, SubtaskRole::User, SubtaskStatus::Completed),
            subtask(2, 2, SubtaskRole::Assistant, SubtaskStatus::Completed),
        ];
        let r = reduce(&view, &subtasks);
        assert_eq!(r.status, TaskStatus::Completed);
        assert_eq!(r.progress, 100);
        assert!(r.completed);
        assert_eq!(r.mirror_done_for, Some(2));
    }

    #[test]
    fn pipeline_stage_completion_creates_next_stage() {
        let view = task(CollaborationModel::Pipeline, &[false, false]);
        let mut stage1 = subtask(2, 2, SubtaskRole::Assistant, SubtaskStatus::Completed);
        stage1.executor_name = Some("exec-a".into());
        let subtasks = vec![
            subtask(1, 1, SubtaskRole::User, SubtaskStatus::Completed),
            stage1,
        ];
        let r = reduce(&view, &subtasks);
        assert_eq!(r.status, TaskStatus::Running);
        let next = r.next_stage.unwrap();
        assert_eq!(next.message_id, 3);
        assert_eq!(next.parent_message_id, 2);
        assert_eq!(next.executor_name.as_deref(), Some("exec-a"));
    }

    #[test]
    fn pipeline_confirmation_gate_pauses_without_next_stage() {
        let view = task(CollaborationModel::Pipeline, &[true, false]);
        let subtasks = vec![
            subtask(1, 1, SubtaskRole::User, SubtaskStatus::Completed),
            subtask(2, 2, SubtaskRole::Assistant, SubtaskStatus::Completed),
        ];
        let r = reduce(&view, &subtasks);
        assert_eq!(r.status, TaskStatus::PendingConfirmation);
        assert!(r.next_stage.is_none());
    }

    #[test]
    fn pipeline_last_stage_completes_task() {
        let view = task(CollaborationModel::Pipeline, &[true, false]);
        let subtasks = vec![
            subtask(1, 1, SubtaskRole::User, SubtaskStatus::Completed),
            subtask(2, 2, SubtaskRole::Assistant, SubtaskStatus::Completed),
            subtask(3, 3, SubtaskRole::Assistant, SubtaskStatus::Completed),
        ];
        let r = reduce(&view, &subtasks);
        assert_eq!(r.status, TaskStatus::Completed);
        assert!(r.next_stage.is_none());
    }

    #[test]
    fn new_round_restarts_stage_indexing() {
        // Second user turn: the assistant answering it is stage 0 again.
        let view = task(CollaborationModel::Pipeline, &[true, false]);
        let subtasks = vec![
            subtask(1, 1, SubtaskRole::User, SubtaskStatus::Completed),
            subtask(2, 2, SubtaskRole::Assistant, SubtaskStatus::Completed),
            subtask(3, 3, SubtaskRole::Assistant, SubtaskStatus::Completed),
            subtask(4, 4, SubtaskRole::User, SubtaskStatus::Completed),
            subtask(5, 5, SubtaskRole::Assistant, SubtaskStatus::Completed),
        ];
        let r = reduce(&view, &subtasks);
        // Stage 0 of the new round requires confirmation again.
        assert_eq!(r.status, TaskStatus::PendingConfirmation);
    }

    #[test]
    fn single_subtask_mirrors_progress_and_result() {
        let view = task(CollaborationModel::Solo, &[false]);
        let mut running = subtask(1, 1, SubtaskRole::Assistant, SubtaskStatus::Running);
        running.progress = 40;
        running.result = Some(SubtaskResult::text("partial"));
        let r = reduce(&view, &[running]);
        assert_eq!(r.status, TaskStatus::Running);
        assert_eq!(r.progress, 40);
        assert_eq!(r.result.unwrap()["value"], "partial");
    }

    #[test]
    fn reduction_is_deterministic() {
        let view = task(CollaborationModel::Pipeline, &[false, false]);
        let subtasks = vec![
            subtask(1, 1, SubtaskRole::User, SubtaskStatus::Completed),
            subtask(2, 2, SubtaskRole::Assistant, SubtaskStatus::Completed),
        ];
        assert_eq!(reduce(&view, &subtasks), reduce(&view, &subtasks));
    }
}
