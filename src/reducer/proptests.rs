//! Property-based tests for the task-state reduction.
//!
//! These verify the reducer's laws across generated subtask histories.

use super::transition::{reduce, TaskView};
use crate::store::resources::CollaborationModel;
use crate::store::{SubtaskResult, SubtaskRole, SubtaskRow, SubtaskStatus, TaskStatus};
use chrono::Utc;
use proptest::prelude::*;

// ============================================================================
// Generators
// ============================================================================

fn arb_subtask_status() -> impl Strategy<Value = SubtaskStatus> {
    prop_oneof![
        Just(SubtaskStatus::Pending),
        Just(SubtaskStatus::Running),
        Just(SubtaskStatus::Completed),
        Just(SubtaskStatus::Failed),
        Just(SubtaskStatus::Cancelled),
    ]
}

fn arb_collaboration() -> impl Strategy<Value = CollaborationModel> {
    prop_oneof![
        Just(CollaborationModel::Solo),
        Just(CollaborationModel::Parallel),
        Just(CollaborationModel::Pipeline),
        Just(CollaborationModel::GroupChat),
    ]
}

fn arb_task_status() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Pending),
        Just(TaskStatus::Running),
        Just(TaskStatus::Cancelling),
        Just(TaskStatus::PendingConfirmation),
    ]
}

fn subtask(id: i64, message_id: i64, role: SubtaskRole, status: SubtaskStatus) -> SubtaskRow {
    SubtaskRow {
        id,
        task_id: 1,
        team_id: 1,
        role,
        bot_ids: vec![],
        title: String::new(),
        prompt: String::new(),
        result: (status == SubtaskStatus::Completed).then(|| SubtaskResult::text("out")),
        status,
        progress: if status == SubtaskStatus::Completed { 100 } else { 0 },
        message_id,
        parent_id: (role == SubtaskRole::Assistant).then(|| message_id - 1),
        executor_name: None,
        executor_namespace: None,
        error_message: (status == SubtaskStatus::Failed).then(|| "failed".to_string()),
        new_session: false,
        attachments: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// A conversation history: alternating USER turns, each followed by a run of
/// assistant subtasks with arbitrary statuses.
fn arb_history() -> impl Strategy<Value = Vec<SubtaskRow>> {
    proptest::collection::vec(
        proptest::collection::vec(arb_subtask_status(), 0..4),
        1..4,
    )
    .prop_map(|rounds| {
        let mut rows = Vec::new();
        let mut message_id = 0;
        let mut id = 0;
        for round in rounds {
            message_id += 1;
            id += 1;
            rows.push(subtask(id, message_id, SubtaskRole::User, SubtaskStatus::Completed));
            for status in round {
                message_id += 1;
                id += 1;
                rows.push(subtask(id, message_id, SubtaskRole::Assistant, status));
            }
        }
        rows
    })
}

fn arb_view() -> impl Strategy<Value = TaskView> {
    (
        arb_task_status(),
        arb_collaboration(),
        proptest::collection::vec(any::<bool>(), 0..4),
    )
        .prop_map(|(status, collaboration, member_confirmation)| TaskView {
            task_id: 1,
            status,
            collaboration,
            member_confirmation,
        })
}

// ============================================================================
// Laws
// ============================================================================

proptest! {
    /// Same inputs, same reduction.
    #[test]
    fn reduction_is_pure((view, history) in (arb_view(), arb_history())) {
        prop_assert_eq!(reduce(&view, &history), reduce(&view, &history));
    }

    /// Progress stays within 0..=100.
    #[test]
    fn progress_is_bounded((view, history) in (arb_view(), arb_history())) {
        let r = reduce(&view, &history);
        prop_assert!(r.progress <= 100);
    }

    /// Terminal states always stamp completion.
    #[test]
    fn terminal_implies_completed((view, history) in (arb_view(), arb_history())) {
        let r = reduce(&view, &history);
        if r.status.is_terminal() {
            prop_assert!(r.completed);
        } else {
            prop_assert!(!r.completed);
        }
    }

    /// A next stage is only ever created for running pipeline tasks, with
    /// contiguous message ids.
    #[test]
    fn next_stage_only_in_pipeline((view, history) in (arb_view(), arb_history())) {
        let r = reduce(&view, &history);
        if let Some(next) = &r.next_stage {
            prop_assert_eq!(view.collaboration, CollaborationModel::Pipeline);
            prop_assert_eq!(r.status, TaskStatus::Running);
            prop_assert_eq!(next.message_id, next.parent_message_id + 1);
            let max_msg = history.iter().map(|s| s.message_id).max().unwrap_or(0);
            prop_assert!(next.message_id > max_msg);
        }
    }

    /// Confirmation pauses never coincide with stage creation.
    #[test]
    fn confirmation_excludes_next_stage((view, history) in (arb_view(), arb_history())) {
        let r = reduce(&view, &history);
        if r.status == TaskStatus::PendingConfirmation {
            prop_assert!(r.next_stage.is_none());
        }
    }

    /// If every subtask is still pending, the task does not move.
    #[test]
    fn all_pending_keeps_status(view in arb_view()) {
        let history = vec![subtask(1, 1, SubtaskRole::Assistant, SubtaskStatus::Pending)];
        let r = reduce(&view, &history);
        if view.status != TaskStatus::Cancelling {
            prop_assert_eq!(r.status, view.status);
        }
    }

    /// A cancelled latest subtask always lands the task in CANCELLED.
    #[test]
    fn cancelled_latest_cancels_task(view in arb_view(), n in 1i64..5) {
        let mut history = vec![subtask(1, 1, SubtaskRole::User, SubtaskStatus::Completed)];
        for i in 0..n {
            history.push(subtask(i + 2, i + 2, SubtaskRole::Assistant, SubtaskStatus::Completed));
        }
        history.last_mut().unwrap().status = SubtaskStatus::Cancelled;
        let r = reduce(&view, &history);
        prop_assert_eq!(r.status, TaskStatus::Cancelled);
    }
}
