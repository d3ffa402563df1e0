//! Task execution spans.

use tracing::Span;

use crate::model::TaskId;

/// Span covering one claimed task from start to resolution.
///
/// `task.status` is left empty and filled in by [`record_state_transition`].
pub fn start_task_span(task_type: &str, task_id: &TaskId, worker_id: &str) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.type" = task_type,
        "task.id" = %task_id,
        "task.worker" = worker_id,
        "task.status" = tracing::field::Empty,
    )
}

/// Record a transition on `span` and update its `task.status` field.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.status", to);
    span.in_scope(|| {
        tracing::info!(from, to, "state_transition");
    });
}
