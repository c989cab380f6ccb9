//! Job execution span helpers.
//!
//! Provides span creation and state-transition recording for jobs flowing
//! through the worker pool.

use tracing::Span;

use crate::model::JobId;

/// Start a span for a job's worker.
///
/// The `job.outcome` field is declared empty and filled by
/// [`record_outcome`] when the worker is reclaimed.
pub fn start_job_span(class: &str, job_id: &JobId) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.class" = class,
        "job.id" = %job_id,
        "job.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}

/// Record how the job ended.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("job.outcome", outcome);
}
