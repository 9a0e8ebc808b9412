//! Structured lifecycle events for the pending manager.
//!
//! Every emitter logs one event with a stable `event` field so log pipelines
//! can filter on it.

use tracing::{info, warn};

/// Span covering one round. Attach it with `Instrument` so every event
/// logged during the round carries its number.
pub fn round_span(round: u64) -> tracing::Span {
    tracing::info_span!("cq.round", round = round)
}

pub fn emit_round_started(round: u64, queued: usize) {
    info!(event = "round.started", round, queued);
}

/// Round finished. `duration_ms` covers discovery through persistence.
pub fn emit_round_finished(round: u64, duration_ms: u64, queued: usize, committed: usize) {
    info!(
        event = "round.finished",
        round,
        duration_ms,
        queued,
        committed,
    );
}

pub fn emit_change_committed(issue: u64, patchset: u64, revision: &str) {
    info!(event = "change.committed", issue, patchset, revision = %revision);
}

pub fn emit_change_discarded(issue: u64, patchset: u64, reason: &str) {
    warn!(event = "change.discarded", issue, patchset, reason = %reason);
}

/// A FAILED change was reported back to the review.
pub fn emit_change_failed(issue: u64, patchset: u64, message: &str) {
    info!(event = "change.failed", issue, patchset, message = %message);
}

pub fn emit_shutdown_requested(signals: &[i32]) {
    warn!(event = "shutdown.requested", signals = ?signals);
}
