//! Structured lifecycle events emitted by the commit queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cq_core::fakes::{FakeCheckout, FakeReviewClient, ScriptedVerifier};
use cq_core::{
    emit_change_committed, emit_change_discarded, emit_change_failed, emit_round_finished,
    emit_round_started, emit_shutdown_requested, round_span, ChangeInfo, Context, ManagerConfig,
    NullStatusSink, PendingManager, VerifierRegistry,
};
use cq_state::fakes::MemorySnapshotStore;
use tracing_test::traced_test;

#[traced_test]
#[test]
fn round_started_logs_round_and_queue_size() {
    emit_round_started(7, 3);
    assert!(logs_contain("round.started"));
    assert!(logs_contain("queued=3"));
}

#[traced_test]
#[test]
fn round_finished_logs_duration() {
    emit_round_finished(7, 1250, 2, 1);
    assert!(logs_contain("round.finished"));
    assert!(logs_contain("duration_ms=1250"));
}

#[traced_test]
#[test]
fn change_events_carry_issue_and_patchset() {
    emit_change_committed(42, 3, "r1000");
    emit_change_failed(43, 1, "timeout");
    emit_change_discarded(44, 2, "Failed to apply the patch.");

    assert!(logs_contain("change.committed"));
    assert!(logs_contain("issue=42"));
    assert!(logs_contain("change.failed"));
    assert!(logs_contain("change.discarded"));
    assert!(logs_contain("Failed to apply the patch."));
}

#[traced_test]
#[test]
fn shutdown_request_is_a_warning() {
    emit_shutdown_requested(&[15]);
    assert!(logs_contain("WARN"));
    assert!(logs_contain("shutdown.requested"));
}

#[traced_test]
#[test]
fn round_span_tags_nested_events() {
    let span = round_span(9);
    let _entered = span.enter();
    tracing::info!("inside round");
    assert!(logs_contain("cq.round"));
    assert!(logs_contain("round=9"));
}

#[traced_test]
#[tokio::test]
async fn a_round_emits_start_finish_and_metrics() {
    let review = Arc::new(FakeReviewClient::new());
    review.add_pending(
        ChangeInfo {
            issue: 5,
            patchset: 1,
            owner: "author@example.org".to_string(),
            reviewers: Vec::new(),
            description: "Bump version".to_string(),
            base_url: "https://git.example.org/project.git".to_string(),
            relpath: String::new(),
            messages: Vec::new(),
            created_at: Utc::now(),
        },
        "diff --git a/VERSION b/VERSION\n",
    );
    let context = Context::new(
        review,
        Arc::new(FakeCheckout::default()),
        Arc::new(NullStatusSink),
        false,
    );
    let registry = VerifierRegistry::new()
        .with(Arc::new(ScriptedVerifier::succeeding("tests")))
        .unwrap();
    let mut manager = PendingManager::new(
        context,
        registry,
        Arc::new(MemorySnapshotStore::new()),
        ManagerConfig {
            workers: 1,
            round_delay: Duration::from_millis(1),
            max_rounds: Some(1),
        },
    );

    manager.run_round().await.unwrap();

    assert!(logs_contain("round.started"));
    assert!(logs_contain("change.committed"));
    assert!(logs_contain("round.finished"));
    assert!(logs_contain("verifications_dispatched="));
}
