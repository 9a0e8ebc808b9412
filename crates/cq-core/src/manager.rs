//! The pending manager: owns the queue and drives one round at a time.
//!
//! A round is discovery, dispatch of missing verifications, polling of
//! asynchronous results, the commit/report/drop decision, and a snapshot
//! save. The manager is the only writer of the queue and of the snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cq_state::SnapshotStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn, Instrument};

use crate::context::{CheckoutError, Context, StatusPayload};
use crate::domain::{
    PendingChange, SettledChange, SettledOutcome, SimpleStatus, StatusView, VerificationState,
    Verified, VerifierStatus,
};
use crate::error::{EngineError, EngineResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::pool::TaskPool;
use crate::signals::ShutdownCoordinator;
use crate::verification::{DiscardPending, Verifier, VerifierRegistry, VerifyError};

/// Name the manager's own status updates are sent under.
pub const MANAGER_STATUS_NAME: &str = "commit-queue";

/// Message posted when a patch no longer applies to the checkout.
pub const PATCH_APPLY_FAILED: &str = "Failed to apply the patch.";

/// Message posted when the review service refuses to hand out a patch.
pub const PATCH_FETCH_FAILED: &str = "Failed to download the patch.";

/// Tuning knobs for the round loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Verification tasks run concurrently per change.
    pub workers: usize,
    /// Minimum pause between two rounds.
    pub round_delay: Duration,
    /// Stop after this many rounds (`None` runs until shutdown).
    pub max_rounds: Option<u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            round_delay: Duration::from_secs(30),
            max_rounds: None,
        }
    }
}

/// Persisted form of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub round: u64,
    pub pending: Vec<PendingChange>,
    /// Patchsets that already left the queue, by issue.
    #[serde(default)]
    pub settled: BTreeMap<u64, SettledChange>,
}

/// What `scan_results` decided for each change, by issue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub committed: Vec<u64>,
    pub failed: Vec<u64>,
    pub ignored: Vec<u64>,
    pub postponed: Vec<u64>,
    pub discarded: Vec<u64>,
}

/// Output of one verification task.
#[derive(Debug)]
struct VerifyCompletion {
    verifier: String,
    verdict: Result<VerifierStatus, DiscardPending>,
}

fn is_failure(status: &VerifierStatus) -> bool {
    status.state() == VerificationState::Failed
        || status.error_message().is_some_and(|m| !m.is_empty())
}

/// Orchestrates the commit queue.
pub struct PendingManager {
    context: Arc<Context>,
    verifiers: VerifierRegistry,
    store: Arc<dyn SnapshotStore>,
    pool: TaskPool<VerifyCompletion>,
    config: ManagerConfig,
    queue: Vec<PendingChange>,
    settled: BTreeMap<u64, SettledChange>,
    round: u64,
}

impl PendingManager {
    /// Must be called inside a tokio runtime; spawns the worker pool.
    pub fn new(
        context: Arc<Context>,
        verifiers: VerifierRegistry,
        store: Arc<dyn SnapshotStore>,
        config: ManagerConfig,
    ) -> Self {
        let pool = TaskPool::new(config.workers);
        Self {
            context,
            verifiers,
            store,
            pool,
            config,
            queue: Vec::new(),
            settled: BTreeMap::new(),
            round: 0,
        }
    }

    pub fn queue(&self) -> &[PendingChange] {
        &self.queue
    }

    pub fn get(&self, issue: u64) -> Option<&PendingChange> {
        self.queue.iter().find(|p| p.issue() == issue)
    }

    /// Outcome recorded for `issue` if its listed patchset is done with.
    pub fn settled(&self, issue: u64) -> Option<SettledChange> {
        self.settled.get(&issue).copied()
    }

    fn settle(&mut self, issue: u64, patchset: u64, outcome: SettledOutcome) {
        self.settled
            .insert(issue, SettledChange { patchset, outcome });
    }

    /// Rounds completed or attempted since the queue was created.
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn verifiers(&self) -> &VerifierRegistry {
        &self.verifiers
    }

    fn position(&self, issue: u64) -> Option<usize> {
        self.queue.iter().position(|p| p.issue() == issue)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Restore the queue from the last snapshot. An empty store leaves the
    /// queue empty; an unreadable snapshot is an error.
    pub async fn load(&mut self) -> EngineResult<()> {
        match self.store.load().await? {
            Some(payload) => {
                let snapshot: QueueSnapshot = serde_json::from_str(&payload)?;
                info!(
                    pending = snapshot.pending.len(),
                    settled = snapshot.settled.len(),
                    round = snapshot.round,
                    "Queue restored from snapshot"
                );
                self.queue = snapshot.pending;
                self.settled = snapshot.settled;
                self.round = snapshot.round;
            }
            None => info!("No queue snapshot found, starting empty"),
        }
        Ok(())
    }

    /// Persist the whole queue.
    pub async fn save(&self) -> EngineResult<()> {
        let snapshot = QueueSnapshot {
            round: self.round,
            pending: self.queue.clone(),
            settled: self.settled.clone(),
        };
        let payload = serde_json::to_string_pretty(&snapshot)?;
        let digest = self.store.save(&payload).await?;
        debug!(pending = self.queue.len(), digest = %digest.short(), "Queue saved");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Sync the queue with the review service. Returns newly queued issues.
    ///
    /// Changes no longer listed are dropped. A newer patchset replaces the
    /// queued one with a fresh record. When the review info of a queued
    /// change moves (new messages, reviewers, description), its FAILED
    /// verifications are cleared so they run again.
    ///
    /// A patchset that was already committed, discarded or ignored is not
    /// queued again while the service keeps listing it. Uploading a new
    /// patchset, or unlisting the issue, forgets the earlier outcome.
    pub async fn look_for_new_pending_commit(&mut self) -> EngineResult<Vec<u64>> {
        let listed = self.context.review.list_pending().await?;
        let mut by_issue: BTreeMap<u64, _> =
            listed.into_iter().map(|info| (info.issue, info)).collect();

        self.settled.retain(|issue, settled| {
            by_issue
                .get(issue)
                .is_some_and(|info| info.patchset == settled.patchset)
        });
        for (issue, settled) in &self.settled {
            if by_issue.remove(issue).is_some() {
                debug!(
                    issue,
                    patchset = settled.patchset,
                    outcome = ?settled.outcome,
                    "Already settled, skipping"
                );
            }
        }

        let mut added = Vec::new();
        let mut kept = Vec::with_capacity(self.queue.len() + by_issue.len());
        for mut change in self.queue.drain(..) {
            let issue = change.issue();
            match by_issue.remove(&issue) {
                Some(info) if info.patchset == change.patchset() => {
                    if info != change.info {
                        let before = change.verifications.len();
                        change
                            .verifications
                            .retain(|_, status| !is_failure(status));
                        if change.verifications.len() != before {
                            info!(issue, "Review updated, retrying failed verifications");
                        }
                        change.info = info;
                    }
                    kept.push(change);
                }
                Some(info) => {
                    info!(
                        issue,
                        old_patchset = change.patchset(),
                        new_patchset = info.patchset,
                        "Patchset superseded, re-queueing"
                    );
                    kept.push(PendingChange::new(info));
                    added.push(issue);
                }
                None => {
                    info!(issue, "No longer pending, dropping from queue");
                }
            }
        }
        for (issue, info) in by_issue {
            info!(issue, patchset = info.patchset, owner = %info.owner, "New pending change");
            kept.push(PendingChange::new(info));
            added.push(issue);
        }
        self.queue = kept;
        Ok(added)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Verify every change that lacks a status from some registered
    /// verifier. A discard drops only that change.
    pub async fn dispatch_new(&mut self) -> EngineResult<Vec<u64>> {
        let names: Vec<String> = self.verifiers.names().into_iter().map(String::from).collect();
        let new_issues: Vec<u64> = self
            .queue
            .iter()
            .filter(|p| !p.missing_verifications(names.iter().map(String::as_str)).is_empty())
            .map(PendingChange::issue)
            .collect();

        let mut discarded = Vec::new();
        for issue in new_issues {
            match self.process_new_pending_commit(issue).await {
                Ok(()) => {}
                Err(EngineError::Discard(discard)) => {
                    self.discard(discard).await;
                    discarded.push(issue);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(discarded)
    }

    /// Apply the change's patch and run its missing verifications.
    ///
    /// The checkout is shared, so the change's tasks are joined and the
    /// working copy reverted before this returns.
    pub async fn process_new_pending_commit(&mut self, issue: u64) -> EngineResult<()> {
        let Some(idx) = self.position(issue) else {
            return Ok(());
        };
        let missing: Vec<Arc<dyn Verifier>> = {
            let change = &self.queue[idx];
            self.verifiers
                .iter()
                .filter(|v| !change.verifications.contains_key(v.name()))
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }

        if self.queue[idx].patch.is_empty() {
            let patchset = self.queue[idx].patchset();
            match self.context.review.fetch_patch(issue, patchset).await {
                Ok(patch) => self.queue[idx].set_patch(patch),
                Err(e) if e.is_transient() => {
                    warn!(issue, patchset, error = %e, "Could not fetch patch, retrying next round");
                    return Ok(());
                }
                Err(e) => {
                    warn!(issue, patchset, error = %e, "Patch is not available");
                    return Err(
                        DiscardPending::new(&self.queue[idx].info, PATCH_FETCH_FAILED).into(),
                    );
                }
            }
        }

        let checkout = Arc::clone(&self.context.checkout);
        checkout.revert().await?;
        if let Err(e) = checkout.apply_patch(&self.queue[idx].patch).await {
            warn!(issue, error = %e, "Patch does not apply");
            return Err(DiscardPending::new(&self.queue[idx].info, PATCH_APPLY_FAILED).into());
        }

        let snapshot = self.queue[idx].clone();
        debug!(
            issue,
            patchset = snapshot.patchset(),
            verifiers = ?missing.iter().map(|v| v.name()).collect::<Vec<_>>(),
            "Dispatching verifications"
        );
        METRICS.add_verifications_dispatched(missing.len() as u64);
        for verifier in missing {
            let change = snapshot.clone();
            let description = format!("{} on issue {}", verifier.name(), issue);
            self.pool.add_task(description, async move {
                let verdict = match verifier.verify(&change).await {
                    Ok(status) => Ok(status),
                    Err(VerifyError::Discard(discard)) => Err(discard),
                    Err(other) => {
                        warn!(
                            issue = change.issue(),
                            verifier = verifier.name(),
                            error = %other,
                            "Verifier could not complete"
                        );
                        Ok(SimpleStatus::failed(other.to_string()).into())
                    }
                };
                Ok(VerifyCompletion {
                    verifier: verifier.name().to_string(),
                    verdict,
                })
            });
        }

        let joined = self.pool.join().await;
        checkout.revert().await?;
        let completions = joined?;

        let mut first_discard = None;
        let change = &mut self.queue[idx];
        for completion in completions {
            match completion.verdict {
                Ok(status) => {
                    debug!(
                        issue,
                        verifier = %completion.verifier,
                        state = %status.state(),
                        "Verification recorded"
                    );
                    change.verifications.insert(completion.verifier, status);
                }
                Err(discard) => {
                    first_discard.get_or_insert(discard);
                }
            }
        }
        match first_discard {
            Some(discard) => Err(discard.into()),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    /// Let every verifier poll its asynchronous checks across the queue.
    ///
    /// Changes whose patch was never fetched have not been dispatched and
    /// are left out, so no verifier records a status for them early. A
    /// verifier that cannot reach its backend is skipped for this round.
    pub async fn update_status(&mut self) -> EngineResult<Vec<u64>> {
        let verifiers: Vec<Arc<dyn Verifier>> = self.verifiers.iter().cloned().collect();
        let order: Vec<u64> = self.queue.iter().map(PendingChange::issue).collect();
        let (mut polled, held): (Vec<_>, Vec<_>) = self
            .queue
            .drain(..)
            .partition(|change| !change.patch.is_empty());

        let mut discards = Vec::new();
        for verifier in verifiers {
            match verifier.update_status(&mut polled).await {
                Ok(()) => {}
                Err(VerifyError::Discard(discard)) => discards.push(discard),
                Err(e) => {
                    warn!(verifier = verifier.name(), error = %e, "Status update failed, retrying next round");
                }
            }
        }

        polled.extend(held);
        polled.sort_by_key(|change| order.iter().position(|issue| *issue == change.issue()));
        self.queue = polled;

        let mut discarded = Vec::new();
        for discard in discards {
            if discarded.contains(&discard.issue) {
                continue;
            }
            discarded.push(discard.issue);
            self.discard(discard).await;
        }
        Ok(discarded)
    }

    // -----------------------------------------------------------------------
    // Decision
    // -----------------------------------------------------------------------

    /// Commit, report, drop or keep each change according to its aggregate
    /// state.
    pub async fn scan_results(&mut self) -> EngineResult<RoundSummary> {
        let mut summary = RoundSummary::default();
        let issues: Vec<u64> = self.queue.iter().map(PendingChange::issue).collect();
        for issue in issues {
            let Some(idx) = self.position(issue) else {
                continue;
            };
            let state = self.queue[idx].get_state();
            match state {
                VerificationState::Failed => {
                    self.report_failure(idx).await;
                    summary.failed.push(issue);
                }
                VerificationState::Succeeded if self.queue[idx].postpone() => {
                    let change = &self.queue[idx];
                    let why_not = change.why_not();
                    debug!(issue, why_not = %why_not, "Commit postponed");
                    self.context.status.send(
                        &change.info,
                        StatusPayload::new(
                            MANAGER_STATUS_NAME,
                            json!({ "state": "postponed", "message": why_not }),
                        ),
                    );
                    summary.postponed.push(issue);
                }
                VerificationState::Succeeded => match self.commit_pending(idx).await {
                    Ok(_) => summary.committed.push(issue),
                    Err(EngineError::Discard(discard)) => {
                        self.discard(discard).await;
                        summary.discarded.push(issue);
                    }
                    Err(EngineError::PushDeferred { reason, .. }) => {
                        debug!(issue, reason = %reason, "Commit deferred");
                        summary.postponed.push(issue);
                    }
                    Err(e) => return Err(e),
                },
                VerificationState::Ignored => {
                    let change = self.queue.remove(idx);
                    debug!(issue, patchset = change.patchset(), "Change ignored, dropping");
                    self.settle(issue, change.patchset(), SettledOutcome::Ignored);
                    summary.ignored.push(issue);
                }
                VerificationState::Processing => {}
            }
        }
        Ok(summary)
    }

    /// Post a FAILED change's error back to the review once per distinct
    /// message. The change stays queued.
    async fn report_failure(&mut self, idx: usize) {
        let change = &self.queue[idx];
        let message = change.error_message();
        if change.last_report.as_deref() == Some(message.as_str()) {
            return;
        }
        let (issue, patchset) = (change.issue(), change.patchset());
        match self.context.review.post_comment(issue, &message).await {
            Ok(()) => {
                let change = &mut self.queue[idx];
                change.last_report = Some(message.clone());
                self.context.status.send(
                    &change.info,
                    StatusPayload::new(
                        MANAGER_STATUS_NAME,
                        json!({ "state": "failed", "message": message }),
                    ),
                );
                METRICS.inc_failures_reported();
                obs::emit_change_failed(issue, patchset, &message);
            }
            Err(e) => warn!(issue, error = %e, "Could not report failure, retrying next round"),
        }
    }

    /// Re-apply the change on a clean checkout and commit it.
    ///
    /// Apply and commit failures are discards. A refused push keeps the
    /// change queued and returns [`EngineError::PushDeferred`]. A checkout
    /// that cannot be reverted is fatal.
    pub async fn commit_pending(&mut self, idx: usize) -> EngineResult<String> {
        let checkout = Arc::clone(&self.context.checkout);
        let review = Arc::clone(&self.context.review);
        let change = &self.queue[idx];
        let (issue, patchset) = (change.issue(), change.patchset());

        checkout.revert().await?;
        if let Err(e) = checkout.apply_patch(&change.patch).await {
            warn!(issue, error = %e, "Patch no longer applies at commit time");
            return Err(DiscardPending::new(&change.info, PATCH_APPLY_FAILED).into());
        }

        let message = format!(
            "{}\n\nReview URL: {}",
            change.info.description.trim_end(),
            review.issue_url(issue)
        );
        let revision = match checkout.commit(&message, &change.info.owner).await {
            Ok(revision) => revision,
            Err(CheckoutError::PushFailed(reason)) => {
                warn!(issue, error = %reason, "Push refused, keeping the change queued");
                checkout.revert().await?;
                self.context.status.send(
                    &change.info,
                    StatusPayload::new(
                        MANAGER_STATUS_NAME,
                        json!({ "state": "postponed", "message": format!("Push failed: {reason}") }),
                    ),
                );
                return Err(EngineError::PushDeferred { issue, reason });
            }
            Err(e) => {
                error!(issue, error = %e, "Commit failed");
                checkout.revert().await?;
                return Err(DiscardPending::new(
                    &change.info,
                    format!("Failed to commit the patch: {e}"),
                )
                .into());
            }
        };

        let change = self.queue.remove(idx);
        self.settle(issue, patchset, SettledOutcome::Committed);
        if let Err(e) = review
            .post_comment(issue, &format!("Committed: {revision}"))
            .await
        {
            warn!(issue, error = %e, "Could not post commit notice");
        }
        if self.context.server_hooks_missing {
            if let Err(e) = review.close_issue(issue).await {
                warn!(issue, error = %e, "Could not close committed issue");
            }
        }
        self.context.status.send(
            &change.info,
            StatusPayload::new(
                MANAGER_STATUS_NAME,
                json!({ "state": "committed", "revision": revision }),
            ),
        );
        METRICS.inc_commits();
        obs::emit_change_committed(issue, patchset, &revision);
        Ok(revision)
    }

    /// Drop a change without committing it and tell the review why.
    pub async fn discard(&mut self, discard: DiscardPending) {
        let Some(idx) = self
            .queue
            .iter()
            .position(|p| p.issue() == discard.issue && p.patchset() == discard.patchset)
        else {
            debug!(issue = discard.issue, "Discarded change already left the queue");
            return;
        };
        let change = self.queue.remove(idx);
        self.settle(discard.issue, discard.patchset, SettledOutcome::Discarded);
        if let Err(e) = self
            .context
            .review
            .post_comment(discard.issue, &discard.status)
            .await
        {
            warn!(issue = discard.issue, error = %e, "Could not post discard reason");
        }
        self.context.status.send(
            &change.info,
            StatusPayload::new(
                MANAGER_STATUS_NAME,
                json!({ "state": "discarded", "message": discard.status }),
            ),
        );
        METRICS.inc_discards();
        obs::emit_change_discarded(discard.issue, discard.patchset, &discard.status);
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// One full round, ending with a save.
    pub async fn run_round(&mut self) -> EngineResult<RoundSummary> {
        self.round += 1;
        let round = self.round;
        self.round_inner(round)
            .instrument(obs::round_span(round))
            .await
    }

    async fn round_inner(&mut self, round: u64) -> EngineResult<RoundSummary> {
        let started = Instant::now();
        obs::emit_round_started(round, self.queue.len());
        METRICS.inc_rounds();

        self.look_for_new_pending_commit().await?;
        let mut discarded = self.dispatch_new().await?;
        discarded.extend(self.update_status().await?);
        let mut summary = self.scan_results().await?;
        discarded.append(&mut summary.discarded);
        summary.discarded = discarded;
        self.save().await?;

        obs::emit_round_finished(
            round,
            started.elapsed().as_millis() as u64,
            self.queue.len(),
            summary.committed.len(),
        );
        METRICS.flush();
        Ok(summary)
    }

    /// Run rounds until shutdown is requested or `max_rounds` is reached.
    ///
    /// The queue is saved before the first round, after each round and
    /// once more before returning. Review-service outages cost one round;
    /// every other error is returned.
    pub async fn run(&mut self, shutdown: &ShutdownCoordinator) -> EngineResult<()> {
        self.save().await?;
        let mut rounds_run = 0u64;
        while !shutdown.is_triggered() {
            match self.run_round().await {
                Ok(_) => {}
                Err(e) if e.is_round_abort() => {
                    warn!(round = self.round, error = %e, "Round aborted");
                    self.save().await?;
                }
                Err(e) => {
                    error!(round = self.round, error = %e, "Fatal engine error");
                    return Err(e);
                }
            }
            rounds_run += 1;
            if self.config.max_rounds.is_some_and(|max| rounds_run >= max) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.round_delay) => {}
                _ = shutdown.wait_for_shutdown() => {}
            }
        }
        if shutdown.is_triggered() {
            let signals: Vec<i32> = shutdown.triggered_signals().into_iter().collect();
            obs::emit_shutdown_requested(&signals);
        }
        self.save().await
    }

    /// Stop the worker pool.
    pub async fn close(self) {
        self.pool.close().await;
        info!("Pending manager closed");
    }
}

impl std::fmt::Debug for PendingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingManager")
            .field("verifiers", &self.verifiers)
            .field("queued", &self.queue.len())
            .field("settled", &self.settled.len())
            .field("round", &self.round)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
