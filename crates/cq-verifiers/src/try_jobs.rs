//! Remote try jobs: triggered on dispatch, settled by polling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cq_core::{
    pending_loop, CheckoutVerifier, ChangeInfo, Context, PendingChange, StatusView, TryJobState,
    TryJobsStatus, VerificationState, Verifier, VerifierStatus, VerifyResult,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::BuildError;

/// Triggers one try job per builder and waits for all of them to pass.
///
/// A failed job is re-triggered up to `max_retries` times before the
/// change fails. Jobs still running after `timeout` fail the change.
pub struct TryJobsVerifier {
    builders: Vec<String>,
    max_retries: u32,
    timeout: Duration,
    context: Arc<Context>,
}

impl TryJobsVerifier {
    pub const NAME: &'static str = "try_jobs";

    pub fn new(
        builders: Vec<String>,
        max_retries: u32,
        timeout: Duration,
        context: Arc<Context>,
    ) -> Result<Self, BuildError> {
        if builders.is_empty() {
            return Err(BuildError::NoBuilders(Self::NAME.to_string()));
        }
        Ok(Self {
            builders,
            max_retries,
            timeout,
            context,
        })
    }

    /// Fold the latest results into `status` and decide its state.
    ///
    /// After a retry, a FAILURE reported while the job is still PENDING is
    /// taken to be the previous run's. If the new run fails before any poll
    /// sees it start, that failure is never counted and the job is only
    /// settled by the timeout.
    async fn poll_one(&self, info: &ChangeInfo, status: &mut TryJobsStatus) -> VerifyResult<()> {
        let results = self
            .context
            .review
            .get_try_jobs(info.issue, info.patchset)
            .await?;
        for result in results {
            if let Some(job) = status.jobs.get_mut(&result.builder) {
                // A retried job reports its previous failure until the new
                // run is picked up.
                if job.state == TryJobState::Pending
                    && result.state == TryJobState::Failure
                    && job.attempts > 1
                {
                    continue;
                }
                job.state = result.state;
                if result.url.is_some() {
                    job.url = result.url;
                }
            }
        }

        let mut retry = Vec::new();
        let mut failed = Vec::new();
        for (builder, job) in status.jobs.iter_mut() {
            if job.state != TryJobState::Failure {
                continue;
            }
            if job.attempts <= self.max_retries {
                job.attempts += 1;
                job.state = TryJobState::Pending;
                retry.push(builder.clone());
            } else {
                failed.push(format!(
                    "{builder}: {}",
                    job.url.as_deref().unwrap_or("no log available")
                ));
            }
        }

        if !failed.is_empty() {
            status.state = VerificationState::Failed;
            status.error_message = Some(format!("Try jobs failed:\n{}", failed.join("\n")));
        } else if !retry.is_empty() {
            info!(issue = info.issue, builders = ?retry, "Retrying failed try jobs");
            self.context
                .review
                .trigger_try_jobs(info.issue, info.patchset, &retry)
                .await?;
        } else if status.jobs.values().all(|job| job.state == TryJobState::Success) {
            status.state = VerificationState::Succeeded;
        } else if self.timed_out(status) {
            status.state = VerificationState::Failed;
            status.error_message = Some(format!(
                "Try jobs timed out after {} seconds, still waiting on: {}",
                self.timeout.as_secs(),
                status.waiting_on().join(", ")
            ));
        }
        Ok(())
    }

    fn timed_out(&self, status: &TryJobsStatus) -> bool {
        let elapsed = Utc::now().signed_duration_since(status.triggered_at);
        elapsed.to_std().map_or(false, |elapsed| elapsed > self.timeout)
    }
}

impl std::fmt::Debug for TryJobsVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TryJobsVerifier")
            .field("builders", &self.builders)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Verifier for TryJobsVerifier {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn verify(&self, pending: &PendingChange) -> VerifyResult<VerifierStatus> {
        self.context
            .review
            .trigger_try_jobs(pending.issue(), pending.patchset(), &self.builders)
            .await?;
        debug!(issue = pending.issue(), builders = ?self.builders, "Try jobs triggered");
        self.send_status(
            &pending.info,
            json!({ "state": "triggered", "builders": self.builders }),
        );
        Ok(TryJobsStatus::triggered(&self.builders).into())
    }

    async fn update_status(&self, queue: &mut [PendingChange]) -> VerifyResult<()> {
        let mut untriggered = Vec::new();
        for (info, status) in pending_loop(Self::NAME, queue, VerifierStatus::default, true) {
            let jobs = match status {
                VerifierStatus::TryJobs(jobs) => jobs,
                other => {
                    warn!(
                        issue = info.issue,
                        state = %other.state(),
                        "No try jobs recorded for change, leaving it to dispatch"
                    );
                    untriggered.push(info.issue);
                    continue;
                }
            };
            if let Err(e) = self.poll_one(info, jobs).await {
                warn!(issue = info.issue, error = %e, "Could not poll try jobs");
                continue;
            }
            if jobs.state.is_terminal() {
                self.send_status(
                    info,
                    json!({ "state": jobs.state.as_str(), "message": jobs.error_message }),
                );
            }
        }
        // Without this the placeholder would count as a dispatched
        // verification and the jobs would never be triggered.
        for change in queue
            .iter_mut()
            .filter(|change| untriggered.contains(&change.issue()))
        {
            change.verifications.remove(Self::NAME);
        }
        Ok(())
    }
}

impl CheckoutVerifier for TryJobsVerifier {
    fn context(&self) -> &Arc<Context> {
        &self.context
    }
}
