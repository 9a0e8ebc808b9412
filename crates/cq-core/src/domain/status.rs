//! Per-verifier status records.
//!
//! Every verifier stores one [`VerifierStatus`] per pending change. The enum
//! is closed so snapshots round-trip through serde without a type registry;
//! each variant exposes the same read surface through [`StatusView`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::VerificationState;

/// Read surface shared by every status kind.
pub trait StatusView {
    /// Current state of this verifier for the change.
    fn state(&self) -> VerificationState;

    /// Failure detail, if any. A non-empty message forces the change to FAILED.
    fn error_message(&self) -> Option<&str> {
        None
    }

    /// Whether the commit must be held back even once everything succeeded.
    fn postpone(&self) -> bool {
        false
    }

    /// Human-readable reason the change is not committed yet.
    fn why_not(&self) -> Option<String>;
}

// ---------------------------------------------------------------------------
// SimpleStatus
// ---------------------------------------------------------------------------

/// A status that is nothing but a state and an optional failure message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleStatus {
    pub state: VerificationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SimpleStatus {
    pub fn new(state: VerificationState) -> Self {
        Self {
            state,
            error_message: None,
        }
    }

    pub fn processing() -> Self {
        Self::new(VerificationState::Processing)
    }

    pub fn succeeded() -> Self {
        Self::new(VerificationState::Succeeded)
    }

    pub fn ignored() -> Self {
        Self::new(VerificationState::Ignored)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: VerificationState::Failed,
            error_message: Some(message.into()),
        }
    }
}

impl Default for SimpleStatus {
    fn default() -> Self {
        Self::processing()
    }
}

impl StatusView for SimpleStatus {
    fn state(&self) -> VerificationState {
        self.state
    }

    fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    fn why_not(&self) -> Option<String> {
        (self.state == VerificationState::Processing).then(|| "Processing".to_string())
    }
}

// ---------------------------------------------------------------------------
// TreeStatus
// ---------------------------------------------------------------------------

/// Tree open/closed gate. Never fails a change, only postpones its commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeStatus {
    /// Endpoint the tree state is read from.
    pub tree_status_url: String,
    /// Result of the last poll. Unreachable endpoints count as open.
    pub open: bool,
    /// Message published with the last closed state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tree_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
}

impl TreeStatus {
    pub fn new(tree_status_url: impl Into<String>) -> Self {
        Self {
            tree_status_url: tree_status_url.into(),
            open: true,
            last_tree_status: None,
            checked_at: None,
        }
    }
}

impl StatusView for TreeStatus {
    fn state(&self) -> VerificationState {
        VerificationState::Succeeded
    }

    fn postpone(&self) -> bool {
        !self.open
    }

    fn why_not(&self) -> Option<String> {
        if self.open {
            return None;
        }
        Some(format!(
            "Tree is currently not open: {}",
            self.last_tree_status.as_deref().unwrap_or("closed")
        ))
    }
}

// ---------------------------------------------------------------------------
// TryJobsStatus
// ---------------------------------------------------------------------------

/// Remote try job state as reported by the review service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TryJobState {
    Pending,
    Running,
    Success,
    Failure,
}

impl TryJobState {
    pub fn is_finished(self) -> bool {
        matches!(self, TryJobState::Success | TryJobState::Failure)
    }
}

/// One builder's try job as tracked by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTryJob {
    pub state: TryJobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Number of times the job was triggered (1 = no retries).
    pub attempts: u32,
}

/// Asynchronous remote try jobs, one per builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryJobsStatus {
    pub state: VerificationState,
    pub triggered_at: DateTime<Utc>,
    #[serde(default)]
    pub jobs: BTreeMap<String, TrackedTryJob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TryJobsStatus {
    /// Fresh PROCESSING status with one pending job per builder.
    pub fn triggered(builders: &[String]) -> Self {
        let jobs = builders
            .iter()
            .map(|builder| {
                (
                    builder.clone(),
                    TrackedTryJob {
                        state: TryJobState::Pending,
                        url: None,
                        attempts: 1,
                    },
                )
            })
            .collect();
        Self {
            state: VerificationState::Processing,
            triggered_at: Utc::now(),
            jobs,
            error_message: None,
        }
    }

    /// Builders whose job has not finished yet.
    pub fn waiting_on(&self) -> Vec<&str> {
        self.jobs
            .iter()
            .filter(|(_, job)| !job.state.is_finished())
            .map(|(builder, _)| builder.as_str())
            .collect()
    }
}

impl StatusView for TryJobsStatus {
    fn state(&self) -> VerificationState {
        self.state
    }

    fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    fn why_not(&self) -> Option<String> {
        if self.state != VerificationState::Processing {
            return None;
        }
        let waiting = self.waiting_on();
        if waiting.is_empty() {
            Some("Waiting for try job results".to_string())
        } else {
            Some(format!("Waiting for try jobs: {}", waiting.join(", ")))
        }
    }
}

// ---------------------------------------------------------------------------
// VerifierStatus
// ---------------------------------------------------------------------------

/// Any verifier's recorded outcome for one pending change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerifierStatus {
    Simple(SimpleStatus),
    TreeStatus(TreeStatus),
    TryJobs(TryJobsStatus),
}

impl VerifierStatus {
    fn view(&self) -> &dyn StatusView {
        match self {
            VerifierStatus::Simple(s) => s,
            VerifierStatus::TreeStatus(s) => s,
            VerifierStatus::TryJobs(s) => s,
        }
    }
}

impl StatusView for VerifierStatus {
    fn state(&self) -> VerificationState {
        self.view().state()
    }

    fn error_message(&self) -> Option<&str> {
        self.view().error_message()
    }

    fn postpone(&self) -> bool {
        self.view().postpone()
    }

    fn why_not(&self) -> Option<String> {
        self.view().why_not()
    }
}

impl Default for VerifierStatus {
    fn default() -> Self {
        VerifierStatus::Simple(SimpleStatus::processing())
    }
}

impl From<SimpleStatus> for VerifierStatus {
    fn from(status: SimpleStatus) -> Self {
        VerifierStatus::Simple(status)
    }
}

impl From<TreeStatus> for VerifierStatus {
    fn from(status: TreeStatus) -> Self {
        VerifierStatus::TreeStatus(status)
    }
}

impl From<TryJobsStatus> for VerifierStatus {
    fn from(status: TryJobsStatus) -> Self {
        VerifierStatus::TryJobs(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_status_why_not_only_while_processing() {
        assert_eq!(
            SimpleStatus::processing().why_not().as_deref(),
            Some("Processing")
        );
        assert!(SimpleStatus::succeeded().why_not().is_none());
        assert!(SimpleStatus::failed("boom").why_not().is_none());
        assert!(SimpleStatus::ignored().why_not().is_none());
    }

    #[test]
    fn closed_tree_postpones_without_failing() {
        let mut tree = TreeStatus::new("https://status.example.org");
        assert!(!tree.postpone());

        tree.open = false;
        tree.last_tree_status = Some("Tree is closed (maintenance)".to_string());
        assert_eq!(tree.state(), VerificationState::Succeeded);
        assert!(tree.postpone());
        assert!(tree.why_not().unwrap().contains("maintenance"));
        assert!(tree.error_message().is_none());
    }

    #[test]
    fn try_jobs_report_outstanding_builders() {
        let mut status =
            TryJobsStatus::triggered(&["linux".to_string(), "mac".to_string()]);
        status.jobs.get_mut("linux").unwrap().state = TryJobState::Success;

        assert_eq!(status.waiting_on(), vec!["mac"]);
        assert_eq!(
            status.why_not().as_deref(),
            Some("Waiting for try jobs: mac")
        );
    }

    #[test]
    fn enum_delegates_to_variant() {
        let status: VerifierStatus = SimpleStatus::failed("lint error").into();
        assert_eq!(status.state(), VerificationState::Failed);
        assert_eq!(status.error_message(), Some("lint error"));
        assert!(!status.postpone());
    }

    #[test]
    fn tagged_serde_round_trip_keeps_variant() {
        let statuses: Vec<VerifierStatus> = vec![
            SimpleStatus::failed("timeout").into(),
            TreeStatus::new("https://status.example.org").into(),
            TryJobsStatus::triggered(&["linux".to_string()]).into(),
        ];
        let json = serde_json::to_string(&statuses).unwrap();
        assert!(json.contains("\"type\":\"tree_status\""));
        let decoded: Vec<VerifierStatus> = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, statuses);
    }
}
