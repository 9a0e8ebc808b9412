//! External collaborators and the immutable context bundling them.
//!
//! The engine never talks to the network or the working copy directly; it
//! goes through these traits so that production clients (see
//! `cq-integrations`) and the in-memory [`fakes`](crate::fakes) are
//! interchangeable.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{ChangeInfo, TryJobState};

// ---------------------------------------------------------------------------
// Review service
// ---------------------------------------------------------------------------

/// Errors returned by a review-service client after its own retries.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReviewError {
    #[error("review service unreachable: {0}")]
    Transport(String),

    #[error("review service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("issue {0} not found")]
    NotFound(u64),

    #[error("unexpected review service response: {0}")]
    Decode(String),
}

impl ReviewError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ReviewError::Transport(_) => true,
            ReviewError::Status { status, .. } => *status >= 500 || *status == 429,
            ReviewError::NotFound(_) | ReviewError::Decode(_) => false,
        }
    }
}

pub type ReviewResult<T> = std::result::Result<T, ReviewError>;

/// Result of one remote try job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryJobResult {
    pub builder: String,
    pub state: TryJobState,
    #[serde(default)]
    pub url: Option<String>,
}

/// Client for the code review service hosting pending changes.
#[async_trait]
pub trait ReviewClient: Send + Sync {
    /// Open changes that asked to be committed by the queue.
    async fn list_pending(&self) -> ReviewResult<Vec<ChangeInfo>>;

    /// Raw patch content for one patchset.
    async fn fetch_patch(&self, issue: u64, patchset: u64) -> ReviewResult<String>;

    /// Publish a message on the review.
    async fn post_comment(&self, issue: u64, message: &str) -> ReviewResult<()>;

    /// Mark the review as closed (committed).
    async fn close_issue(&self, issue: u64) -> ReviewResult<()>;

    /// Ask the review service to start try jobs on `builders`.
    async fn trigger_try_jobs(
        &self,
        issue: u64,
        patchset: u64,
        builders: &[String],
    ) -> ReviewResult<()>;

    /// Latest try job results for a patchset, one entry per builder.
    async fn get_try_jobs(&self, issue: u64, patchset: u64) -> ReviewResult<Vec<TryJobResult>>;

    /// Public URL of an issue, used in commit messages.
    fn issue_url(&self, issue: u64) -> String;
}

// ---------------------------------------------------------------------------
// Checkout
// ---------------------------------------------------------------------------

/// Errors returned by a checkout.
#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("patch does not apply: {0}")]
    PatchFailed(String),

    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// The commit was made locally but the remote refused it, even after
    /// retries. The local commit has been dropped; the change may be
    /// committed again later.
    #[error("push failed: {0}")]
    PushFailed(String),

    #[error("could not restore a clean working copy: {0}")]
    RevertFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CheckoutResult<T> = std::result::Result<T, CheckoutError>;

/// Local working copy the queue applies patches to and commits from.
#[async_trait]
pub trait Checkout: Send + Sync {
    /// Apply a patch. On failure the working copy is left as it was.
    async fn apply_patch(&self, patch: &str) -> CheckoutResult<()>;

    /// Commit the currently applied patch, returning the new revision.
    async fn commit(&self, message: &str, author: &str) -> CheckoutResult<String>;

    /// Discard every local modification.
    async fn revert(&self) -> CheckoutResult<()>;

    /// Root of the working copy.
    fn project_path(&self) -> &Path;
}

// ---------------------------------------------------------------------------
// Status sink
// ---------------------------------------------------------------------------

/// A status update about one change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    /// Verifier (or engine component) the update comes from.
    pub verification: String,
    pub payload: serde_json::Value,
}

impl StatusPayload {
    pub fn new(verification: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            verification: verification.into(),
            payload,
        }
    }
}

/// Fire-and-forget status publisher. `send` must never block on delivery.
pub trait StatusSink: Send + Sync {
    fn send(&self, pending: &ChangeInfo, payload: StatusPayload);
}

/// Sink that drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn send(&self, pending: &ChangeInfo, payload: StatusPayload) {
        tracing::trace!(issue = pending.issue, verification = %payload.verification, "Status dropped");
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Collaborators shared by the manager and every verifier for the lifetime
/// of the process. Built once and handed around as `Arc<Context>`.
pub struct Context {
    pub review: Arc<dyn ReviewClient>,
    pub checkout: Arc<dyn Checkout>,
    pub status: Arc<dyn StatusSink>,
    /// The repository runs no server-side commit hooks, so the queue closes
    /// committed issues itself.
    pub server_hooks_missing: bool,
}

impl Context {
    pub fn new(
        review: Arc<dyn ReviewClient>,
        checkout: Arc<dyn Checkout>,
        status: Arc<dyn StatusSink>,
        server_hooks_missing: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            review,
            checkout,
            status,
            server_hooks_missing,
        })
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("project_path", &self.checkout.project_path())
            .field("server_hooks_missing", &self.server_hooks_missing)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_review_errors() {
        assert!(ReviewError::Transport("reset".to_string()).is_transient());
        assert!(ReviewError::Status {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(ReviewError::Status {
            status: 429,
            body: String::new()
        }
        .is_transient());
        assert!(!ReviewError::Status {
            status: 403,
            body: String::new()
        }
        .is_transient());
        assert!(!ReviewError::NotFound(3).is_transient());
    }

    #[test]
    fn status_payload_serializes_flat() {
        let payload = StatusPayload::new("tests", serde_json::json!({ "state": "running" }));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["verification"], "tests");
        assert_eq!(json["payload"]["state"], "running");
    }
}
