//! Dry-run collaborators: verify for real, never commit or write to the
//! review.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cq_core::{ChangeInfo, Checkout, CheckoutResult, ReviewClient, ReviewResult, TryJobResult};
use tracing::info;

/// Wraps a checkout and replaces `commit` with a log line and a fake
/// revision. Apply and revert still go to the inner checkout so verifiers
/// see the patched tree.
pub struct ReadOnlyCheckout {
    inner: Arc<dyn Checkout>,
    commits: AtomicU64,
}

impl ReadOnlyCheckout {
    pub fn new(inner: Arc<dyn Checkout>) -> Self {
        Self {
            inner,
            commits: AtomicU64::new(0),
        }
    }

    /// Commits that would have happened.
    pub fn skipped_commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ReadOnlyCheckout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyCheckout")
            .field("project_path", &self.inner.project_path())
            .field("skipped_commits", &self.skipped_commits())
            .finish()
    }
}

#[async_trait]
impl Checkout for ReadOnlyCheckout {
    async fn apply_patch(&self, patch: &str) -> CheckoutResult<()> {
        self.inner.apply_patch(patch).await
    }

    async fn commit(&self, message: &str, author: &str) -> CheckoutResult<String> {
        let n = self.commits.fetch_add(1, Ordering::Relaxed) + 1;
        let revision = format!("dry-run-{n}");
        info!(
            revision = %revision,
            author,
            subject = message.lines().next().unwrap_or_default(),
            "Dry run: skipping commit"
        );
        self.inner.revert().await?;
        Ok(revision)
    }

    async fn revert(&self) -> CheckoutResult<()> {
        self.inner.revert().await
    }

    fn project_path(&self) -> &Path {
        self.inner.project_path()
    }
}

/// Wraps a review client and swallows comments and issue closes. Reads and
/// try job triggers still reach the service.
pub struct ReadOnlyReviewClient {
    inner: Arc<dyn ReviewClient>,
}

impl ReadOnlyReviewClient {
    pub fn new(inner: Arc<dyn ReviewClient>) -> Self {
        Self { inner }
    }
}

impl std::fmt::Debug for ReadOnlyReviewClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyReviewClient").finish_non_exhaustive()
    }
}

#[async_trait]
impl ReviewClient for ReadOnlyReviewClient {
    async fn list_pending(&self) -> ReviewResult<Vec<ChangeInfo>> {
        self.inner.list_pending().await
    }

    async fn fetch_patch(&self, issue: u64, patchset: u64) -> ReviewResult<String> {
        self.inner.fetch_patch(issue, patchset).await
    }

    async fn post_comment(&self, issue: u64, message: &str) -> ReviewResult<()> {
        info!(issue, message, "Dry run: skipping review comment");
        Ok(())
    }

    async fn close_issue(&self, issue: u64) -> ReviewResult<()> {
        info!(issue, "Dry run: leaving issue open");
        Ok(())
    }

    async fn trigger_try_jobs(
        &self,
        issue: u64,
        patchset: u64,
        builders: &[String],
    ) -> ReviewResult<()> {
        self.inner.trigger_try_jobs(issue, patchset, builders).await
    }

    async fn get_try_jobs(&self, issue: u64, patchset: u64) -> ReviewResult<Vec<TryJobResult>> {
        self.inner.get_try_jobs(issue, patchset).await
    }

    fn issue_url(&self, issue: u64) -> String {
        self.inner.issue_url(issue)
    }
}
