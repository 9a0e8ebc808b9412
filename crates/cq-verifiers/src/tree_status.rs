//! Holds commits while the tree is closed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cq_core::{
    pending_loop, PendingChange, TreeStatus, Verifier, VerifierStatus, VerifyError, VerifyResult,
};
use serde::Deserialize;
use tracing::{debug, warn};

/// Tree state as published by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TreeState {
    pub general_state: String,
    #[serde(default)]
    pub message: String,
}

impl TreeState {
    pub fn is_open(&self) -> bool {
        self.general_state.eq_ignore_ascii_case("open")
    }
}

/// Where the tree state is read from.
#[async_trait]
pub trait TreeStatusSource: Send + Sync {
    async fn fetch(&self, url: &str) -> VerifyResult<TreeState>;
}

/// Reads `{"general_state": ..., "message": ...}` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTreeStatusSource {
    client: reqwest::Client,
}

impl HttpTreeStatusSource {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TreeStatusSource for HttpTreeStatusSource {
    async fn fetch(&self, url: &str) -> VerifyResult<TreeState> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| VerifyError::Other(format!("tree status unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(VerifyError::Other(format!(
                "tree status returned HTTP {}",
                response.status()
            )));
        }
        response
            .json::<TreeState>()
            .await
            .map_err(|e| VerifyError::Other(format!("invalid tree status: {e}")))
    }
}

/// Always SUCCEEDED; postpones commits while the tree is not open.
///
/// The state is refreshed for every queued change on each poll. An
/// unreachable endpoint leaves the last known state untouched.
pub struct TreeStatusVerifier {
    url: String,
    source: Arc<dyn TreeStatusSource>,
}

impl TreeStatusVerifier {
    pub const NAME: &'static str = "tree_status";

    pub fn new(url: impl Into<String>, source: Arc<dyn TreeStatusSource>) -> Self {
        Self {
            url: url.into(),
            source,
        }
    }

    fn apply(status: &mut TreeStatus, state: &TreeState) {
        status.open = state.is_open();
        status.last_tree_status = (!state.message.is_empty()).then(|| state.message.clone());
        status.checked_at = Some(Utc::now());
    }
}

impl std::fmt::Debug for TreeStatusVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeStatusVerifier")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Verifier for TreeStatusVerifier {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn verify(&self, pending: &PendingChange) -> VerifyResult<VerifierStatus> {
        let mut status = TreeStatus::new(&self.url);
        match self.source.fetch(&self.url).await {
            Ok(state) => Self::apply(&mut status, &state),
            Err(e) => warn!(issue = pending.issue(), error = %e, "Tree status unavailable, assuming open"),
        }
        Ok(status.into())
    }

    async fn update_status(&self, queue: &mut [PendingChange]) -> VerifyResult<()> {
        if queue.is_empty() {
            return Ok(());
        }
        let state = match self.source.fetch(&self.url).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Tree status unavailable, keeping last known state");
                return Ok(());
            }
        };
        debug!(open = state.is_open(), message = %state.message, "Tree status refreshed");
        let url = self.url.clone();
        let gen_obj = move || VerifierStatus::from(TreeStatus::new(url.clone()));
        for (_, status) in pending_loop(Self::NAME, queue, gen_obj, false) {
            match status {
                VerifierStatus::TreeStatus(tree) => Self::apply(tree, &state),
                other => {
                    let mut tree = TreeStatus::new(&self.url);
                    Self::apply(&mut tree, &state);
                    *other = tree.into();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::pending_with;
    use cq_core::{StatusView, Verified};
    use std::sync::Mutex;

    /// Source returning whatever state was set last.
    #[derive(Default)]
    struct StubSource {
        state: Mutex<Option<TreeState>>,
    }

    impl StubSource {
        fn set(&self, general_state: &str, message: &str) {
            *self.state.lock().unwrap() = Some(TreeState {
                general_state: general_state.to_string(),
                message: message.to_string(),
            });
        }
    }

    #[async_trait]
    impl TreeStatusSource for StubSource {
        async fn fetch(&self, _url: &str) -> VerifyResult<TreeState> {
            self.state
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| VerifyError::Other("connection refused".to_string()))
        }
    }

    #[test]
    fn parses_status_payload() {
        let state: TreeState = serde_json::from_str(
            r#"{"general_state": "closed", "message": "Tree is closed (compile failure)", "username": "sheriff"}"#,
        )
        .unwrap();
        assert!(!state.is_open());
        assert_eq!(state.message, "Tree is closed (compile failure)");

        let state: TreeState = serde_json::from_str(r#"{"general_state": "OPEN"}"#).unwrap();
        assert!(state.is_open());
    }

    #[tokio::test]
    async fn closed_tree_succeeds_but_postpones() {
        let source = Arc::new(StubSource::default());
        source.set("closed", "Tree is closed for the branch cut");
        let verifier = TreeStatusVerifier::new("https://status.example.org/current", source);

        let status = verifier.verify(&pending_with(1, |_| {})).await.unwrap();

        assert_eq!(status.state(), cq_core::VerificationState::Succeeded);
        assert!(status.postpone());
        assert!(status.why_not().unwrap().contains("branch cut"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_counts_as_open() {
        let verifier =
            TreeStatusVerifier::new("https://status.example.org/current", Arc::new(StubSource::default()));
        let status = verifier.verify(&pending_with(1, |_| {})).await.unwrap();
        assert!(!status.postpone());
    }

    #[tokio::test]
    async fn update_refreshes_every_change() {
        let source = Arc::new(StubSource::default());
        source.set("open", "");
        let verifier = TreeStatusVerifier::new("https://status.example.org/current", source.clone());

        let mut queue = vec![pending_with(1, |_| {}), pending_with(2, |_| {})];
        for pending in queue.iter_mut() {
            let status = verifier.verify(pending).await.unwrap();
            pending.verifications.insert(TreeStatusVerifier::NAME.to_string(), status);
        }
        assert!(queue.iter().all(|p| !p.postpone()));

        source.set("throttled", "Throttled while the waterfall is red");
        verifier.update_status(&mut queue).await.unwrap();
        assert!(queue.iter().all(|p| p.postpone()));

        source.set("open", "Tree is open");
        verifier.update_status(&mut queue).await.unwrap();
        assert!(queue.iter().all(|p| !p.postpone()));
    }
}
