//! In-memory collaborators (testing only)
//!
//! `FakeReviewClient`, `FakeCheckout`, `RecordingStatusSink` and
//! `ScriptedVerifier` satisfy the engine's traits without a network, a
//! working copy or real checks, and record every call for assertions.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::context::{
    Checkout, CheckoutError, CheckoutResult, ReviewClient, ReviewError, ReviewResult,
    StatusPayload, StatusSink, TryJobResult,
};
use crate::domain::{ChangeInfo, PendingChange, SimpleStatus, VerifierStatus};
use crate::verification::{pending_loop, DiscardPending, Verifier, VerifyError, VerifyResult};

// ---------------------------------------------------------------------------
// FakeReviewClient
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ReviewState {
    pending: BTreeMap<u64, ChangeInfo>,
    patches: HashMap<(u64, u64), String>,
    comments: Vec<(u64, String)>,
    closed: Vec<u64>,
    triggered: Vec<(u64, u64, Vec<String>)>,
    try_jobs: HashMap<(u64, u64), Vec<TryJobResult>>,
    fail_listing: bool,
    fail_fetch: Option<ReviewError>,
}

/// Review service backed by in-memory maps.
#[derive(Debug, Default)]
pub struct FakeReviewClient {
    state: Mutex<ReviewState>,
}

impl FakeReviewClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a change (or a new patchset of it) with its patch content.
    pub fn add_pending(&self, info: ChangeInfo, patch: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        state
            .patches
            .insert((info.issue, info.patchset), patch.into());
        state.pending.insert(info.issue, info);
    }

    /// Stop listing an issue, as if its commit flag was removed.
    pub fn remove_pending(&self, issue: u64) {
        self.state.lock().unwrap().pending.remove(&issue);
    }

    /// Replace the listed info of an issue, keeping its patches.
    pub fn update_info(&self, info: ChangeInfo) {
        self.state.lock().unwrap().pending.insert(info.issue, info);
    }

    pub fn set_try_jobs(&self, issue: u64, patchset: u64, results: Vec<TryJobResult>) {
        self.state
            .lock()
            .unwrap()
            .try_jobs
            .insert((issue, patchset), results);
    }

    /// Make `list_pending` fail with a transport error.
    pub fn set_fail_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_listing = fail;
    }

    /// Make every `fetch_patch` return `error` (`None` restores patches).
    pub fn set_fail_fetch(&self, error: Option<ReviewError>) {
        self.state.lock().unwrap().fail_fetch = error;
    }

    pub fn comments(&self) -> Vec<(u64, String)> {
        self.state.lock().unwrap().comments.clone()
    }

    pub fn comments_for(&self, issue: u64) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .comments
            .iter()
            .filter(|(i, _)| *i == issue)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn closed(&self) -> Vec<u64> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn triggered(&self) -> Vec<(u64, u64, Vec<String>)> {
        self.state.lock().unwrap().triggered.clone()
    }
}

#[async_trait]
impl ReviewClient for FakeReviewClient {
    async fn list_pending(&self) -> ReviewResult<Vec<ChangeInfo>> {
        let state = self.state.lock().unwrap();
        if state.fail_listing {
            return Err(ReviewError::Transport("injected listing failure".to_string()));
        }
        Ok(state.pending.values().cloned().collect())
    }

    async fn fetch_patch(&self, issue: u64, patchset: u64) -> ReviewResult<String> {
        let state = self.state.lock().unwrap();
        if let Some(error) = &state.fail_fetch {
            return Err(error.clone());
        }
        state
            .patches
            .get(&(issue, patchset))
            .cloned()
            .ok_or(ReviewError::NotFound(issue))
    }

    async fn post_comment(&self, issue: u64, message: &str) -> ReviewResult<()> {
        self.state
            .lock()
            .unwrap()
            .comments
            .push((issue, message.to_string()));
        Ok(())
    }

    async fn close_issue(&self, issue: u64) -> ReviewResult<()> {
        let mut state = self.state.lock().unwrap();
        state.pending.remove(&issue);
        state.closed.push(issue);
        Ok(())
    }

    async fn trigger_try_jobs(
        &self,
        issue: u64,
        patchset: u64,
        builders: &[String],
    ) -> ReviewResult<()> {
        self.state
            .lock()
            .unwrap()
            .triggered
            .push((issue, patchset, builders.to_vec()));
        Ok(())
    }

    async fn get_try_jobs(&self, issue: u64, patchset: u64) -> ReviewResult<Vec<TryJobResult>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .try_jobs
            .get(&(issue, patchset))
            .cloned()
            .unwrap_or_default())
    }

    fn issue_url(&self, issue: u64) -> String {
        format!("https://review.example.org/{issue}")
    }
}

// ---------------------------------------------------------------------------
// FakeCheckout
// ---------------------------------------------------------------------------

/// A commit recorded by [`FakeCheckout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCommit {
    pub revision: String,
    pub message: String,
    pub author: String,
    pub patch: String,
}

#[derive(Debug, Default)]
struct CheckoutState {
    applied: Option<String>,
    commits: Vec<FakeCommit>,
    reverts: usize,
    reject_patches_containing: Vec<String>,
    fail_commit: bool,
    failing_pushes: usize,
    fail_revert: bool,
}

/// Working copy that only remembers which patch is applied.
///
/// Applying onto a dirty copy fails, so callers must revert first.
#[derive(Debug)]
pub struct FakeCheckout {
    path: PathBuf,
    state: Mutex<CheckoutState>,
}

impl FakeCheckout {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(CheckoutState::default()),
        }
    }

    /// Refuse any patch containing `needle`.
    pub fn reject_patches_containing(&self, needle: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .reject_patches_containing
            .push(needle.into());
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.state.lock().unwrap().fail_commit = fail;
    }

    /// Reject the next `count` pushes; the local commit is dropped each time.
    pub fn set_fail_push(&self, count: usize) {
        self.state.lock().unwrap().failing_pushes = count;
    }

    pub fn set_fail_revert(&self, fail: bool) {
        self.state.lock().unwrap().fail_revert = fail;
    }

    /// Patch currently applied, if any.
    pub fn applied(&self) -> Option<String> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn commits(&self) -> Vec<FakeCommit> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn revert_count(&self) -> usize {
        self.state.lock().unwrap().reverts
    }
}

impl Default for FakeCheckout {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

#[async_trait]
impl Checkout for FakeCheckout {
    async fn apply_patch(&self, patch: &str) -> CheckoutResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.applied.is_some() {
            return Err(CheckoutError::PatchFailed(
                "working copy has local modifications".to_string(),
            ));
        }
        if state
            .reject_patches_containing
            .iter()
            .any(|needle| patch.contains(needle.as_str()))
        {
            return Err(CheckoutError::PatchFailed("hunk #1 FAILED".to_string()));
        }
        state.applied = Some(patch.to_string());
        Ok(())
    }

    async fn commit(&self, message: &str, author: &str) -> CheckoutResult<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail_commit {
            return Err(CheckoutError::CommitFailed("remote rejected push".to_string()));
        }
        let Some(patch) = state.applied.take() else {
            return Err(CheckoutError::CommitFailed("nothing to commit".to_string()));
        };
        if state.failing_pushes > 0 {
            state.failing_pushes -= 1;
            return Err(CheckoutError::PushFailed(
                "remote end hung up unexpectedly".to_string(),
            ));
        }
        let revision = format!("r{}", 1000 + state.commits.len());
        state.commits.push(FakeCommit {
            revision: revision.clone(),
            message: message.to_string(),
            author: author.to_string(),
            patch,
        });
        Ok(revision)
    }

    async fn revert(&self) -> CheckoutResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_revert {
            return Err(CheckoutError::RevertFailed("index.lock exists".to_string()));
        }
        state.applied = None;
        state.reverts += 1;
        Ok(())
    }

    fn project_path(&self) -> &Path {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// RecordingStatusSink
// ---------------------------------------------------------------------------

/// Status sink keeping every update in memory.
#[derive(Debug, Default)]
pub struct RecordingStatusSink {
    updates: Mutex<Vec<(u64, StatusPayload)>>,
}

impl RecordingStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<(u64, StatusPayload)> {
        self.updates.lock().unwrap().clone()
    }

    /// Payloads sent about `issue` by `verification`.
    pub fn payloads_for(&self, issue: u64, verification: &str) -> Vec<serde_json::Value> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, p)| *i == issue && p.verification == verification)
            .map(|(_, p)| p.payload.clone())
            .collect()
    }
}

impl StatusSink for RecordingStatusSink {
    fn send(&self, pending: &ChangeInfo, payload: StatusPayload) {
        self.updates.lock().unwrap().push((pending.issue, payload));
    }
}

// ---------------------------------------------------------------------------
// ScriptedVerifier
// ---------------------------------------------------------------------------

/// What a [`ScriptedVerifier`] does when asked to verify a change.
#[derive(Debug, Clone)]
pub enum Scripted {
    Status(VerifierStatus),
    Discard(String),
    Error(String),
    Panic(String),
}

/// Verifier whose outcomes are set up front, per issue or by default.
///
/// Changes left PROCESSING can be settled later with
/// [`resolve_on_poll`](Self::resolve_on_poll), which the next
/// `update_status` applies.
#[derive(Debug)]
pub struct ScriptedVerifier {
    name: String,
    default: Scripted,
    per_issue: Mutex<HashMap<u64, Scripted>>,
    on_poll: Mutex<HashMap<u64, VerifierStatus>>,
    calls: Mutex<Vec<u64>>,
    seen_patches: Mutex<Vec<Option<String>>>,
    checkout: Option<Arc<FakeCheckout>>,
    polls: AtomicUsize,
}

impl ScriptedVerifier {
    pub fn new(name: impl Into<String>, default: Scripted) -> Self {
        Self {
            name: name.into(),
            default,
            per_issue: Mutex::new(HashMap::new()),
            on_poll: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            seen_patches: Mutex::new(Vec::new()),
            checkout: None,
            polls: AtomicUsize::new(0),
        }
    }

    pub fn succeeding(name: impl Into<String>) -> Self {
        Self::new(name, Scripted::Status(SimpleStatus::succeeded().into()))
    }

    pub fn processing(name: impl Into<String>) -> Self {
        Self::new(name, Scripted::Status(SimpleStatus::processing().into()))
    }

    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            name,
            Scripted::Status(SimpleStatus::failed(message).into()),
        )
    }

    /// Record the checkout's applied patch every time `verify` runs.
    pub fn observing(mut self, checkout: Arc<FakeCheckout>) -> Self {
        self.checkout = Some(checkout);
        self
    }

    pub fn with_outcome(self, issue: u64, outcome: Scripted) -> Self {
        self.set_outcome(issue, outcome);
        self
    }

    pub fn set_outcome(&self, issue: u64, outcome: Scripted) {
        self.per_issue.lock().unwrap().insert(issue, outcome);
    }

    pub fn resolve_on_poll(&self, issue: u64, status: VerifierStatus) {
        self.on_poll.lock().unwrap().insert(issue, status);
    }

    /// Issues verified so far, in call order.
    pub fn calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }

    pub fn seen_patches(&self) -> Vec<Option<String>> {
        self.seen_patches.lock().unwrap().clone()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify(&self, pending: &PendingChange) -> VerifyResult<VerifierStatus> {
        self.calls.lock().unwrap().push(pending.issue());
        if let Some(checkout) = &self.checkout {
            self.seen_patches.lock().unwrap().push(checkout.applied());
        }
        let outcome = self
            .per_issue
            .lock()
            .unwrap()
            .get(&pending.issue())
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        match outcome {
            Scripted::Status(status) => Ok(status),
            Scripted::Discard(status) => Err(DiscardPending::new(&pending.info, status).into()),
            Scripted::Error(message) => Err(VerifyError::Other(message)),
            Scripted::Panic(message) => panic!("{message}"),
        }
    }

    async fn update_status(&self, queue: &mut [PendingChange]) -> VerifyResult<()> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut on_poll = self.on_poll.lock().unwrap();
        for (info, status) in pending_loop(&self.name, queue, VerifierStatus::default, true) {
            if let Some(resolved) = on_poll.remove(&info.issue) {
                *status = resolved;
            }
        }
        Ok(())
    }
}
