//! Verifier capability, registry and iteration helper.
//!
//! A verifier is a named check run against every pending change. Synchronous
//! verifiers settle their status inside [`Verifier::verify`]; asynchronous
//! ones (remote try jobs, tree status) record PROCESSING there and settle it
//! later from [`Verifier::update_status`], which is polled once per round.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{CheckoutError, Context, ReviewError, StatusPayload};
use crate::domain::{ChangeInfo, PendingChange, StatusView, VerificationState, VerifierStatus};
use crate::error::{EngineError, EngineResult};

/// Instruction to drop a change from the queue without committing it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("issue {issue} (patchset {patchset}) discarded: {status}")]
pub struct DiscardPending {
    pub issue: u64,
    pub patchset: u64,
    /// Explanation posted back to the review.
    pub status: String,
}

impl DiscardPending {
    pub fn new(pending: &ChangeInfo, status: impl Into<String>) -> Self {
        Self {
            issue: pending.issue,
            patchset: pending.patchset,
            status: status.into(),
        }
    }
}

/// Errors a verifier may return.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// The change is invalid and must leave the queue.
    #[error(transparent)]
    Discard(#[from] DiscardPending),

    #[error("review service error: {0}")]
    Review(#[from] ReviewError),

    #[error("checkout error: {0}")]
    Checkout(#[from] CheckoutError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type VerifyResult<T> = std::result::Result<T, VerifyError>;

/// A pluggable check.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Unique key of this verifier's entry in `PendingChange::verifications`.
    fn name(&self) -> &str;

    /// Run the check against one change and return its status.
    ///
    /// For verifiers that need the working copy, the patch is already
    /// applied when this runs.
    async fn verify(&self, pending: &PendingChange) -> VerifyResult<VerifierStatus>;

    /// Poll asynchronous results across the whole queue.
    async fn update_status(&self, _queue: &mut [PendingChange]) -> VerifyResult<()> {
        Ok(())
    }
}

/// A verifier that works against the checkout and reports progress.
pub trait CheckoutVerifier: Verifier {
    fn context(&self) -> &Arc<Context>;

    /// Post a non-blocking status update tagged with this verifier's name.
    fn send_status(&self, pending: &ChangeInfo, data: serde_json::Value) {
        self.context()
            .status
            .send(pending, StatusPayload::new(self.name(), data));
    }
}

/// Visit every change's status for verifier `name`.
///
/// Changes without an entry get one from `gen_obj` first. With
/// `pending_only`, only statuses still PROCESSING are returned, so polling
/// never revisits settled work.
pub fn pending_loop<'a, F>(
    name: &str,
    queue: &'a mut [PendingChange],
    gen_obj: F,
    pending_only: bool,
) -> Vec<(&'a ChangeInfo, &'a mut VerifierStatus)>
where
    F: Fn() -> VerifierStatus,
{
    let mut visited = Vec::new();
    for change in queue.iter_mut() {
        let PendingChange {
            info,
            verifications,
            ..
        } = change;
        let status = verifications
            .entry(name.to_string())
            .or_insert_with(&gen_obj);
        if !pending_only || status.state() == VerificationState::Processing {
            let info: &'a ChangeInfo = info;
            visited.push((info, status));
        }
    }
    visited
}

/// Verifiers registered at startup, in registration order.
#[derive(Clone, Default)]
pub struct VerifierRegistry {
    verifiers: Vec<Arc<dyn Verifier>>,
}

impl VerifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a verifier. Names must be unique.
    pub fn register(&mut self, verifier: Arc<dyn Verifier>) -> EngineResult<()> {
        if self.get(verifier.name()).is_some() {
            return Err(EngineError::DuplicateVerifier(verifier.name().to_string()));
        }
        self.verifiers.push(verifier);
        Ok(())
    }

    /// Builder-style registration.
    pub fn with(mut self, verifier: Arc<dyn Verifier>) -> EngineResult<Self> {
        self.register(verifier)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Verifier>> {
        self.verifiers.iter().find(|v| v.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Verifier>> {
        self.verifiers.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.verifiers.iter().map(|v| v.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.verifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verifiers.is_empty()
    }
}

impl std::fmt::Debug for VerifierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
