//! Engine-level error taxonomy.

use cq_state::StateError;

use crate::context::{CheckoutError, ReviewError};
use crate::pool::PoolError;
use crate::verification::DiscardPending;

/// Errors produced by the pending manager.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// One change must leave the queue; the round continues.
    #[error(transparent)]
    Discard(#[from] DiscardPending),

    #[error("review service error: {0}")]
    Review(#[from] ReviewError),

    #[error("checkout error: {0}")]
    Checkout(#[from] CheckoutError),

    #[error("verification pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StateError),

    #[error("queue snapshot is not decodable: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// A verified change could not be pushed; it stays queued for the next
    /// round.
    #[error("push of issue {issue} deferred: {reason}")]
    PushDeferred { issue: u64, reason: String },

    #[error("duplicate verifier name: {0}")]
    DuplicateVerifier(String),
}

impl EngineError {
    /// Errors that only cost the current round; the loop carries on with the
    /// next one. Everything else stops the engine.
    pub fn is_round_abort(&self) -> bool {
        matches!(self, EngineError::Review(_))
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_errors_only_abort_the_round() {
        let err = EngineError::from(ReviewError::Transport("timeout".to_string()));
        assert!(err.is_round_abort());

        let err = EngineError::from(StateError::WriteRejected("disk full".to_string()));
        assert!(!err.is_round_abort());
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn discard_displays_its_status() {
        let err = EngineError::from(DiscardPending {
            issue: 12,
            patchset: 3,
            status: "Failed to apply the patch.".to_string(),
        });
        assert!(err.to_string().contains("Failed to apply the patch."));
        assert!(!err.is_round_abort());
    }

    #[test]
    fn deferred_push_is_not_a_round_abort() {
        let err = EngineError::PushDeferred {
            issue: 4,
            reason: "remote end hung up".to_string(),
        };
        assert!(!err.is_round_abort());
        assert!(err.to_string().contains("issue 4"));
    }
}
