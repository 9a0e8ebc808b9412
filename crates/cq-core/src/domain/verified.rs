//! Aggregation of per-verifier outcomes into one decision.

use std::collections::BTreeMap;

use super::pending::PendingChange;
use super::state::VerificationState;
use super::status::{StatusView, VerifierStatus};

/// Aggregate view over a verifier name → status mapping.
///
/// Iteration is in verifier-name order, so the combined error message and
/// why-not text are deterministic.
pub trait Verified {
    fn verifications(&self) -> &BTreeMap<String, VerifierStatus>;

    /// Non-empty per-verifier error messages joined by a blank line.
    fn error_message(&self) -> String {
        self.verifications()
            .values()
            .filter_map(|status| status.error_message())
            .filter(|message| !message.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Combined state.
    ///
    /// Any error message forces FAILED. No verification yet means PROCESSING.
    /// Otherwise the highest ordinal wins: IGNORED > FAILED > PROCESSING >
    /// SUCCEEDED.
    fn get_state(&self) -> VerificationState {
        if !self.error_message().is_empty() {
            return VerificationState::Failed;
        }
        self.verifications()
            .values()
            .map(StatusView::state)
            .max()
            .unwrap_or(VerificationState::Processing)
    }

    /// Whether any verifier holds the commit back.
    fn postpone(&self) -> bool {
        self.verifications().values().any(StatusView::postpone)
    }

    /// One `name: reason` line per verifier that gave a reason.
    fn why_not(&self) -> String {
        self.verifications()
            .iter()
            .filter_map(|(name, status)| status.why_not().map(|why| format!("{name}: {why}")))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Verified for PendingChange {
    fn verifications(&self) -> &BTreeMap<String, VerifierStatus> {
        &self.verifications
    }
}

impl Verified for BTreeMap<String, VerifierStatus> {
    fn verifications(&self) -> &BTreeMap<String, VerifierStatus> {
        self
    }
}
