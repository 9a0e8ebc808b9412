//! Requires approval from a committer other than the change owner.

use async_trait::async_trait;
use cq_core::{ChangeInfo, PendingChange, SimpleStatus, Verifier, VerifierStatus, VerifyResult};
use regex::Regex;

use crate::error::{anchored, BuildError};

/// Failure message while no valid approval exists.
pub const NO_LGTM: &str = "No LGTM from a valid reviewer yet. Only full committers are accepted.";

/// SUCCEEDED once a committer approved the change, FAILED otherwise.
///
/// A message approves when the review service flagged it as an approval or
/// one of its lines starts with "lgtm". Self-approvals never count.
#[derive(Debug)]
pub struct ReviewerLgtmVerifier {
    committers: Vec<Regex>,
    lgtm_line: Regex,
}

impl ReviewerLgtmVerifier {
    pub const NAME: &'static str = "reviewer_lgtm";

    /// `committers` are patterns matched against the whole sender address.
    pub fn new<S: AsRef<str>>(committers: &[S]) -> Result<Self, BuildError> {
        let committers = committers
            .iter()
            .map(|p| anchored(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let lgtm_line = Regex::new(r"(?im)^\s*lgtm\b").map_err(|source| BuildError::InvalidPattern {
            pattern: "lgtm".to_string(),
            source,
        })?;
        Ok(Self {
            committers,
            lgtm_line,
        })
    }

    pub fn is_committer(&self, email: &str) -> bool {
        let email = email.to_lowercase();
        self.committers.iter().any(|p| p.is_match(&email))
    }

    /// Whether any committer other than the owner approved.
    pub fn has_lgtm(&self, info: &ChangeInfo) -> bool {
        let owner = info.owner.to_lowercase();
        info.messages.iter().any(|message| {
            message.sender.to_lowercase() != owner
                && self.is_committer(&message.sender)
                && (message.approval || self.lgtm_line.is_match(&message.text))
        })
    }
}

#[async_trait]
impl Verifier for ReviewerLgtmVerifier {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn verify(&self, pending: &PendingChange) -> VerifyResult<VerifierStatus> {
        if self.has_lgtm(&pending.info) {
            Ok(SimpleStatus::succeeded().into())
        } else {
            Ok(SimpleStatus::failed(NO_LGTM).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::pending_with;
    use cq_core::{ReviewMessage, StatusView, VerificationState};

    fn verifier() -> ReviewerLgtmVerifier {
        ReviewerLgtmVerifier::new(&[r".*@example\.org"]).unwrap()
    }

    fn message(sender: &str, text: &str) -> ReviewMessage {
        ReviewMessage {
            sender: sender.to_string(),
            text: text.to_string(),
            approval: false,
        }
    }

    #[tokio::test]
    async fn committer_lgtm_succeeds() {
        let pending = pending_with(1, |info| {
            info.messages
                .push(message("reviewer@example.org", "Nice cleanup.\n\nLGTM"))
        });
        let status = verifier().verify(&pending).await.unwrap();
        assert_eq!(status.state(), VerificationState::Succeeded);
    }

    #[tokio::test]
    async fn missing_lgtm_fails_with_explanation() {
        let pending = pending_with(1, |info| {
            info.messages
                .push(message("reviewer@example.org", "please add a test"))
        });
        let status = verifier().verify(&pending).await.unwrap();
        assert_eq!(status.state(), VerificationState::Failed);
        assert_eq!(status.error_message(), Some(NO_LGTM));
    }

    #[test]
    fn self_approval_does_not_count() {
        let pending = pending_with(1, |info| {
            info.messages.push(message("Author@example.org", "lgtm"))
        });
        assert!(!verifier().has_lgtm(&pending.info));
    }

    #[test]
    fn non_committer_does_not_count() {
        let pending = pending_with(1, |info| {
            info.messages.push(message("drive-by@elsewhere.com", "lgtm"))
        });
        assert!(!verifier().has_lgtm(&pending.info));
    }

    #[test]
    fn not_lgtm_is_not_an_approval_but_the_flag_is() {
        let mut info = pending_with(1, |_| {}).info;
        info.messages
            .push(message("reviewer@example.org", "not lgtm, see comments"));
        assert!(!verifier().has_lgtm(&info));

        info.messages.push(ReviewMessage {
            sender: "reviewer@example.org".to_string(),
            text: "Looks good".to_string(),
            approval: true,
        });
        assert!(verifier().has_lgtm(&info));
    }
}
