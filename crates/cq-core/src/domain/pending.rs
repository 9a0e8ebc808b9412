//! Pending change records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cq_state::ContentDigest;
use serde::{Deserialize, Serialize};

use super::status::VerifierStatus;

/// A message left on the review, as returned by the review service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewMessage {
    pub sender: String,
    pub text: String,
    /// Whether the review service flagged this message as an approval.
    #[serde(default)]
    pub approval: bool,
}

/// Review-service facts about a change. Verifiers read these; only the
/// pending manager ever replaces them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub issue: u64,
    pub patchset: u64,
    pub owner: String,
    #[serde(default)]
    pub reviewers: Vec<String>,
    pub description: String,
    /// Repository URL the change targets.
    pub base_url: String,
    /// Checkout-relative directory the patch applies in.
    #[serde(default)]
    pub relpath: String,
    #[serde(default)]
    pub messages: Vec<ReviewMessage>,
    pub created_at: DateTime<Utc>,
}

impl ChangeInfo {
    /// Same issue and same uploaded patchset.
    pub fn same_revision(&self, other: &ChangeInfo) -> bool {
        self.issue == other.issue && self.patchset == other.patchset
    }
}

/// One change in the commit queue together with its verification record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    pub info: ChangeInfo,
    /// Patch content, downloaded the first time the change is dispatched.
    #[serde(default)]
    pub patch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_digest: Option<ContentDigest>,
    /// Verifier name → that verifier's outcome.
    #[serde(default)]
    pub verifications: BTreeMap<String, VerifierStatus>,
    /// Last failure report posted to the review, to avoid re-posting it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_report: Option<String>,
}

impl PendingChange {
    /// A freshly discovered change with no verification yet.
    pub fn new(info: ChangeInfo) -> Self {
        Self {
            info,
            patch: String::new(),
            patch_digest: None,
            verifications: BTreeMap::new(),
            last_report: None,
        }
    }

    pub fn issue(&self) -> u64 {
        self.info.issue
    }

    pub fn patchset(&self) -> u64 {
        self.info.patchset
    }

    /// Record the downloaded patch.
    pub fn set_patch(&mut self, patch: String) {
        self.patch_digest = Some(ContentDigest::from_bytes(patch.as_bytes()));
        self.patch = patch;
    }

    /// Names from `registered` that have no status for this change yet.
    pub fn missing_verifications<'a>(&self, registered: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        registered
            .into_iter()
            .filter(|name| !self.verifications.contains_key(*name))
            .collect()
    }
}

/// How a change left the queue without staying on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettledOutcome {
    Committed,
    Discarded,
    Ignored,
}

/// A patchset the queue is done with. Discovery skips it while the review
/// service keeps listing the same patchset; a new upload clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettledChange {
    pub patchset: u64,
    pub outcome: SettledOutcome,
}

#[cfg(test)]
pub(crate) fn sample_info(issue: u64, patchset: u64) -> ChangeInfo {
    ChangeInfo {
        issue,
        patchset,
        owner: "author@example.org".to_string(),
        reviewers: vec!["reviewer@example.org".to_string()],
        description: format!("Change {issue}"),
        base_url: "https://git.example.org/project.git".to_string(),
        relpath: String::new(),
        messages: Vec::new(),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::status::SimpleStatus;

    #[test]
    fn new_change_has_no_verifications() {
        let pending = PendingChange::new(sample_info(7, 1));
        assert!(pending.verifications.is_empty());
        assert!(pending.patch.is_empty());
        assert!(pending.patch_digest.is_none());
    }

    #[test]
    fn set_patch_records_digest() {
        let mut pending = PendingChange::new(sample_info(7, 1));
        pending.set_patch("diff --git a/x b/x\n".to_string());
        assert_eq!(
            pending.patch_digest,
            Some(ContentDigest::from_bytes(b"diff --git a/x b/x\n"))
        );
    }

    #[test]
    fn missing_verifications_skips_recorded_names() {
        let mut pending = PendingChange::new(sample_info(7, 1));
        pending
            .verifications
            .insert("style".to_string(), SimpleStatus::succeeded().into());

        let missing = pending.missing_verifications(["style", "tests", "tree"]);
        assert_eq!(missing, vec!["tests", "tree"]);
    }

    #[test]
    fn same_revision_compares_issue_and_patchset() {
        let a = sample_info(7, 1);
        let b = sample_info(7, 2);
        assert!(a.same_revision(&a.clone()));
        assert!(!a.same_revision(&b));
    }
}
