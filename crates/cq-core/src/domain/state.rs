//! Verification state ordinals.

use serde::{Deserialize, Serialize};

/// Outcome state of one verifier, or of a whole pending change.
///
/// Declaration order is the aggregation priority: the derived `Ord` makes
/// `Ignored > Failed > Processing > Succeeded`, matching the ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum VerificationState {
    Succeeded = 0,
    Processing = 1,
    Failed = 2,
    Ignored = 3,
}

impl VerificationState {
    /// Numeric ordinal used by aggregation.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Whether no further polling can change this state.
    pub fn is_terminal(self) -> bool {
        self != VerificationState::Processing
    }

    /// Lowercase name, as used in status payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationState::Succeeded => "succeeded",
            VerificationState::Processing => "processing",
            VerificationState::Failed => "failed",
            VerificationState::Ignored => "ignored",
        }
    }
}

impl std::fmt::Display for VerificationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
