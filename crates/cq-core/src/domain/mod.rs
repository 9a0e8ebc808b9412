//! Domain model for pending changes and their verification outcomes.

pub mod pending;
pub mod state;
pub mod status;
pub mod verified;

pub use pending::{ChangeInfo, PendingChange, ReviewMessage, SettledChange, SettledOutcome};
pub use state::VerificationState;
pub use status::{
    SimpleStatus, StatusView, TreeStatus, TryJobState, TryJobsStatus, TrackedTryJob,
    VerifierStatus,
};
pub use verified::Verified;
