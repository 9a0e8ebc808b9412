//! cq-verifiers: the checks the commit queue runs on every pending change
//!
//! ## Key Components
//!
//! - `ProjectBaseUrlVerifier`: only changes against known repositories are
//!   considered; the rest are ignored
//! - `ReviewerLgtmVerifier`: requires an approval from a committer
//! - `CommandVerifier`: runs a command (style, build, tests) in the checkout
//! - `TreeStatusVerifier`: holds commits while the tree is closed
//! - `TryJobsVerifier`: triggers remote try jobs and polls their results
//! - `VerifierConfig` + `build_registry`: configuration-driven registration

pub mod command;
pub mod config;
pub mod error;
pub mod project_base;
pub mod reviewer_lgtm;
pub mod tree_status;
pub mod try_jobs;

pub use command::CommandVerifier;
pub use config::{build_registry, VerifierConfig};
pub use error::BuildError;
pub use project_base::ProjectBaseUrlVerifier;
pub use reviewer_lgtm::{ReviewerLgtmVerifier, NO_LGTM};
pub use tree_status::{HttpTreeStatusSource, TreeState, TreeStatusSource, TreeStatusVerifier};
pub use try_jobs::TryJobsVerifier;
