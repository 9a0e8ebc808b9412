//! Configuration-driven verifier registration.

use std::sync::Arc;
use std::time::Duration;

use cq_core::{Context, VerifierRegistry};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::command::CommandVerifier;
use crate::error::BuildError;
use crate::project_base::ProjectBaseUrlVerifier;
use crate::reviewer_lgtm::ReviewerLgtmVerifier;
use crate::tree_status::{TreeStatusSource, TreeStatusVerifier};
use crate::try_jobs::TryJobsVerifier;

fn default_command_timeout_secs() -> u64 {
    1800
}

fn default_try_job_timeout_secs() -> u64 {
    4 * 3600
}

/// One `[[verifiers]]` entry, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerifierConfig {
    ProjectBase {
        patterns: Vec<String>,
    },
    ReviewerLgtm {
        committers: Vec<String>,
    },
    Command {
        name: String,
        command: Vec<String>,
        #[serde(default = "default_command_timeout_secs")]
        timeout_secs: u64,
    },
    TreeStatus {
        url: String,
    },
    TryJobs {
        builders: Vec<String>,
        #[serde(default)]
        max_retries: u32,
        #[serde(default = "default_try_job_timeout_secs")]
        timeout_secs: u64,
    },
}

impl VerifierConfig {
    /// Registry key the configured verifier will use.
    pub fn name(&self) -> &str {
        match self {
            VerifierConfig::ProjectBase { .. } => ProjectBaseUrlVerifier::NAME,
            VerifierConfig::ReviewerLgtm { .. } => ReviewerLgtmVerifier::NAME,
            VerifierConfig::Command { name, .. } => name,
            VerifierConfig::TreeStatus { .. } => TreeStatusVerifier::NAME,
            VerifierConfig::TryJobs { .. } => TryJobsVerifier::NAME,
        }
    }
}

/// Build every configured verifier, in order, into one registry.
pub fn build_registry(
    configs: &[VerifierConfig],
    context: &Arc<Context>,
    tree_source: Arc<dyn TreeStatusSource>,
) -> Result<VerifierRegistry, BuildError> {
    let mut registry = VerifierRegistry::new();
    for config in configs {
        match config {
            VerifierConfig::ProjectBase { patterns } => {
                registry.register(Arc::new(ProjectBaseUrlVerifier::new(patterns.as_slice())?))?
            }
            VerifierConfig::ReviewerLgtm { committers } => {
                registry.register(Arc::new(ReviewerLgtmVerifier::new(committers.as_slice())?))?
            }
            VerifierConfig::Command {
                name,
                command,
                timeout_secs,
            } => registry.register(Arc::new(CommandVerifier::new(
                name.clone(),
                command.clone(),
                Duration::from_secs(*timeout_secs),
                Arc::clone(context),
            )?))?,
            VerifierConfig::TreeStatus { url } => registry.register(Arc::new(
                TreeStatusVerifier::new(url.clone(), Arc::clone(&tree_source)),
            ))?,
            VerifierConfig::TryJobs {
                builders,
                max_retries,
                timeout_secs,
            } => registry.register(Arc::new(TryJobsVerifier::new(
                builders.clone(),
                *max_retries,
                Duration::from_secs(*timeout_secs),
                Arc::clone(context),
            )?))?,
        }
    }
    info!(verifiers = ?registry.names(), "Verifiers registered");
    Ok(registry)
}
