//! Restricts the queue to changes against known repositories.

use async_trait::async_trait;
use cq_core::{PendingChange, SimpleStatus, Verifier, VerifierStatus, VerifyResult};
use regex::Regex;
use tracing::debug;

use crate::error::{anchored, BuildError};

/// SUCCEEDED when the change's base URL matches one of the configured
/// patterns, IGNORED otherwise. Patterns must match the whole URL.
#[derive(Debug)]
pub struct ProjectBaseUrlVerifier {
    patterns: Vec<Regex>,
}

impl ProjectBaseUrlVerifier {
    pub const NAME: &'static str = "project_bases";

    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, BuildError> {
        let patterns = patterns
            .iter()
            .map(|p| anchored(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn accepts(&self, base_url: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(base_url))
    }
}

#[async_trait]
impl Verifier for ProjectBaseUrlVerifier {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn verify(&self, pending: &PendingChange) -> VerifyResult<VerifierStatus> {
        if self.accepts(&pending.info.base_url) {
            return Ok(SimpleStatus::succeeded().into());
        }
        debug!(
            issue = pending.issue(),
            base_url = %pending.info.base_url,
            "Base URL not handled by this queue"
        );
        Ok(SimpleStatus::ignored().into())
    }
}
