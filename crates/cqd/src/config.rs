//! Daemon configuration, read from one TOML file.
//!
//! ```toml
//! [review]
//! url = "https://review.example.org"
//! user = "commit-bot@example.org"
//!
//! [checkout]
//! path = "/srv/commit-queue/src"
//! remote = "origin"
//! server_hooks_missing = true
//!
//! [state]
//! path = "/var/lib/commit-queue/queue.json"
//!
//! [manager]
//! workers = 4
//! round_delay_secs = 30
//!
//! [status]
//! url = "https://status.example.org/cq"
//!
//! [[verifiers]]
//! kind = "project_base"
//! patterns = ["https://git\\.example\\.org/project\\.git.*"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use cq_core::ManagerConfig;
use cq_integrations::{GitCheckoutConfig, ReviewClientConfig};
use cq_verifiers::VerifierConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSection {
    /// Queue snapshot file.
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("commit-queue.state.json")
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSection {
    pub workers: usize,
    pub round_delay_secs: u64,
    /// Timeout for tree status lookups.
    pub http_timeout_secs: u64,
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            workers: 4,
            round_delay_secs: 30,
            http_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSection {
    pub url: String,
    #[serde(default = "default_status_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_status_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub review: ReviewClientConfig,
    pub checkout: GitCheckoutConfig,
    #[serde(default)]
    pub state: StateSection,
    #[serde(default)]
    pub manager: ManagerSection,
    /// Status push; updates are dropped when absent.
    #[serde(default)]
    pub status: Option<StatusSection>,
    #[serde(default)]
    pub verifiers: Vec<VerifierConfig>,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.manager.workers == 0 {
            return Err(ConfigError::Invalid(
                "manager.workers must be at least 1".to_string(),
            ));
        }
        if self.verifiers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[verifiers]] entry is required".to_string(),
            ));
        }
        let mut names: Vec<&str> = self.verifiers.iter().map(VerifierConfig::name).collect();
        names.sort();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(ConfigError::Invalid(format!(
                "verifier `{}` is configured twice",
                pair[0]
            )));
        }
        Ok(())
    }

    pub fn manager_config(&self, max_rounds: Option<u64>) -> ManagerConfig {
        ManagerConfig {
            workers: self.manager.workers,
            round_delay: Duration::from_secs(self.manager.round_delay_secs),
            max_rounds,
        }
    }
}
