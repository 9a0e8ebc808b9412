//! Errors raised while turning configuration into verifiers.

use cq_core::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("verifier `{0}` has an empty command")]
    EmptyCommand(String),

    #[error("verifier `{0}` needs at least one builder")]
    NoBuilders(String),

    #[error(transparent)]
    Registry(#[from] EngineError),
}

/// Compile `pattern` so that it must match the whole input.
pub(crate) fn anchored(pattern: &str) -> Result<regex::Regex, BuildError> {
    regex::Regex::new(&format!("^(?:{pattern})$")).map_err(|source| BuildError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}
