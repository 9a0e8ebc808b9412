//! Errors raised while constructing production collaborators.

#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("`git {command}` failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IntegrationError>;

/// Reject anything that is not an absolute http(s) URL and strip a trailing
/// slash.
pub(crate) fn normalize_base_url(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(IntegrationError::InvalidUrl {
            url: url.to_string(),
            reason: "expected an http:// or https:// URL".to_string(),
        });
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_urls_are_normalized() {
        assert_eq!(
            normalize_base_url("https://review.example.org/").unwrap(),
            "https://review.example.org"
        );
        assert!(matches!(
            normalize_base_url("review.example.org"),
            Err(IntegrationError::InvalidUrl { .. })
        ));
    }
}
