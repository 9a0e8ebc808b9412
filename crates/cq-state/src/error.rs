//! Error types for cq-state

use thiserror::Error;

/// Errors that can occur in the snapshot persistence layer
#[derive(Error, Debug)]
pub enum StateError {
    /// Filesystem error while reading or writing a snapshot
    #[error("Snapshot I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// Stored digest does not match the payload
    #[error("Snapshot is corrupted: expected digest {expected}, found {actual}")]
    Corrupted { expected: String, actual: String },

    /// Snapshot written by an incompatible format version
    #[error("Unsupported snapshot format version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// Injected or backend-specific write failure
    #[error("Snapshot write rejected: {0}")]
    WriteRejected(String),
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}
