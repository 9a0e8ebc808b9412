//! Snapshot storage contract.
//!
//! A snapshot is an opaque UTF-8 payload (the serialized pending queue).
//! Backends wrap it in a [`SnapshotEnvelope`] that records the payload
//! digest, so a truncated or hand-edited file is rejected on restore
//! instead of silently producing a partial queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::ContentDigest;
use crate::error::StateError;
use crate::Result;

/// Envelope format written by this crate.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Persisted wrapper around a snapshot payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    /// Envelope format version
    pub format: u32,
    /// When the snapshot was sealed
    pub saved_at: DateTime<Utc>,
    /// SHA-256 of `payload`
    pub digest: ContentDigest,
    /// The serialized queue
    pub payload: String,
}

impl SnapshotEnvelope {
    /// Wrap a payload, computing its digest.
    pub fn seal(payload: impl Into<String>) -> Self {
        let payload = payload.into();
        Self {
            format: SNAPSHOT_FORMAT_VERSION,
            saved_at: Utc::now(),
            digest: ContentDigest::from_bytes(payload.as_bytes()),
            payload,
        }
    }

    /// Verify format version and digest, returning the payload.
    pub fn open(self) -> Result<String> {
        if self.format != SNAPSHOT_FORMAT_VERSION {
            return Err(StateError::UnsupportedVersion {
                found: self.format,
                supported: SNAPSHOT_FORMAT_VERSION,
            });
        }
        let actual = ContentDigest::from_bytes(self.payload.as_bytes());
        if actual != self.digest {
            return Err(StateError::Corrupted {
                expected: self.digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(self.payload)
    }
}

/// Durable store for the queue snapshot.
///
/// Guarantees:
/// - `save` replaces the previous snapshot atomically: a crash mid-save
///   leaves either the old or the new snapshot, never a mix.
/// - `load` after `save(p)` returns exactly `p`.
/// - `load` on a store that was never written returns `Ok(None)`.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Atomically replace the stored snapshot, returning the payload digest.
    async fn save(&self, payload: &str) -> Result<ContentDigest>;

    /// Load the most recent snapshot payload.
    async fn load(&self) -> Result<Option<String>>;
}
