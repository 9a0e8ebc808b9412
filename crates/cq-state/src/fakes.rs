//! In-memory fakes for the snapshot store (testing only)
//!
//! `MemorySnapshotStore` satisfies the `SnapshotStore` contract without
//! touching the filesystem and can be told to reject the next save.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::digest::ContentDigest;
use crate::error::StateError;
use crate::store::{SnapshotEnvelope, SnapshotStore};
use crate::Result;

/// In-memory snapshot store holding the last sealed envelope.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    current: Mutex<Option<SnapshotEnvelope>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the store, as if a previous process had saved `payload`.
    pub fn with_payload(payload: &str) -> Self {
        let store = Self::default();
        *store.current.lock().unwrap() = Some(SnapshotEnvelope::seal(payload));
        store
    }

    /// Make every subsequent save fail until reset with `false`.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Last saved payload, bypassing digest verification.
    pub fn raw_payload(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.payload.clone())
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, payload: &str) -> Result<ContentDigest> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StateError::WriteRejected("injected save failure".to_string()));
        }
        let envelope = SnapshotEnvelope::seal(payload);
        let digest = envelope.digest.clone();
        *self.current.lock().unwrap() = Some(envelope);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(digest)
    }

    async fn load(&self) -> Result<Option<String>> {
        let current = self.current.lock().unwrap().clone();
        current.map(SnapshotEnvelope::open).transpose()
    }
}
