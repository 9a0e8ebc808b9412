//! Snapshot store on the local filesystem.
//!
//! Saves replace the snapshot file atomically, so a crash mid-write leaves
//! the previous snapshot readable.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::digest::ContentDigest;
use crate::error::StateError;
use crate::store::{SnapshotEnvelope, SnapshotStore};
use crate::Result;

/// Filesystem-backed snapshot store.
///
/// The envelope is written to a temp file in the target directory, synced,
/// then renamed over the previous snapshot.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    /// Create a store that persists to `path`. Parent directories are
    /// created lazily on the first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StateError {
    StateError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;

    let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| io_error(&dir, e))?;
    tmp.write_all(bytes).map_err(|e| io_error(path, e))?;
    tmp.as_file().sync_all().map_err(|e| io_error(path, e))?;
    tmp.persist(path).map_err(|e| io_error(path, e.error))?;
    Ok(())
}

fn read_envelope(path: &Path) -> Result<Option<SnapshotEnvelope>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, e)),
    };
    let envelope = serde_json::from_slice(&bytes)
        .map_err(|e| StateError::Deserialization(format!("{}: {e}", path.display())))?;
    Ok(Some(envelope))
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, payload: &str) -> Result<ContentDigest> {
        let envelope = SnapshotEnvelope::seal(payload);
        let digest = envelope.digest.clone();
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| StateError::WriteRejected(format!("snapshot writer aborted: {e}")))??;

        debug!(path = %self.path.display(), digest = %digest.short(), "Snapshot saved");
        Ok(digest)
    }

    async fn load(&self) -> Result<Option<String>> {
        let path = self.path.clone();
        let envelope = tokio::task::spawn_blocking(move || read_envelope(&path))
            .await
            .map_err(|e| StateError::Deserialization(format!("snapshot reader aborted: {e}")))??;

        match envelope {
            Some(envelope) => envelope.open().map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FileSnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("state").join("queue.json"));
        (dir, store)
    }

    #[tokio::test]
    async fn load_before_first_save_is_none() {
        let (_dir, store) = make_store();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_creates_parent_dirs_and_round_trips() {
        let (_dir, store) = make_store();
        let digest = store.save(r#"{"pending":[1,2]}"#).await.unwrap();

        assert!(store.path().exists());
        assert_eq!(digest, ContentDigest::from_bytes(br#"{"pending":[1,2]}"#));
        assert_eq!(
            store.load().await.unwrap().as_deref(),
            Some(r#"{"pending":[1,2]}"#)
        );
    }

    #[tokio::test]
    async fn save_replaces_previous_snapshot() {
        let (_dir, store) = make_store();
        store.save("first").await.unwrap();
        store.save("second").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn saves_leave_no_temp_files_behind() {
        let (_dir, store) = make_store();
        for payload in ["one", "two", "three"] {
            store.save(payload).await.unwrap();
        }
        let names: Vec<_> = fs::read_dir(store.path().parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("queue.json")]);
    }

    #[tokio::test]
    async fn garbage_file_is_a_load_error() {
        let (_dir, store) = make_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"{ not json").unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, StateError::Deserialization(_)));
    }

    #[tokio::test]
    async fn edited_payload_is_detected() {
        let (_dir, store) = make_store();
        store.save("honest").await.unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        fs::write(store.path(), raw.replace("honest", "edited")).unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, StateError::Corrupted { .. }));
    }
}
