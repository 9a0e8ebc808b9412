//! cq-state: durable queue snapshots for the commit queue
//!
//! The pending manager persists its whole queue as one opaque snapshot
//! before shutdown and after every round, and restores it on startup.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: atomic replacement of the snapshot and integrity on restore.
//!
//! ## Key Components
//!
//! - `SnapshotStore`: save/load contract every backend satisfies
//! - `FileSnapshotStore`: single JSON envelope, replaced via atomic rename
//! - `SnapshotEnvelope`: payload plus its SHA-256 digest and save time

mod digest;
mod error;
pub mod fakes;
pub mod fs;
pub mod store;

pub use digest::ContentDigest;
pub use error::StateError;
pub use fs::FileSnapshotStore;
pub use store::{SnapshotEnvelope, SnapshotStore, SNAPSHOT_FORMAT_VERSION};

/// Result type for cq-state operations
pub type Result<T> = std::result::Result<T, StateError>;
