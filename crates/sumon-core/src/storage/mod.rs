//! Snapshot records on disk: the record model, the daily append-only files
//! and their retention.

pub mod retention;
pub mod snapshot;
pub mod writer;

use std::io;

pub use retention::{RetentionResult, enforce_retention, spawn_retention};
pub use snapshot::Snapshot;
pub use writer::{FILE_PREFIX, LogicalDay, SnapshotWriter};

/// Errors from writing or pruning snapshot files.
#[derive(Debug)]
pub enum StorageError {
    Io(io::Error),
    Serialize(serde_json::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "storage I/O error: {}", e),
            StorageError::Serialize(e) => write!(f, "snapshot serialization error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialize(e)
    }
}
