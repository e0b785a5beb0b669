//! Deletes daily snapshot files beyond the retained count.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use super::StorageError;
use super::writer::{FILE_EXTENSION, FILE_PREFIX};
use crate::worker::Worker;

/// Result of one retention pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetentionResult {
    pub files_removed: usize,
    /// Deletions that failed; those files are left in place.
    pub files_failed: usize,
    pub files_remaining: usize,
}

/// Daily snapshot files in `dir` with their creation time (modification
/// time where the platform records no creation time).
pub fn list_snapshot_files(dir: &Path) -> io::Result<Vec<(PathBuf, SystemTime)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_snapshot_file = path.file_name().and_then(|n| n.to_str()).is_some_and(|n| {
            n.starts_with(FILE_PREFIX) && n.ends_with(&format!(".{}", FILE_EXTENSION))
        });
        if !is_snapshot_file {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let created = metadata.created().or_else(|_| metadata.modified())?;
        files.push((path, created));
    }
    Ok(files)
}

/// Orders files newest first and returns everything after the first `keep`.
pub fn select_expired(mut files: Vec<(PathBuf, SystemTime)>, keep: usize) -> Vec<PathBuf> {
    files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    files.into_iter().skip(keep).map(|(path, _)| path).collect()
}

/// Keeps the `keep` newest snapshot files in `dir` and deletes the rest.
pub fn enforce_retention(dir: &Path, keep: usize) -> Result<RetentionResult, StorageError> {
    let files = list_snapshot_files(dir)?;
    let total = files.len();
    let mut result = RetentionResult::default();

    for path in select_expired(files, keep) {
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Deleted old snapshot file {}", path.display());
                result.files_removed += 1;
            }
            Err(e) => {
                warn!("Failed to delete {}: {}", path.display(), e);
                result.files_failed += 1;
            }
        }
    }
    result.files_remaining = total - result.files_removed;
    Ok(result)
}

/// Runs retention at start-up and then every `interval`.
pub fn spawn_retention(dir: PathBuf, keep: usize, interval: Duration) -> io::Result<Worker> {
    Worker::spawn("retention", move |stop| {
        loop {
            match enforce_retention(&dir, keep) {
                Ok(result) => debug!(
                    "Retention pass: {} removed, {} kept",
                    result.files_removed, result.files_remaining
                ),
                Err(e) => warn!("Retention pass failed: {}", e),
            }
            if !stop.sleep(interval) {
                break;
            }
        }
    })
}
