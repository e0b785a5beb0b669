//! Polling watcher over the directories of the monitored logs.
//!
//! Each scan stats the direct entries of every watched directory and
//! compares them with the previous scan. The first scan is the baseline and
//! reports nothing.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::aggregator::EventAggregator;
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
    inode: u64,
}

impl Fingerprint {
    fn of(metadata: &fs::Metadata) -> Self {
        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
            inode: get_inode(metadata),
        }
    }
}

/// Detects created, modified and deleted files in a set of directories.
pub struct DirectoryWatcher {
    dirs: Vec<PathBuf>,
    known: HashMap<PathBuf, Fingerprint>,
    primed: bool,
}

impl DirectoryWatcher {
    /// Watches the given directories. Duplicates are collapsed and
    /// directories that do not exist are skipped with a warning.
    pub fn new(dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut watched: Vec<PathBuf> = Vec::new();
        for dir in dirs {
            if watched.contains(&dir) {
                continue;
            }
            if !dir.is_dir() {
                warn!("Cannot watch {}: not an existing directory", dir.display());
                continue;
            }
            watched.push(dir);
        }
        Self {
            dirs: watched,
            known: HashMap::new(),
            primed: false,
        }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Rescans all directories and returns the paths that changed since the
    /// previous scan, sorted.
    pub fn scan(&mut self) -> Vec<PathBuf> {
        let mut current = HashMap::with_capacity(self.known.len());
        for dir in &self.dirs {
            if let Err(e) = scan_dir(dir, &mut current) {
                debug!("Failed to scan {}: {}", dir.display(), e);
            }
        }

        let mut changed = Vec::new();
        if self.primed {
            for (path, fp) in &current {
                if self.known.get(path) != Some(fp) {
                    changed.push(path.clone());
                }
            }
            for path in self.known.keys() {
                if !current.contains_key(path) {
                    changed.push(path.clone());
                }
            }
            changed.sort();
        }

        self.known = current;
        self.primed = true;
        changed
    }
}

fn scan_dir(dir: &Path, into: &mut HashMap<PathBuf, Fingerprint>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        // Entries can vanish between listing and stat.
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_file() {
            into.insert(entry.path(), Fingerprint::of(&metadata));
        }
    }
    Ok(())
}

/// Runs the watcher on a worker thread. Returns `None` when there is nothing
/// to watch.
pub fn spawn_watcher(
    mut watcher: DirectoryWatcher,
    aggregator: Arc<EventAggregator>,
    poll_interval: Duration,
) -> io::Result<Option<Worker>> {
    if watcher.dirs().is_empty() {
        return Ok(None);
    }
    let worker = Worker::spawn("dir-watcher", move |stop| {
        loop {
            for path in watcher.scan() {
                aggregator.record_file_change(&path);
            }
            if !stop.sleep(poll_interval) {
                break;
            }
        }
        debug!("Directory watcher stopped");
    })?;
    Ok(Some(worker))
}

#[cfg(unix)]
fn get_inode(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn get_inode(_metadata: &fs::Metadata) -> u64 {
    0
}
