//! Durable per-file line-count bookmarks.
//!
//! The store is a JSON array of `{filePath, lastObservedAt,
//! lastKnownLineCount}` records, rewritten in full (via a temporary file and
//! rename) after every update.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fmt::format_timestamp;

/// Lines left unscanned behind a newly seen file's end, so the first pass
/// over a large existing log only looks at its tail.
pub const SEED_BACKLOG_LINES: u64 = 1250;

/// Errors from the bookmark store.
#[derive(Debug)]
pub enum BookmarkError {
    Io(io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for BookmarkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookmarkError::Io(e) => write!(f, "bookmark store I/O error: {}", e),
            BookmarkError::Parse(e) => write!(f, "bookmark store parse error: {}", e),
        }
    }
}

impl std::error::Error for BookmarkError {}

impl From<io::Error> for BookmarkError {
    fn from(e: io::Error) -> Self {
        BookmarkError::Io(e)
    }
}

impl From<serde_json::Error> for BookmarkError {
    fn from(e: serde_json::Error) -> Self {
        BookmarkError::Parse(e)
    }
}

/// Persisted high-water mark for one monitored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub last_observed_at: String,
    #[serde(default)]
    pub last_known_line_count: u64,
}

/// File-backed bookmark store.
///
/// Every read-modify-write of the store happens under one mutex, so
/// concurrent callers never interleave updates.
pub struct BookmarkStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl BookmarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads all bookmarks. A missing or blank store is empty; entries with
    /// an empty file path are pruned.
    pub fn load(&self) -> Result<Vec<Bookmark>, BookmarkError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut bookmarks: Vec<Bookmark> = serde_json::from_str(&content)?;
        let before = bookmarks.len();
        bookmarks.retain(|b| !b.file_path.is_empty());
        if bookmarks.len() != before {
            debug!(
                "Pruned {} bookmark entries without a file path",
                before - bookmarks.len()
            );
        }
        Ok(bookmarks)
    }

    /// Rewrites the whole store.
    pub fn save(&self, bookmarks: &[Bookmark]) -> Result<(), BookmarkError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(bookmarks)?;

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Looks up the bookmark for `file_path`.
    pub fn get(&self, file_path: &str) -> Result<Option<Bookmark>, BookmarkError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self
            .load()?
            .into_iter()
            .find(|b| b.file_path == file_path))
    }

    /// Moves the bookmark of `file_path` to `line_count` and returns the
    /// previous line count.
    ///
    /// A file seen for the first time is seeded at
    /// `line_count - SEED_BACKLOG_LINES` (floored at zero), which is also the
    /// value returned. An unparseable store is set aside and started afresh.
    pub fn advance(
        &self,
        file_path: &str,
        line_count: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, BookmarkError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut bookmarks = match self.load() {
            Ok(b) => b,
            Err(BookmarkError::Parse(e)) => {
                warn!(
                    "Bookmark store {} is corrupt ({}), starting a new one",
                    self.path.display(),
                    e
                );
                let mut backup = self.path.as_os_str().to_owned();
                backup.push(".corrupt");
                if let Err(e) = fs::rename(&self.path, &backup) {
                    warn!("Failed to set aside corrupt bookmark store: {}", e);
                }
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let idx = match bookmarks.iter().position(|b| b.file_path == file_path) {
            Some(idx) => idx,
            None => {
                bookmarks.push(Bookmark {
                    file_path: file_path.to_string(),
                    last_observed_at: String::new(),
                    last_known_line_count: line_count.saturating_sub(SEED_BACKLOG_LINES),
                });
                bookmarks.len() - 1
            }
        };

        let entry = &mut bookmarks[idx];
        let previous = entry.last_known_line_count;
        entry.last_known_line_count = line_count;
        entry.last_observed_at = format_timestamp(now);

        self.save(&bookmarks)?;
        Ok(previous)
    }
}
