//! Incremental activity detection over application log files.
//!
//! For each [`MonitorRule`] the engine reads the current file, compares its
//! line count with the persisted bookmark and inspects only the lines
//! appended since then:
//!
//! - no growth: the current last line is matched against the rule's
//!   last-line markers;
//! - growth on an unrestricted rule (no no-content markers, no skip rules):
//!   activity;
//! - otherwise: new lines not hidden by skip rules are candidates, and a
//!   candidate missing any no-content marker is activity.
//!
//! The bookmark always advances to the current line count, whatever the
//! verdict.

pub mod bookmark;
pub mod skip;

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use tracing::{debug, info, warn};

use crate::config::MonitorRule;
use bookmark::{BookmarkError, BookmarkStore, SEED_BACKLOG_LINES};
use skip::Candidates;

/// Errors while analyzing one monitored file.
#[derive(Debug)]
pub enum ActivityError {
    Io(io::Error),
    Bookmark(BookmarkError),
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityError::Io(e) => write!(f, "I/O error: {}", e),
            ActivityError::Bookmark(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ActivityError {}

impl From<io::Error> for ActivityError {
    fn from(e: io::Error) -> Self {
        ActivityError::Io(e)
    }
}

impl From<BookmarkError> for ActivityError {
    fn from(e: BookmarkError) -> Self {
        ActivityError::Bookmark(e)
    }
}

/// Outcome of analyzing one monitored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileActivity {
    /// Resolved path of the file.
    pub path: PathBuf,
    /// Whether the new content shows operator activity.
    pub used: bool,
    /// Number of lines appended since the bookmark.
    pub changes: u64,
    pub line_count: u64,
    pub previous_line_count: u64,
}

/// Stateful activity detector; the bookmark store carries its state across
/// restarts.
pub struct ActivityEngine {
    rules: Vec<MonitorRule>,
    store: BookmarkStore,
}

impl ActivityEngine {
    pub fn new(rules: Vec<MonitorRule>, store: BookmarkStore) -> Self {
        Self { rules, store }
    }

    pub fn store(&self) -> &BookmarkStore {
        &self.store
    }

    /// Analyzes one rule. Returns `Ok(None)` when the resolved file does not
    /// exist; nothing is recorded in that case.
    pub fn analyze(
        &self,
        rule: &MonitorRule,
        now: DateTime<Local>,
    ) -> Result<Option<FileActivity>, ActivityError> {
        let path = rule.resolve_path(now.naive_local());
        if !path.exists() {
            return Ok(None);
        }

        // Bookmarks are keyed by the configured path, so a dated rule keeps
        // one entry across days.
        let key = rule.file_path.as_str();
        // A corrupt store is set aside by `advance`; treat it as no bookmark.
        let known = match self.store.get(key) {
            Ok(bookmark) => bookmark.map(|b| b.last_known_line_count),
            Err(BookmarkError::Parse(_)) => None,
            Err(e) => return Err(e.into()),
        };

        // No store lock is held while the log is read.
        let window = LineWindow::read(&path, known)?;
        let previous = self
            .store
            .advance(key, window.line_count, now.with_timezone(&Utc))?;

        Ok(Some(FileActivity {
            used: is_activity(rule, &window, previous),
            changes: window.line_count.saturating_sub(previous),
            line_count: window.line_count,
            previous_line_count: previous,
            path,
        }))
    }

    /// Evaluates the rules in order and returns the first file showing
    /// activity. Later rules are not evaluated once one reports activity.
    ///
    /// Errors are contained per file: a failing file counts as "not used".
    pub fn detect(&self, now: DateTime<Local>) -> Option<FileActivity> {
        for rule in &self.rules {
            match self.analyze(rule, now) {
                Ok(Some(activity)) if activity.used => {
                    info!(
                        "{} had {} new lines indicating operator activity",
                        activity.path.display(),
                        activity.changes
                    );
                    return Some(activity);
                }
                Ok(Some(activity)) => {
                    debug!(
                        "{} did not indicate operator activity ({} new lines)",
                        activity.path.display(),
                        activity.changes
                    );
                }
                Ok(None) => {
                    debug!(
                        "{} does not exist, no operator activity",
                        rule.resolve_path(now.naive_local()).display()
                    );
                }
                Err(e) => {
                    warn!("Activity check failed for '{}': {}", rule.file_path, e);
                }
            }
        }
        None
    }
}

/// The part of a log file the engine looks at: its line count, its last
/// line and the lines from `offset` to the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineWindow {
    pub line_count: u64,
    /// Index of the first retained line.
    pub offset: u64,
    pub tail: Vec<String>,
    pub last: Option<String>,
}

impl LineWindow {
    /// Streams `path` and keeps the lines from index `from` onwards. Without
    /// a bookmark only the last [`SEED_BACKLOG_LINES`] lines are kept, which
    /// is where a fresh bookmark is seeded. Invalid UTF-8 is replaced.
    pub fn read(path: &Path, from: Option<u64>) -> io::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut tail = VecDeque::new();
        let mut buf = Vec::new();
        let mut last = Vec::new();
        let mut line_count = 0u64;

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            if buf.last() == Some(&b'\n') {
                buf.pop();
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
            }

            let keep = match from {
                Some(start) => line_count >= start,
                None => true,
            };
            if keep {
                tail.push_back(String::from_utf8_lossy(&buf).into_owned());
                if from.is_none() && tail.len() as u64 > SEED_BACKLOG_LINES {
                    tail.pop_front();
                }
            }
            line_count += 1;
            std::mem::swap(&mut buf, &mut last);
        }

        Ok(Self {
            line_count,
            offset: line_count - tail.len() as u64,
            tail: tail.into(),
            last: (line_count > 0).then(|| String::from_utf8_lossy(&last).into_owned()),
        })
    }

    /// Lines from index `start` to the end, clamped to what was retained.
    pub fn lines_from(&self, start: u64) -> &[String] {
        let skip = start.saturating_sub(self.offset).min(self.tail.len() as u64);
        &self.tail[skip as usize..]
    }
}

/// Decides whether the file behind `window` shows activity given the
/// previously bookmarked line count.
pub fn is_activity(rule: &MonitorRule, window: &LineWindow, previous: u64) -> bool {
    let line_count = window.line_count;

    if line_count == previous {
        return last_line_matches(rule, window.last.as_deref());
    }
    if rule.is_unrestricted() {
        return true;
    }
    if rule.no_content_markers.is_empty() {
        return false;
    }

    let lines = window.lines_from(previous.min(line_count));
    Candidates::new(lines, &rule.skip_rules).any(|(_, line)| {
        rule.no_content_markers
            .iter()
            .any(|marker| !line.contains(marker.as_str()))
    })
}

fn last_line_matches(rule: &MonitorRule, last: Option<&str>) -> bool {
    match last {
        Some(last) if !last.is_empty() => rule
            .last_line_markers
            .iter()
            .any(|marker| last.contains(marker.as_str())),
        _ => false,
    }
}
