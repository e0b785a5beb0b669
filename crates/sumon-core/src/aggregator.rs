//! Interval-scoped shared state fed by the background producers.
//!
//! [`EventAggregator`] is the single consumer-facing object: producers call
//! the `record_*` methods from any thread, the scheduler calls
//! [`EventAggregator::snapshot_and_reset`] once per interval.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::input::{InputCounters, InputCounts, InputEvent};

/// Maps a CPU percentage to its 5-wide bucket: `5 * round(p / 5)`, clamped to
/// `0..=100`. Halves round away from zero.
pub fn bucket_for(percent: f32) -> u32 {
    if !percent.is_finite() {
        return 0;
    }
    let p = percent.clamp(0.0, 100.0);
    ((p / 5.0).round() as u32) * 5
}

/// Sample counts per CPU bucket. Serializes as a JSON object keyed by the
/// bucket, in numeric order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CpuHistogram {
    buckets: BTreeMap<u32, u32>,
}

impl CpuHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Histogram holding `count` samples in the `0` bucket.
    pub fn filled(count: u32) -> Self {
        let mut buckets = BTreeMap::new();
        buckets.insert(0, count);
        Self { buckets }
    }

    pub fn record(&mut self, percent: f32) {
        *self.buckets.entry(bucket_for(percent)).or_insert(0) += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn get(&self, bucket: u32) -> u32 {
        self.buckets.get(&bucket).copied().unwrap_or(0)
    }

    pub fn total_samples(&self) -> u64 {
        self.buckets.values().map(|&c| u64::from(c)).sum()
    }

    /// Sample-weighted mean of the bucket values.
    pub fn weighted_average(&self) -> f64 {
        let total = self.total_samples();
        if total == 0 {
            return 0.0;
        }
        let sum: u64 = self
            .buckets
            .iter()
            .map(|(&b, &c)| u64::from(b) * u64::from(c))
            .sum();
        sum as f64 / total as f64
    }
}

/// Per-path change counts with the first path of the interval latched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileChangeSet {
    first: Option<String>,
    counts: BTreeMap<String, u64>,
}

impl FileChangeSet {
    pub fn record(&mut self, path: &str) {
        if self.first.is_none() {
            self.first = Some(path.to_string());
        }
        *self.counts.entry(path.to_string()).or_insert(0) += 1;
    }

    /// The first path changed in this interval.
    pub fn first(&self) -> Option<&str> {
        self.first.as_deref()
    }

    pub fn count(&self, path: &str) -> u64 {
        self.counts.get(path).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &BTreeMap<String, u64> {
        &self.counts
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Everything collected during one interval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntervalData {
    pub cpu: CpuHistogram,
    pub input: InputCounts,
    pub file_changes: FileChangeSet,
}

impl IntervalData {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty() && self.input == InputCounts::default() && self.file_changes.is_empty()
    }
}

#[derive(Default)]
struct State {
    cpu: CpuHistogram,
    file_changes: FileChangeSet,
}

/// Shared interval state.
///
/// CPU samples and file changes live behind one mutex; input counts are
/// atomics, drained inside the same critical section as the rest so an
/// interval boundary is a single cut.
pub struct EventAggregator {
    state: Mutex<State>,
    input: InputCounters,
}

impl EventAggregator {
    pub fn new(mouse_move_throttle: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            input: InputCounters::new(mouse_move_throttle),
        }
    }

    pub fn record_cpu_sample(&self, percent: f32) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.cpu.record(percent);
    }

    /// Counts an input event; returns false if it was throttled.
    pub fn record_input_event(&self, event: InputEvent) -> bool {
        self.input.record(event)
    }

    pub fn record_file_change(&self, path: &Path) {
        let path = path.to_string_lossy();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.file_changes.record(&path);
    }

    /// Returns the accumulated state and clears it.
    pub fn snapshot_and_reset(&self) -> IntervalData {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let input = self.input.take();
        let State { cpu, file_changes } = std::mem::take(&mut *state);
        IntervalData {
            cpu,
            input,
            file_changes,
        }
    }

    /// Clears the accumulated state.
    pub fn reset(&self) {
        let _ = self.snapshot_and_reset();
    }
}
