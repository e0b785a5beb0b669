//! The interval loop.
//!
//! Each tick: pick the output file for the current logical day, clear the
//! aggregator, sleep for one interval, then build and append one
//! [`Snapshot`]. The scheduler also owns every background producer and stops
//! them on shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityEngine, FileActivity};
use crate::aggregator::{CpuHistogram, EventAggregator, FileChangeSet};
use crate::collector::host::{HostInfo, uptime_ms};
use crate::collector::process::ProcessTable;
use crate::collector::traits::FileSystem;
use crate::config::AgentSettings;
use crate::input::InputSource;
use crate::storage::{Snapshot, SnapshotWriter, StorageError};
use crate::worker::{StopFlag, StopOutcome, Worker};

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that fail a single interval.
#[derive(Debug)]
pub enum SchedulerError {
    Storage(StorageError),
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<StorageError> for SchedulerError {
    fn from(e: StorageError) -> Self {
        SchedulerError::Storage(e)
    }
}

/// The `FileChanges` entry of a snapshot.
///
/// A file flagged by the activity engine wins with its new-line count;
/// otherwise the first raw change of the interval is reported once. Only one
/// entry is ever emitted.
pub fn resolve_file_changes(
    activity: Option<&FileActivity>,
    raw: &FileChangeSet,
) -> BTreeMap<String, u64> {
    let mut changes = BTreeMap::new();
    if let Some(activity) = activity {
        changes.insert(activity.path.to_string_lossy().into_owned(), activity.changes);
    } else if let Some(first) = raw.first() {
        changes.insert(first.to_string(), 1);
    }
    changes
}

pub struct Scheduler<F: FileSystem> {
    settings: AgentSettings,
    aggregator: Arc<EventAggregator>,
    writer: SnapshotWriter,
    activity: Option<ActivityEngine>,
    processes: ProcessTable<F>,
    fs: F,
    proc_path: String,
    host: HostInfo,
    stop: StopFlag,
    workers: Vec<Worker>,
    input: Option<Box<dyn InputSource>>,
    stop_timeout: Duration,
    shut_down: bool,
}

impl<F: FileSystem + Clone> Scheduler<F> {
    pub fn new(
        settings: AgentSettings,
        aggregator: Arc<EventAggregator>,
        writer: SnapshotWriter,
        fs: F,
        proc_path: impl Into<String>,
    ) -> Self {
        let proc_path = proc_path.into();
        let host = HostInfo::collect(&fs);
        Self {
            settings,
            aggregator,
            writer,
            activity: None,
            processes: ProcessTable::new(fs.clone(), proc_path.clone()),
            fs,
            proc_path,
            host,
            stop: StopFlag::new(),
            workers: Vec::new(),
            input: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            shut_down: false,
        }
    }
}

impl<F: FileSystem> Scheduler<F> {
    /// Enables log-based activity detection.
    pub fn with_activity(mut self, engine: ActivityEngine) -> Self {
        self.activity = Some(engine);
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Handle that ends [`Scheduler::run`] when stopped.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn aggregator(&self) -> &Arc<EventAggregator> {
        &self.aggregator
    }

    /// Hands a running producer over; it is stopped on shutdown.
    pub fn add_worker(&mut self, worker: Worker) {
        self.workers.push(worker);
    }

    pub fn set_input(&mut self, input: Box<dyn InputSource>) {
        self.input = Some(input);
    }

    /// Starts a new interval at `local_now`.
    pub fn begin_interval(&mut self, local_now: NaiveDateTime) {
        self.writer.roll(local_now);
        self.aggregator.reset();
    }

    /// Builds the snapshot for `[start, end]`, appends it and returns it.
    pub fn complete_interval(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Snapshot, SchedulerError> {
        let local_end = end.with_timezone(&Local);
        let data = self.aggregator.snapshot_and_reset();

        let cpu_usage = if data.cpu.is_empty() && self.settings.fill_empty_cpu_histogram {
            let expected = self.settings.expected_cpu_samples();
            debug!("No CPU samples this interval, filling bucket 0 with {}", expected);
            CpuHistogram::filled(expected)
        } else {
            data.cpu
        };

        let top_processes = match self.processes.top_processes(self.settings.top_process_count) {
            Ok(top) => top,
            Err(e) => {
                warn!("Failed to enumerate processes: {}", e);
                Vec::new()
            }
        };

        let activity = match &self.activity {
            Some(engine) => engine.detect(local_end),
            None => None,
        };
        let file_changes = resolve_file_changes(activity.as_ref(), &data.file_changes);

        let tick_count = uptime_ms(&self.fs, &self.proc_path).unwrap_or_else(|e| {
            debug!("Failed to read uptime: {}", e);
            0
        });

        let snapshot = Snapshot {
            start_time: start,
            end_time: end,
            duration: (end - start).to_std().unwrap_or_default(),
            expected_duration: self.settings.interval(),
            machine_name: self.host.machine_name.clone(),
            processor_count: self.host.processor_count,
            tick_count,
            user_domain_name: self.host.user_domain_name.clone(),
            user_name: self.host.user_name.clone(),
            mouse_events: data.input.mouse,
            keyboard_events: data.input.keyboard,
            cpu_usage,
            top_processes,
            file_changes,
        };

        self.writer.append(&snapshot, local_end.naive_local())?;
        log_summary(&snapshot);
        Ok(snapshot)
    }

    /// Runs intervals until the stop flag is set. A failed interval is
    /// logged and the loop continues.
    pub fn run(&mut self) {
        info!(
            "Scheduler started, interval {:?}",
            self.settings.interval()
        );
        while !self.stop.is_stopped() {
            let start = Utc::now();
            let started = Instant::now();
            self.begin_interval(start.with_timezone(&Local).naive_local());

            if !self.stop.sleep(self.settings.interval()) {
                debug!("Stop requested, abandoning the current interval");
                break;
            }

            let end = start
                + chrono::Duration::from_std(started.elapsed()).unwrap_or_else(|_| {
                    chrono::Duration::zero()
                });
            if let Err(e) = self.complete_interval(start, end) {
                error!("Failed to record interval starting {}: {}", start, e);
            }
        }
        info!("Scheduler stopped");
    }

    /// Stops the loop and every producer. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.stop.stop();
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Some(mut input) = self.input.take()
            && input.stop() == StopOutcome::Abandoned
        {
            warn!("Input listener did not stop in time");
        }
        for mut worker in self.workers.drain(..) {
            if worker.stop(self.stop_timeout) == StopOutcome::Abandoned {
                warn!("Producer '{}' abandoned", worker.name());
            }
        }
        info!("All producers stopped");
    }
}

impl<F: FileSystem> Drop for Scheduler<F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn log_summary(snapshot: &Snapshot) {
    let top = snapshot
        .top_processes
        .first()
        .map(|(name, _)| name.as_str())
        .unwrap_or("-");
    info!(
        "Interval ended {}: avg CPU {:.1}%, top process {}, mouse {}, keyboard {}, file changes {}",
        snapshot.end_time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
        snapshot.cpu_usage.weighted_average(),
        top,
        snapshot.mouse_events,
        snapshot.keyboard_events,
        snapshot.file_changes.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::bookmark::BookmarkStore;
    use crate::collector::mock::MockFs;
    use crate::config::{MonitorRule, MonitorSpec};
    use crate::input::InputEvent;
    use crate::storage::LogicalDay;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn proc_fs() -> MockFs {
        let mut fs = MockFs::new();
        fs.add_file("/proc/sys/kernel/hostname", "tester-42\n");
        fs.add_file("/proc/uptime", "1000.50 10.00\n");
        fs.add_process(10, "sequencer", 5000, 100);
        fs.add_process(11, "bash", 10, 0);
        fs
    }

    fn scheduler(dir: &Path, settings: AgentSettings) -> Scheduler<MockFs> {
        let aggregator = Arc::new(EventAggregator::new(Duration::from_millis(100)));
        let writer = SnapshotWriter::new(dir.join("out"), LogicalDay::new(6));
        Scheduler::new(settings, aggregator, writer, proc_fs(), "/proc")
    }

    fn interval_bounds() -> (DateTime<Utc>, DateTime<Utc>) {
        let end = Utc::now();
        (end - chrono::Duration::seconds(300), end)
    }

    fn written_lines(s: &Scheduler<MockFs>) -> Vec<serde_json::Value> {
        let path = s.writer.current_path().unwrap();
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_full_interval_of_cpu_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path(), AgentSettings::default());
        s.begin_interval(Local::now().naive_local());

        for _ in 0..300 {
            s.aggregator().record_cpu_sample(12.0);
        }
        s.aggregator().record_input_event(InputEvent::KeyPress);
        s.aggregator().record_input_event(InputEvent::MouseWheel);

        let (start, end) = interval_bounds();
        let snapshot = s.complete_interval(start, end).unwrap();

        assert_eq!(snapshot.cpu_usage.get(10), 300);
        assert_eq!(snapshot.cpu_usage.total_samples(), 300);
        assert_eq!(snapshot.keyboard_events, 1);
        assert_eq!(snapshot.mouse_events, 1);
        assert_eq!(snapshot.machine_name, "tester-42");
        assert_eq!(snapshot.tick_count, 1_000_500);
        assert_eq!(snapshot.duration, Duration::from_secs(300));
        assert_eq!(snapshot.top_processes[0].0, "sequencer");
        assert!(snapshot.file_changes.is_empty());

        let lines = written_lines(&s);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["CpuUsage"], serde_json::json!({"10": 300}));
        assert_eq!(lines[0]["Duration"], "00:05:00.0000000");
    }

    #[test]
    fn test_empty_histogram_fill_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let (start, end) = interval_bounds();

        let mut filled = scheduler(dir.path(), AgentSettings::default());
        let snapshot = filled.complete_interval(start, end).unwrap();
        assert_eq!(snapshot.cpu_usage, CpuHistogram::filled(300));

        let settings = AgentSettings {
            fill_empty_cpu_histogram: false,
            ..AgentSettings::default()
        };
        let mut honest = scheduler(dir.path(), settings);
        let snapshot = honest.complete_interval(start, end).unwrap();
        assert!(snapshot.cpu_usage.is_empty());
    }

    #[test]
    fn test_raw_change_reports_first_path_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path(), AgentSettings::default());
        s.aggregator().record_file_change(Path::new("/a"));
        s.aggregator().record_file_change(Path::new("/b"));
        s.aggregator().record_file_change(Path::new("/a"));

        let (start, end) = interval_bounds();
        let snapshot = s.complete_interval(start, end).unwrap();
        let expected: BTreeMap<String, u64> = [("/a".to_string(), 1)].into();
        assert_eq!(snapshot.file_changes, expected);
    }

    #[test]
    fn test_activity_result_overrides_raw_changes() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("TraceLog.txt");
        std::fs::write(&log, "one\ntwo\nthree\n").unwrap();

        let rule = MonitorRule::from_spec(&MonitorSpec {
            file_path: log.to_string_lossy().into_owned(),
            ..MonitorSpec::default()
        });
        let engine = ActivityEngine::new(
            vec![rule],
            BookmarkStore::new(dir.path().join("bookmarks.json")),
        );
        let mut s = scheduler(dir.path(), AgentSettings::default()).with_activity(engine);
        s.aggregator().record_file_change(Path::new("/elsewhere/other.txt"));

        let (start, end) = interval_bounds();
        let snapshot = s.complete_interval(start, end).unwrap();
        let expected: BTreeMap<String, u64> = [(log.to_string_lossy().into_owned(), 3)].into();
        assert_eq!(snapshot.file_changes, expected);

        // Unchanged file, no last-line markers: falls back to raw changes.
        s.aggregator().record_file_change(Path::new("/elsewhere/other.txt"));
        let snapshot = s.complete_interval(start, end).unwrap();
        let expected: BTreeMap<String, u64> = [("/elsewhere/other.txt".to_string(), 1)].into();
        assert_eq!(snapshot.file_changes, expected);
    }

    #[test]
    fn test_write_failure_is_an_interval_error() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the output directory should be.
        let blocked = dir.path().join("out");
        std::fs::write(&blocked, "").unwrap();
        let mut s = scheduler(dir.path(), AgentSettings::default());
        let (start, end) = interval_bounds();
        assert!(matches!(
            s.complete_interval(start, end),
            Err(SchedulerError::Storage(_))
        ));
    }

    #[test]
    fn test_missing_proc_yields_empty_top_list() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = Arc::new(EventAggregator::new(Duration::from_millis(100)));
        let writer = SnapshotWriter::new(dir.path(), LogicalDay::new(6));
        let mut s = Scheduler::new(
            AgentSettings::default(),
            aggregator,
            writer,
            MockFs::new(),
            "/proc",
        );
        let (start, end) = interval_bounds();
        let snapshot = s.complete_interval(start, end).unwrap();
        assert!(snapshot.top_processes.is_empty());
        assert_eq!(snapshot.tick_count, 0);
    }

    struct CountingInput(Arc<AtomicUsize>);

    impl InputSource for CountingInput {
        fn start(
            &mut self,
            _aggregator: Arc<EventAggregator>,
        ) -> Result<(), crate::input::InputError> {
            Ok(())
        }

        fn stop(&mut self) -> StopOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            StopOutcome::Joined
        }
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path(), AgentSettings::default());
        let stops = Arc::new(AtomicUsize::new(0));
        s.set_input(Box::new(CountingInput(Arc::clone(&stops))));
        let worker = Worker::spawn("idle", |stop| while stop.sleep(Duration::from_secs(1)) {}).unwrap();
        s.add_worker(worker);

        let flag = s.stop_flag();
        s.shutdown();
        s.shutdown();
        drop(s);

        assert!(flag.is_stopped());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_emits_one_record_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AgentSettings {
            interval_secs: 1,
            ..AgentSettings::default()
        };
        let mut s = scheduler(dir.path(), settings);
        let flag = s.stop_flag();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(1500));
            flag.stop();
        });

        s.run();
        stopper.join().unwrap();

        let out: Vec<PathBuf> = std::fs::read_dir(dir.path().join("out"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(out.len(), 1);
        let lines = written_lines(&s);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["ExpectedDuration"], "00:00:01.0000000");
        assert_eq!(lines[0]["CpuUsage"], serde_json::json!({"0": 1}));
    }
}
