//! Machine-wide CPU utilization from `/proc/stat`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::aggregator::EventAggregator;
use crate::collector::procfs::{CollectError, CpuTimes, parse_cpu_times};
use crate::collector::traits::FileSystem;
use crate::worker::Worker;

/// Pause after a failed read before trying again.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Computes busy percentages from successive `/proc/stat` readings.
///
/// The first reading only establishes the baseline.
pub struct CpuSampler<F: FileSystem> {
    fs: F,
    proc_path: String,
    previous: Option<CpuTimes>,
}

impl<F: FileSystem> CpuSampler<F> {
    pub fn new(fs: F, proc_path: impl Into<String>) -> Self {
        Self {
            fs,
            proc_path: proc_path.into(),
            previous: None,
        }
    }

    /// Reads `/proc/stat` and returns the busy percentage since the previous
    /// reading, if there is one.
    pub fn sample(&mut self) -> Result<Option<f32>, CollectError> {
        let path = format!("{}/stat", self.proc_path);
        let content = self.fs.read_to_string(Path::new(&path))?;
        let times = parse_cpu_times(&content)?;
        Ok(self.observe(times))
    }

    /// Feeds one reading and returns the busy percentage over the elapsed
    /// span. A reading that did not advance yields `None`.
    pub fn observe(&mut self, times: CpuTimes) -> Option<f32> {
        let previous = self.previous.replace(times)?;
        let total = times.total.checked_sub(previous.total)?;
        if total == 0 {
            return None;
        }
        let idle = times.idle.saturating_sub(previous.idle).min(total);
        Some(((total - idle) as f64 / total as f64 * 100.0) as f32)
    }
}

/// Runs a sampler on a worker thread, feeding the aggregator every `interval`.
pub fn spawn_cpu_sampler<F>(
    mut sampler: CpuSampler<F>,
    aggregator: Arc<EventAggregator>,
    interval: Duration,
) -> std::io::Result<Worker>
where
    F: FileSystem + 'static,
{
    Worker::spawn("cpu-sampler", move |stop| {
        loop {
            let pause = match sampler.sample() {
                Ok(Some(percent)) => {
                    aggregator.record_cpu_sample(percent);
                    interval
                }
                Ok(None) => interval,
                Err(e) => {
                    warn!("CPU sample failed: {}", e);
                    ERROR_BACKOFF
                }
            };
            if !stop.sleep(pause) {
                break;
            }
        }
        debug!("CPU sampler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    fn times(total: u64, idle: u64) -> CpuTimes {
        CpuTimes { total, idle }
    }

    #[test]
    fn test_first_reading_is_baseline() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/stat", "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4\n");
        let mut sampler = CpuSampler::new(fs, "/proc");
        assert_eq!(sampler.sample().unwrap(), None);
    }

    #[test]
    fn test_observe_computes_busy_share() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/stat", "");
        let mut sampler = CpuSampler::new(fs, "/proc");

        assert_eq!(sampler.observe(times(1000, 800)), None);
        let busy = sampler.observe(times(1100, 850)).unwrap();
        assert!((busy - 50.0).abs() < 0.01);
        let busy = sampler.observe(times(1200, 950)).unwrap();
        assert!(busy.abs() < 0.01);
        // Counter did not move.
        assert_eq!(sampler.observe(times(1200, 950)), None);
    }

    #[test]
    fn test_unreadable_stat_is_an_error() {
        let mut sampler = CpuSampler::new(MockFs::new(), "/proc");
        assert!(matches!(sampler.sample(), Err(CollectError::Io(_))));
    }

    #[test]
    fn test_worker_feeds_aggregator() {
        let fs = crate::collector::traits::RealFs::new();
        let dir = tempfile::tempdir().unwrap();
        let stat = dir.path().join("stat");
        std::fs::write(&stat, "cpu  10 0 10 80 0 0 0 0\n").unwrap();

        let agg = Arc::new(EventAggregator::new(Duration::from_millis(100)));
        let sampler = CpuSampler::new(fs, dir.path().to_string_lossy().into_owned());
        let mut worker =
            spawn_cpu_sampler(sampler, Arc::clone(&agg), Duration::from_millis(20)).unwrap();

        std::thread::sleep(Duration::from_millis(60));
        // Replace atomically so the sampler never sees a partial file.
        let staged = dir.path().join("stat.new");
        std::fs::write(&staged, "cpu  30 0 30 140 0 0 0 0\n").unwrap();
        std::fs::rename(&staged, &stat).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut samples = 0;
        let mut hist = crate::aggregator::CpuHistogram::new();
        while samples == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
            hist = agg.snapshot_and_reset().cpu;
            samples = hist.total_samples();
        }
        worker.stop(Duration::from_secs(2));

        // Δtotal 100, Δidle 60 => 40% busy on the first non-baseline sample.
        assert!(hist.get(40) >= 1);
    }
}
