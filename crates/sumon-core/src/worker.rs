//! Stoppable background threads.
//!
//! Every producer (CPU sampler, input listener, directory watcher, retention
//! task) runs on its own named thread that polls a shared [`StopFlag`].
//! Stopping is best effort: [`Worker::stop`] waits a bounded time and then
//! abandons the thread.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop. Returns `true` if this call was the first request.
    pub fn stop(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` in short slices.
    ///
    /// Returns `false` if a stop was requested before the full duration
    /// elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if self.is_stopped() {
                return false;
            }
            let sleep_time = remaining.min(SLEEP_SLICE);
            thread::sleep(sleep_time);
            remaining = remaining.saturating_sub(sleep_time);
        }
        !self.is_stopped()
    }
}

/// How a [`Worker::stop`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The thread finished within the timeout.
    Joined,
    /// The thread was still running after the timeout and was detached.
    Abandoned,
    /// The worker was already stopped.
    AlreadyStopped,
}

/// A named background thread with a stop flag.
pub struct Worker {
    name: String,
    stop: StopFlag,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns `body` on a new thread named `name`.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> io::Result<Self>
    where
        F: FnOnce(StopFlag) + Send + 'static,
    {
        let name = name.into();
        let stop = StopFlag::new();
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(flag))?;
        debug!("Worker '{}' started", name);

        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Requests a stop and waits up to `timeout` for the thread to exit.
    pub fn stop(&mut self, timeout: Duration) -> StopOutcome {
        self.stop.stop();
        let Some(handle) = self.handle.take() else {
            return StopOutcome::AlreadyStopped;
        };

        // A timeout too large to represent waits without a deadline.
        let deadline = Instant::now().checked_add(timeout);
        while !handle.is_finished() && deadline.is_none_or(|d| Instant::now() < d) {
            thread::sleep(Duration::from_millis(10));
        }

        if handle.is_finished() {
            if handle.join().is_err() {
                warn!("Worker '{}' panicked", self.name);
            }
            debug!("Worker '{}' stopped", self.name);
            StopOutcome::Joined
        } else {
            warn!(
                "Worker '{}' did not stop within {:?}, abandoning it",
                self.name, timeout
            );
            StopOutcome::Abandoned
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Never block in drop; just make sure the thread is told to exit.
        self.stop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_stop_flag_first_request_wins() {
        let flag = StopFlag::new();
        assert!(flag.stop());
        assert!(!flag.stop());
        assert!(flag.is_stopped());
        assert!(!flag.sleep(Duration::from_secs(5)));
    }

    #[test]
    fn test_worker_stops_and_joins() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let mut worker = Worker::spawn("test-ticker", move |stop| {
            while stop.sleep(Duration::from_millis(10)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(worker.is_running());
        assert_eq!(worker.stop(Duration::from_secs(2)), StopOutcome::Joined);
        assert_eq!(worker.stop(Duration::from_secs(2)), StopOutcome::AlreadyStopped);
        assert!(!worker.is_running());
    }

    #[test]
    fn test_worker_abandoned_after_timeout() {
        let mut worker = Worker::spawn("test-stubborn", |_stop| {
            thread::sleep(Duration::from_millis(500));
        })
        .unwrap();

        let outcome = worker.stop(Duration::from_millis(20));
        assert_eq!(outcome, StopOutcome::Abandoned);
    }

    #[test]
    fn test_unbounded_timeout_waits_for_exit() {
        let mut worker = Worker::spawn("test-unbounded", |stop| {
            while stop.sleep(Duration::from_millis(10)) {}
        })
        .unwrap();

        assert_eq!(worker.stop(Duration::MAX), StopOutcome::Joined);
        assert_eq!(worker.stop(Duration::MAX), StopOutcome::AlreadyStopped);
    }
}
