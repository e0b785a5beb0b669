//! Keyboard and mouse listener over Linux evdev devices.
//!
//! Every readable `/dev/input/event*` node is opened non-blocking and polled
//! from one worker thread. Reading the devices usually requires membership
//! in the `input` group.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{InputError, InputSource, decode_event};
use crate::aggregator::EventAggregator;
use crate::config::InputSettings;
use crate::worker::{StopFlag, StopOutcome, Worker};

/// Size of `struct input_event`: a `timeval` followed by type, code, value.
pub const EVENT_SIZE: usize = 2 * std::mem::size_of::<std::ffi::c_long>() + 8;

const IDLE_SLEEP: Duration = Duration::from_millis(20);
const DEFAULT_DEVICE_DIR: &str = "/dev/input";

/// Extracts `(type, code, value)` from one raw `struct input_event`.
pub fn parse_event(raw: &[u8]) -> Option<(u16, u16, i32)> {
    if raw.len() < EVENT_SIZE {
        return None;
    }
    let tail = &raw[EVENT_SIZE - 8..EVENT_SIZE];
    let ev_type = u16::from_ne_bytes([tail[0], tail[1]]);
    let code = u16::from_ne_bytes([tail[2], tail[3]]);
    let value = i32::from_ne_bytes([tail[4], tail[5], tail[6], tail[7]]);
    Some((ev_type, code, value))
}

/// Input source reading evdev device nodes.
pub struct EvdevListener {
    settings: InputSettings,
    device_dir: PathBuf,
    worker: Option<Worker>,
}

impl EvdevListener {
    pub fn new(settings: InputSettings) -> Self {
        Self::with_device_dir(settings, DEFAULT_DEVICE_DIR)
    }

    pub fn with_device_dir(settings: InputSettings, device_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            device_dir: device_dir.into(),
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(Worker::is_running)
    }
}

impl InputSource for EvdevListener {
    fn start(&mut self, aggregator: Arc<EventAggregator>) -> Result<(), InputError> {
        if self.is_running() {
            return Ok(());
        }
        let devices = open_devices(&self.device_dir)?;
        if devices.is_empty() {
            return Err(InputError::NoDevices);
        }
        info!(
            "Listening for input on {} device(s) under {}",
            devices.len(),
            self.device_dir.display()
        );

        let settings = self.settings.clone();
        let worker = Worker::spawn("input-listener", move |stop| {
            pump(devices, &settings, &aggregator, &stop)
        })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) -> StopOutcome {
        match self.worker.take() {
            Some(mut worker) => worker.stop(self.settings.stop_timeout()),
            None => StopOutcome::AlreadyStopped,
        }
    }
}

#[cfg(target_os = "linux")]
fn open_devices(dir: &Path) -> Result<Vec<(PathBuf, File)>, InputError> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;

    let mut devices = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_event_node = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("event"));
        if !is_event_node {
            continue;
        }
        match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
        {
            Ok(file) => devices.push((path, file)),
            Err(e) => debug!("Skipping input device {}: {}", path.display(), e),
        }
    }
    devices.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(devices)
}

#[cfg(not(target_os = "linux"))]
fn open_devices(_dir: &Path) -> Result<Vec<(PathBuf, File)>, InputError> {
    Err(InputError::Unsupported)
}

/// Drains every device until stopped. Devices that fail are dropped.
fn pump(
    mut devices: Vec<(PathBuf, File)>,
    settings: &InputSettings,
    aggregator: &EventAggregator,
    stop: &StopFlag,
) {
    let mut buf = vec![0u8; EVENT_SIZE * 64];

    while !stop.is_stopped() {
        let mut idle = true;

        devices.retain_mut(|(path, file)| loop {
            match file.read(&mut buf) {
                Ok(0) => return true,
                Ok(n) => {
                    idle = false;
                    for raw in buf[..n].chunks_exact(EVENT_SIZE) {
                        if let Some((ev_type, code, value)) = parse_event(raw)
                            && let Some(event) = decode_event(settings, ev_type, code, value)
                        {
                            aggregator.record_input_event(event);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("Input device {} failed: {}", path.display(), e);
                    return false;
                }
            }
        });

        if devices.is_empty() {
            warn!("No input devices left, input listener exiting");
            return;
        }
        if idle && !stop.sleep(IDLE_SLEEP) {
            break;
        }
    }
    debug!("Input listener stopped");
}
