//! Keyboard and mouse activity counting.
//!
//! Raw device events are decoded into [`InputEvent`]s and counted by
//! [`InputCounters`]: key presses and mouse buttons/wheel always count, pointer
//! motion counts at most once per throttle window. Counters are plain atomics
//! so the listener thread never waits on the scheduler.

pub mod evdev;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::aggregator::EventAggregator;
use crate::config::InputSettings;
use crate::worker::StopOutcome;

pub use evdev::EvdevListener;

/// `EV_KEY` event type.
pub const EV_KEY: u16 = 0x01;
/// `EV_REL` event type.
pub const EV_REL: u16 = 0x02;
/// First code of the button range; key codes below it are keyboard keys.
const BTN_MISC: u16 = 0x100;

/// A decoded input notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    KeyPress,
    MouseButton,
    MouseWheel,
    MouseMove,
}

/// Maps one raw `(type, code, value)` triple to an [`InputEvent`].
///
/// Key releases, button releases, zero wheel deltas and unknown codes yield
/// `None`.
pub fn decode_event(settings: &InputSettings, ev_type: u16, code: u16, value: i32) -> Option<InputEvent> {
    match ev_type {
        EV_KEY if settings.mouse_button_codes.contains(&code) => {
            (value == 1).then_some(InputEvent::MouseButton)
        }
        EV_KEY if code < BTN_MISC && settings.key_press_values.contains(&value) => {
            Some(InputEvent::KeyPress)
        }
        EV_REL if settings.mouse_wheel_codes.contains(&code) => {
            (value != 0).then_some(InputEvent::MouseWheel)
        }
        EV_REL if settings.mouse_move_codes.contains(&code) => Some(InputEvent::MouseMove),
        _ => None,
    }
}

/// Keyboard and mouse counts of one interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputCounts {
    pub keyboard: u64,
    pub mouse: u64,
}

const NO_MOVE_YET: u64 = u64::MAX;

/// Lock-free interval counters with mouse-move throttling.
pub struct InputCounters {
    keyboard: AtomicU64,
    mouse: AtomicU64,
    /// Milliseconds since `epoch` of the last counted move.
    last_move_ms: AtomicU64,
    epoch: Instant,
    throttle_ms: u64,
}

impl InputCounters {
    pub fn new(move_throttle: Duration) -> Self {
        Self {
            keyboard: AtomicU64::new(0),
            mouse: AtomicU64::new(0),
            last_move_ms: AtomicU64::new(NO_MOVE_YET),
            epoch: Instant::now(),
            throttle_ms: u64::try_from(move_throttle.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Counts an event observed now. Returns whether it was counted.
    pub fn record(&self, event: InputEvent) -> bool {
        self.record_at(event, Instant::now())
    }

    /// Counts an event observed at `at`.
    pub fn record_at(&self, event: InputEvent, at: Instant) -> bool {
        match event {
            InputEvent::KeyPress => {
                self.keyboard.fetch_add(1, Ordering::Relaxed);
                true
            }
            InputEvent::MouseButton | InputEvent::MouseWheel => {
                self.mouse.fetch_add(1, Ordering::Relaxed);
                true
            }
            InputEvent::MouseMove => {
                let now_ms = u64::try_from(at.saturating_duration_since(self.epoch).as_millis())
                    .unwrap_or(u64::MAX - 1);
                let mut last = self.last_move_ms.load(Ordering::Relaxed);
                loop {
                    if last != NO_MOVE_YET && now_ms.saturating_sub(last) < self.throttle_ms {
                        return false;
                    }
                    match self.last_move_ms.compare_exchange_weak(
                        last,
                        now_ms,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            self.mouse.fetch_add(1, Ordering::Relaxed);
                            return true;
                        }
                        Err(current) => last = current,
                    }
                }
            }
        }
    }

    /// Returns the current counts and resets them to zero.
    pub fn take(&self) -> InputCounts {
        InputCounts {
            keyboard: self.keyboard.swap(0, Ordering::AcqRel),
            mouse: self.mouse.swap(0, Ordering::AcqRel),
        }
    }

    pub fn peek(&self) -> InputCounts {
        InputCounts {
            keyboard: self.keyboard.load(Ordering::Relaxed),
            mouse: self.mouse.load(Ordering::Relaxed),
        }
    }
}

/// Errors starting an input source.
#[derive(Debug)]
pub enum InputError {
    /// No readable input device was found.
    NoDevices,
    /// Input capture is not available on this platform.
    Unsupported,
    Io(io::Error),
}

impl std::fmt::Display for InputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputError::NoDevices => write!(f, "no readable input devices"),
            InputError::Unsupported => write!(f, "input capture is not supported on this platform"),
            InputError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for InputError {}

impl From<io::Error> for InputError {
    fn from(e: io::Error) -> Self {
        InputError::Io(e)
    }
}

/// A source of keyboard and mouse events feeding the aggregator.
///
/// `start` and `stop` are idempotent.
pub trait InputSource: Send {
    fn start(&mut self, aggregator: Arc<EventAggregator>) -> Result<(), InputError>;

    fn stop(&mut self) -> StopOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_keyboard() {
        let s = InputSettings::default();
        // KEY_A press, repeat, release
        assert_eq!(decode_event(&s, EV_KEY, 30, 1), Some(InputEvent::KeyPress));
        assert_eq!(decode_event(&s, EV_KEY, 30, 2), Some(InputEvent::KeyPress));
        assert_eq!(decode_event(&s, EV_KEY, 30, 0), None);
        // BTN_TOUCH is neither a key nor a configured button
        assert_eq!(decode_event(&s, EV_KEY, 0x14a, 1), None);
    }

    #[test]
    fn test_decode_mouse() {
        let s = InputSettings::default();
        assert_eq!(decode_event(&s, EV_KEY, 0x110, 1), Some(InputEvent::MouseButton));
        assert_eq!(decode_event(&s, EV_KEY, 0x110, 0), None);
        assert_eq!(decode_event(&s, EV_REL, 8, -1), Some(InputEvent::MouseWheel));
        assert_eq!(decode_event(&s, EV_REL, 8, 0), None);
        assert_eq!(decode_event(&s, EV_REL, 0, 3), Some(InputEvent::MouseMove));
        assert_eq!(decode_event(&s, EV_REL, 1, -2), Some(InputEvent::MouseMove));
        // EV_SYN
        assert_eq!(decode_event(&s, 0, 0, 0), None);
    }

    #[test]
    fn test_keyboard_and_buttons_are_not_throttled() {
        let counters = InputCounters::new(Duration::from_millis(100));
        let t = Instant::now();
        for _ in 0..5 {
            assert!(counters.record_at(InputEvent::KeyPress, t));
        }
        assert!(counters.record_at(InputEvent::MouseButton, t));
        assert!(counters.record_at(InputEvent::MouseWheel, t));

        assert_eq!(counters.take(), InputCounts { keyboard: 5, mouse: 2 });
        assert_eq!(counters.take(), InputCounts::default());
    }

    #[test]
    fn test_mouse_move_throttle() {
        let counters = InputCounters::new(Duration::from_millis(100));
        let t0 = Instant::now() + Duration::from_secs(1);

        assert!(counters.record_at(InputEvent::MouseMove, t0));
        assert!(!counters.record_at(InputEvent::MouseMove, t0 + Duration::from_millis(50)));
        assert!(!counters.record_at(InputEvent::MouseMove, t0 + Duration::from_millis(99)));
        assert!(counters.record_at(InputEvent::MouseMove, t0 + Duration::from_millis(100)));
        assert!(!counters.record_at(InputEvent::MouseMove, t0 + Duration::from_millis(150)));
        assert!(counters.record_at(InputEvent::MouseMove, t0 + Duration::from_millis(250)));

        assert_eq!(counters.peek().mouse, 3);
    }

    #[test]
    fn test_concurrent_counting() {
        let counters = Arc::new(InputCounters::new(Duration::from_millis(100)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&counters);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        c.record(InputEvent::KeyPress);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counters.take().keyboard, 4000);
    }
}
