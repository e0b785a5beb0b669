//! Text renderings used in snapshot records and bookmarks.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Nanoseconds per 100ns tick (the 7-digit fraction unit).
const NANOS_PER_TICK: u32 = 100;

/// Formats a UTC timestamp as `yyyy-MM-ddTHH:mm:ss.fffffffZ`.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    // Leap-second nanos (>= 1e9) are clamped into the last tick.
    let ticks = (ts.timestamp_subsec_nanos() / NANOS_PER_TICK).min(9_999_999);
    format!("{}.{:07}Z", ts.format("%Y-%m-%dT%H:%M:%S"), ticks)
}

/// Formats a duration as `hh:mm:ss.fffffff`.
///
/// Hours are not wrapped at 24; durations of a day or more render with the
/// full hour count.
pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let ticks = d.subsec_nanos() / NANOS_PER_TICK;
    format!("{:02}:{:02}:{:02}.{:07}", hours, minutes, seconds, ticks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_timestamp_seven_digits() {
        let ts = Utc.with_ymd_and_hms(2026, 10, 16, 8, 5, 3).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        assert_eq!(format_timestamp(ts), "2026-10-16T08:05:03.1234567Z");

        let whole = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_timestamp(whole), "2026-01-02T03:04:05.0000000Z");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(300)), "00:05:00.0000000");
        assert_eq!(
            format_duration(Duration::new(3723, 500_000_000)),
            "01:02:03.5000000"
        );
        assert_eq!(format_duration(Duration::from_nanos(150)), "00:00:00.0000001");
        assert_eq!(format_duration(Duration::from_secs(90_000)), "25:00:00.0000000");
    }
}
