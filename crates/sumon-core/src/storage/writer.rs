//! Daily append-only snapshot files.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use tracing::info;

use super::StorageError;
use super::snapshot::Snapshot;

pub const FILE_PREFIX: &str = "SystemUtilizationTimeFrames";
pub const FILE_EXTENSION: &str = "json";

/// Day boundary shifted from midnight by a fixed number of hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalDay {
    offset: TimeDelta,
}

impl LogicalDay {
    pub fn new(offset_hours: i64) -> Self {
        Self {
            offset: TimeDelta::try_hours(offset_hours).unwrap_or_default(),
        }
    }

    /// The logical date of a local wall-clock time.
    pub fn date_of(&self, local: NaiveDateTime) -> NaiveDate {
        local
            .checked_add_signed(self.offset)
            .unwrap_or(local)
            .date()
    }
}

/// `SystemUtilizationTimeFrames<yyyyMMdd>.json`
pub fn daily_file_name(date: NaiveDate) -> String {
    format!("{}{}.{}", FILE_PREFIX, date.format("%Y%m%d"), FILE_EXTENSION)
}

/// Appends snapshots to the file of the current logical day.
pub struct SnapshotWriter {
    dir: PathBuf,
    day: LogicalDay,
    current: Option<(NaiveDate, PathBuf)>,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>, day: LogicalDay) -> Self {
        Self {
            dir: dir.into(),
            day,
            current: None,
        }
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|(_, p)| p.as_path())
    }

    /// Selects the file for the logical day of `local_now`. Returns `true`
    /// when the target changed.
    pub fn roll(&mut self, local_now: NaiveDateTime) -> bool {
        let date = self.day.date_of(local_now);
        if self.current.as_ref().is_some_and(|(d, _)| *d == date) {
            return false;
        }
        let path = self.dir.join(daily_file_name(date));
        info!("Writing snapshots to {}", path.display());
        self.current = Some((date, path));
        true
    }

    /// Appends one record to the current file with a single write.
    pub fn append(
        &mut self,
        snapshot: &Snapshot,
        local_now: NaiveDateTime,
    ) -> Result<PathBuf, StorageError> {
        if self.current.is_none() {
            self.roll(local_now);
        }
        let path = self
            .current
            .as_ref()
            .map(|(_, p)| p.clone())
            .unwrap_or_else(|| self.dir.join(daily_file_name(self.day.date_of(local_now))));

        let line = snapshot.to_json_line()?;
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::CpuHistogram;
    use chrono::{NaiveDate, Utc};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn snapshot() -> Snapshot {
        let now = Utc::now();
        Snapshot {
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
            expected_duration: Duration::from_secs(300),
            machine_name: "host".into(),
            processor_count: 1,
            tick_count: 0,
            user_domain_name: "host".into(),
            user_name: "user".into(),
            mouse_events: 0,
            keyboard_events: 0,
            cpu_usage: CpuHistogram::new(),
            top_processes: Vec::new(),
            file_changes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_logical_day_offset() {
        let day = LogicalDay::new(6);
        assert_eq!(day.date_of(at(5, 17, 59)), NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert_eq!(day.date_of(at(5, 18, 0)), NaiveDate::from_ymd_opt(2024, 3, 6).unwrap());
        assert_eq!(LogicalDay::new(0).date_of(at(5, 23, 59)).to_string(), "2024-03-05");
    }

    #[test]
    fn test_daily_file_name() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap();
        assert_eq!(daily_file_name(date), "SystemUtilizationTimeFrames20240306.json");
    }

    #[test]
    fn test_roll_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SnapshotWriter::new(dir.path().join("out"), LogicalDay::new(6));

        assert!(writer.roll(at(5, 10, 0)));
        assert!(!writer.roll(at(5, 17, 0)));
        let first = writer.append(&snapshot(), at(5, 17, 5)).unwrap();
        writer.append(&snapshot(), at(5, 17, 10)).unwrap();
        assert!(first.ends_with("SystemUtilizationTimeFrames20240305.json"));

        assert!(writer.roll(at(5, 18, 0)));
        let second = writer.append(&snapshot(), at(5, 18, 5)).unwrap();
        assert!(second.ends_with("SystemUtilizationTimeFrames20240306.json"));

        let content = fs::read_to_string(&first).unwrap();
        assert_eq!(content.lines().count(), 2);
        for line in content.lines() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["MachineName"], "host");
        }
        assert_eq!(fs::read_to_string(&second).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_append_without_roll_uses_current_day() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SnapshotWriter::new(dir.path(), LogicalDay::new(6));
        let path = writer.append(&snapshot(), at(7, 1, 0)).unwrap();
        assert!(path.ends_with("SystemUtilizationTimeFrames20240307.json"));
        assert_eq!(writer.current_path(), Some(path.as_path()));
    }
}
