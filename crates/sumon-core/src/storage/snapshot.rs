//! The per-interval record.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::aggregator::CpuHistogram;
use crate::fmt::{format_duration, format_timestamp};

/// One completed interval. Serialized as a single JSON object whose keys keep
/// the field order below.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Snapshot {
    #[serde(serialize_with = "serialize_timestamp")]
    pub start_time: DateTime<Utc>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub end_time: DateTime<Utc>,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    #[serde(serialize_with = "serialize_duration")]
    pub expected_duration: Duration,
    pub machine_name: String,
    pub processor_count: usize,
    /// Milliseconds since boot when the record was built.
    #[serde(rename = "TickCount64")]
    pub tick_count: u64,
    pub user_domain_name: String,
    pub user_name: String,
    pub mouse_events: u64,
    pub keyboard_events: u64,
    pub cpu_usage: CpuHistogram,
    /// Process name and accumulated CPU time, highest first.
    #[serde(serialize_with = "serialize_top_processes")]
    pub top_processes: Vec<(String, Duration)>,
    pub file_changes: BTreeMap<String, u64>,
}

impl Snapshot {
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

fn serialize_timestamp<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_timestamp(*t))
}

fn serialize_duration<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*d))
}

fn serialize_top_processes<S: Serializer>(
    top: &[(String, Duration)],
    s: S,
) -> Result<S::Ok, S::Error> {
    let mut map = s.serialize_map(Some(top.len()))?;
    for (name, cpu_time) in top {
        map.serialize_entry(name, &format_duration(*cpu_time))?;
    }
    map.end()
}
