//! Agent configuration.
//!
//! The configuration is a JSON document loaded once at start-up. A missing
//! file is replaced by the defaults; a malformed one is set aside and the
//! defaults are written in its place, so loading never fails.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::activity::skip::{SkipRule, parse_skip_rules};

/// Errors from reading or writing the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "config parse error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Monitored log files, evaluated in this order.
    pub monitors: Vec<MonitorSpec>,
    pub agent: AgentSettings,
    pub input: InputSettings,
}

/// One monitored log file, as written in the configuration file.
///
/// List-valued fields are ';'-separated; skip spans are written `from|to`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorSpec {
    pub name: String,
    pub file_path: String,
    /// Date token embedded in `file_path`, e.g. `yyyy/MM/dd`.
    pub date_format: String,
    pub no_content: String,
    pub skip: String,
    pub last_line_content: String,
}

/// Global agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Enables the activity engine and the directory watchers.
    pub read_log_files: bool,
    /// Mirrors diagnostics to the console.
    pub debug: bool,
    pub interval_secs: u64,
    /// Number of daily snapshot files kept by the retention task.
    pub retained_file_count: usize,
    /// Output directory; environment variables are expanded.
    pub output_dir: Option<String>,
    /// Shift applied to local time before taking the date of a snapshot file.
    pub logical_day_offset_hours: i64,
    /// Writes `{"0": expected samples}` when an interval collected no CPU
    /// samples at all. Kept for compatibility with existing consumers.
    pub fill_empty_cpu_histogram: bool,
    pub top_process_count: usize,
    pub cpu_sample_interval_ms: u64,
    pub cleanup_interval_secs: u64,
    pub watch_poll_interval_ms: u64,
    /// Number of daily agent log files kept.
    pub retained_log_files: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            read_log_files: true,
            debug: false,
            interval_secs: 300,
            retained_file_count: 15,
            output_dir: None,
            logical_day_offset_hours: 6,
            fill_empty_cpu_histogram: true,
            top_process_count: 10,
            cpu_sample_interval_ms: 1000,
            cleanup_interval_secs: 3600,
            watch_poll_interval_ms: 1000,
            retained_log_files: 7,
        }
    }
}

impl AgentSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn cpu_sample_interval(&self) -> Duration {
        Duration::from_millis(self.cpu_sample_interval_ms.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch_poll_interval_ms.max(1))
    }

    /// Number of CPU samples an interval yields at the nominal sample rate.
    pub fn expected_cpu_samples(&self) -> u32 {
        let interval_ms = self.interval().as_millis();
        let sample_ms = self.cpu_sample_interval().as_millis();
        u32::try_from(interval_ms / sample_ms).unwrap_or(u32::MAX)
    }
}

/// Input-event codes, expressed as Linux evdev `type`/`code`/`value` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputSettings {
    /// `EV_KEY` values counted as a key press (1 = press, 2 = auto-repeat).
    pub key_press_values: Vec<i32>,
    /// `EV_KEY` codes of mouse buttons (BTN_LEFT, BTN_RIGHT, BTN_MIDDLE).
    pub mouse_button_codes: Vec<u16>,
    /// `EV_REL` codes of wheels (REL_HWHEEL, REL_WHEEL).
    pub mouse_wheel_codes: Vec<u16>,
    /// `EV_REL` codes of pointer motion (REL_X, REL_Y).
    pub mouse_move_codes: Vec<u16>,
    pub mouse_move_throttle_ms: u64,
    /// Bounded wait when stopping the listener thread.
    pub stop_timeout_ms: u64,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            key_press_values: vec![1, 2],
            mouse_button_codes: vec![0x110, 0x111, 0x112],
            mouse_wheel_codes: vec![6, 8],
            mouse_move_codes: vec![0, 1],
            mouse_move_throttle_ms: 100,
            stop_timeout_ms: 2000,
        }
    }
}

impl InputSettings {
    pub fn mouse_move_throttle(&self) -> Duration {
        Duration::from_millis(self.mouse_move_throttle_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

const PRIORITY_SKIP: &str = "GetStatus;RetrieveHWConfigInfo =;CommandType =;CommandSource =;UniqueCommandId =;SysCClientUniqueCommandId =;SiteId =;AdditionalParameters =;TesterInfo.get_VMImageVersion - VMImageVersion:;TpCache.GetCachedTps - Test package caching is not currently implemented.;NetworkConfigurator.get_IpAddressToSpacialLocation - IP location mapping:;localhost: 1;HwConfig.CollectHwConfig;HwConfig.CreateSocketEntities;HwConfig.parseCMMSList;HwConfig.SerializeXml;xml version=;HWConfiguration;</;/>;<SocketEntity;<TesterExternalEntity;<BoardBLT;<TesterCoreEntity;TesterHWConfigAsXMLString";
const PRIORITY_LAST_LINE: &str = "EventManager.SendEvent - Send SiteInformationEvent Event to Supervisor for command UndefinedSiteCommand, uniqueCommandId 8888888888888888888, SysCClientUniqueCommandId:";

impl Default for AgentConfig {
    fn default() -> Self {
        let mut monitors = vec![MonitorSpec {
            name: "monitor_txt_priority".to_string(),
            file_path: "/var/log/sthi/strut_detail_log_yyyy/MM/dd.txt".to_string(),
            date_format: "yyyy/MM/dd".to_string(),
            no_content: "RmqEventsListener".to_string(),
            skip: PRIORITY_SKIP.to_string(),
            last_line_content: PRIORITY_LAST_LINE.to_string(),
        }];
        for n in 1..=4 {
            monitors.push(MonitorSpec {
                name: format!("monitor_txt_normal_{}", n),
                file_path: format!("/var/log/aguila/Sequencer {}/TraceLog.txt", n),
                ..MonitorSpec::default()
            });
        }

        Self {
            monitors,
            agent: AgentSettings::default(),
            input: InputSettings::default(),
        }
    }
}

impl AgentConfig {
    /// Reads and parses a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Writes the configuration as pretty-printed JSON, creating parent
    /// directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Loads the configuration, materializing defaults when the file is
    /// missing or unreadable as JSON.
    pub fn load_or_create(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => return config,
                Err(e) => {
                    warn!(
                        "Invalid configuration {} ({}), regenerating defaults",
                        path.display(),
                        e
                    );
                    let mut backup = path.as_os_str().to_owned();
                    backup.push(".invalid");
                    if let Err(e) = fs::rename(path, &backup) {
                        warn!("Failed to preserve invalid configuration: {}", e);
                    }
                }
            }
        }

        let config = Self::default();
        match config.save(path) {
            Ok(()) => info!("Wrote default configuration to {}", path.display()),
            Err(e) => warn!(
                "Failed to write default configuration {}: {}",
                path.display(),
                e
            ),
        }
        config
    }

    /// Parsed monitor rules in evaluation order. Entries without a file
    /// path are ignored.
    pub fn rules(&self) -> Vec<MonitorRule> {
        self.monitors
            .iter()
            .filter(|spec| !spec.file_path.trim().is_empty())
            .map(MonitorRule::from_spec)
            .collect()
    }

    /// The configured output directory with environment variables expanded.
    pub fn output_dir(&self) -> Option<PathBuf> {
        self.agent
            .output_dir
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| PathBuf::from(expand_env_vars(s)))
    }
}

/// A parsed monitor rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorRule {
    pub name: String,
    pub file_path: String,
    pub date_format: Option<String>,
    /// A new line lacking any of these substrings counts as activity.
    pub no_content_markers: Vec<String>,
    pub skip_rules: Vec<SkipRule>,
    /// When the file did not grow, a last line containing one of these
    /// substrings counts as activity.
    pub last_line_markers: Vec<String>,
}

impl MonitorRule {
    pub fn from_spec(spec: &MonitorSpec) -> Self {
        Self {
            name: spec.name.clone(),
            file_path: spec.file_path.clone(),
            date_format: Some(spec.date_format.clone()).filter(|f| !f.is_empty()),
            no_content_markers: split_list(&spec.no_content),
            skip_rules: parse_skip_rules(&spec.skip),
            last_line_markers: split_list(&spec.last_line_content),
        }
    }

    /// A rule with neither no-content markers nor skip rules treats any
    /// growth as activity.
    pub fn is_unrestricted(&self) -> bool {
        self.no_content_markers.is_empty() && self.skip_rules.is_empty()
    }

    /// Substitutes the date token (if any) with `now` rendered in that
    /// format, with path separators removed from the rendered date.
    pub fn resolve_path(&self, now: NaiveDateTime) -> PathBuf {
        match &self.date_format {
            Some(token) if self.file_path.contains(token.as_str()) => {
                let rendered = render_date_token(token, now).replace('/', "");
                PathBuf::from(self.file_path.replace(token.as_str(), &rendered))
            }
            _ => PathBuf::from(&self.file_path),
        }
    }
}

/// Splits a ';'-separated list, dropping empty entries.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(';')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Renders a `yyyy`/`yy`/`MM`/`dd`/`HH`/`mm`/`ss` style date pattern.
/// Any other character is copied through.
pub fn render_date_token(pattern: &str, now: NaiveDateTime) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut rest = pattern;
    while !rest.is_empty() {
        let (piece, len) = if rest.starts_with("yyyy") {
            (format!("{:04}", now.year()), 4)
        } else if rest.starts_with("yy") {
            (format!("{:02}", now.year().rem_euclid(100)), 2)
        } else if rest.starts_with("MM") {
            (format!("{:02}", now.month()), 2)
        } else if rest.starts_with("dd") {
            (format!("{:02}", now.day()), 2)
        } else if rest.starts_with("HH") {
            (format!("{:02}", now.hour()), 2)
        } else if rest.starts_with("mm") {
            (format!("{:02}", now.minute()), 2)
        } else if rest.starts_with("ss") {
            (format!("{:02}", now.second()), 2)
        } else {
            let ch = rest.chars().next().unwrap_or_default();
            (ch.to_string(), ch.len_utf8())
        };
        out.push_str(&piece);
        rest = &rest[len..];
    }
    out
}

/// Expands `$VAR`, `${VAR}` and `%VAR%` references. Unknown variables are
/// left as written.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find(['$', '%']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        let (name, consumed) = if let Some(braced) = tail.strip_prefix("${") {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 3),
                None => ("", 0),
            }
        } else if let Some(pct) = tail.strip_prefix('%') {
            match pct.find('%') {
                Some(end) => (&pct[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let body = &tail[1..];
            let end = body
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(body.len());
            (&body[..end], end + 1)
        };

        let value = (!name.is_empty()).then(|| std::env::var(name).ok()).flatten();
        match value {
            Some(value) => {
                out.push_str(&value);
                rest = &tail[consumed..];
            }
            None => {
                out.push_str(&tail[..1]);
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}
