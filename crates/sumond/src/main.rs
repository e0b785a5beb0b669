//! sumond - System utilization monitor daemon.
//!
//! Appends one utilization snapshot per interval (CPU histogram, keyboard and
//! mouse counts, top processes, log activity) to a daily JSON-lines file.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use sumon_core::activity::ActivityEngine;
use sumon_core::activity::bookmark::BookmarkStore;
use sumon_core::aggregator::EventAggregator;
use sumon_core::collector::{CpuSampler, DirectoryWatcher, RealFs, spawn_cpu_sampler, spawn_watcher};
use sumon_core::config::{AgentConfig, MonitorRule};
use sumon_core::input::{EvdevListener, InputSource};
use sumon_core::scheduler::Scheduler;
use sumon_core::storage::{LogicalDay, SnapshotWriter, spawn_retention};

const APP_DIR: &str = "SystemUtilizationMonitor";
const BOOKMARK_FILE: &str = "bookmarks.json";

/// System utilization monitor daemon.
#[derive(Parser, Debug)]
#[command(name = "sumond", about = "System utilization monitor daemon", version)]
struct Args {
    /// Configuration file. Created with defaults if missing.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output directory for snapshot files, overriding the configuration.
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Interval length in seconds, overriding the configuration.
    #[arg(short, long)]
    interval: Option<u64>,

    /// Mirror diagnostics to the console.
    #[arg(long)]
    debug: bool,

    /// Path to /proc filesystem.
    #[arg(long, default_value = "/proc")]
    proc_path: String,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only log errors.
    #[arg(short, long)]
    quiet: bool,
}

fn default_app_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn log_level(verbose: u8, quiet: bool) -> Level {
    if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy()
}

/// Keeps the non-blocking log writer alive.
#[must_use]
struct Log {
    _guard: Option<WorkerGuard>,
}

/// Installs the global subscriber: a daily rolling file under `log_dir`,
/// plus stderr in debug mode. Without a usable log directory only stderr is
/// used.
fn init_logging(level: Level, debug: bool, log_dir: &Path, max_log_files: usize) -> Log {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(max_log_files.max(1))
        .filename_prefix("sumond")
        .filename_suffix("log")
        .build(log_dir);

    let (file_layer, guard, file_error) = match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .compact()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(writer);
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    let console = debug || file_error.is_some();
    let stderr_layer = console.then(|| {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(io::stderr)
    });

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(file_layer)
        .with(stderr_layer)
        .init();

    if let Some(e) = file_error {
        warn!("Cannot write logs to {}: {}", log_dir.display(), e);
    }
    Log { _guard: guard }
}

/// Picks the output directory: the configured one if it can be created,
/// otherwise the default.
fn resolve_output_dir(configured: Option<PathBuf>, default: PathBuf) -> io::Result<PathBuf> {
    if let Some(dir) = configured {
        match std::fs::create_dir_all(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) => warn!(
                "Cannot use output directory {} ({}), falling back to {}",
                dir.display(),
                e,
                default.display()
            ),
        }
    }
    std::fs::create_dir_all(&default)?;
    Ok(default)
}

/// Distinct parent directories of the monitored files, in rule order.
fn watch_dirs(rules: &[MonitorRule]) -> Vec<PathBuf> {
    let now = chrono::Local::now().naive_local();
    let mut dirs: Vec<PathBuf> = Vec::new();
    for rule in rules {
        if let Some(parent) = rule.resolve_path(now).parent()
            && !parent.as_os_str().is_empty()
            && !dirs.iter().any(|d| d == parent)
        {
            dirs.push(parent.to_path_buf());
        }
    }
    dirs
}

fn log_banner(config: &AgentConfig, output_dir: &Path) {
    let agent = &config.agent;
    info!("Debug mode enabled");
    info!(
        "Read log files: {}, monitors: {}",
        agent.read_log_files,
        config.rules().len()
    );
    info!(
        "Interval: {}s, retained files: {}, output: {}",
        agent.interval_secs,
        agent.retained_file_count,
        output_dir.display()
    );
    info!(
        "Input codes: keys {:?}, buttons {:?}, wheel {:?}, move {:?}, move throttle {}ms",
        config.input.key_press_values,
        config.input.mouse_button_codes,
        config.input.mouse_wheel_codes,
        config.input.mouse_move_codes,
        config.input.mouse_move_throttle_ms
    );
}

fn main() {
    let args = Args::parse();
    let app_dir = default_app_dir();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| app_dir.join("config.json"));

    // Logging is not set up yet; configuration problems go to stderr.
    let stderr = fmt().with_writer(io::stderr).with_target(false).finish();
    let mut config =
        tracing::subscriber::with_default(stderr, || AgentConfig::load_or_create(&config_path));

    if let Some(interval) = args.interval {
        config.agent.interval_secs = interval;
    }
    config.agent.debug |= args.debug;
    let configured_dir = args.output_dir.clone().or_else(|| config.output_dir());

    let output_dir = match tracing::subscriber::with_default(
        fmt().with_writer(io::stderr).finish(),
        || resolve_output_dir(configured_dir, app_dir.clone()),
    ) {
        Ok(dir) => dir,
        Err(e) => {
            let log = init_logging(
                Level::ERROR,
                true,
                &app_dir.join("logs"),
                config.agent.retained_log_files,
            );
            error!("Cannot create any output directory: {}", e);
            drop(log);
            std::process::exit(1);
        }
    };

    let _log = init_logging(
        log_level(args.verbose, args.quiet),
        config.agent.debug,
        &output_dir.join("logs"),
        config.agent.retained_log_files,
    );

    info!("sumond {} starting", env!("CARGO_PKG_VERSION"));
    info!("Configuration: {}", config_path.display());
    if config.agent.debug {
        log_banner(&config, &output_dir);
    }

    let settings = config.agent.clone();
    let aggregator = Arc::new(EventAggregator::new(config.input.mouse_move_throttle()));
    let writer = SnapshotWriter::new(
        output_dir.clone(),
        LogicalDay::new(settings.logical_day_offset_hours),
    );

    let mut scheduler = Scheduler::new(
        settings.clone(),
        Arc::clone(&aggregator),
        writer,
        RealFs::new(),
        args.proc_path.clone(),
    )
    .with_stop_timeout(config.input.stop_timeout());

    let rules = config.rules();
    if settings.read_log_files {
        let store = BookmarkStore::new(output_dir.join(BOOKMARK_FILE));
        scheduler = scheduler.with_activity(ActivityEngine::new(rules.clone(), store));
    }

    // Producer failures leave the agent running without that source.
    let sampler = CpuSampler::new(RealFs::new(), args.proc_path.clone());
    match spawn_cpu_sampler(sampler, Arc::clone(&aggregator), settings.cpu_sample_interval()) {
        Ok(worker) => scheduler.add_worker(worker),
        Err(e) => warn!("CPU sampler not started: {}", e),
    }

    let mut input = EvdevListener::new(config.input.clone());
    match input.start(Arc::clone(&aggregator)) {
        Ok(()) => scheduler.set_input(Box::new(input)),
        Err(e) => warn!("Input listener not started ({}), keyboard and mouse counts will be zero", e),
    }

    if settings.read_log_files {
        let watcher = DirectoryWatcher::new(watch_dirs(&rules));
        match spawn_watcher(watcher, Arc::clone(&aggregator), settings.watch_poll_interval()) {
            Ok(Some(worker)) => scheduler.add_worker(worker),
            Ok(None) => info!("No monitored directories to watch"),
            Err(e) => warn!("Directory watcher not started: {}", e),
        }
    }

    match spawn_retention(
        output_dir.clone(),
        settings.retained_file_count,
        settings.cleanup_interval(),
    ) {
        Ok(worker) => scheduler.add_worker(worker),
        Err(e) => warn!("Retention task not started: {}", e),
    }

    let stop = scheduler.stop_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        stop.stop();
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    scheduler.run();

    info!("Shutting down...");
    scheduler.shutdown();
    info!("Shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use sumon_core::config::MonitorSpec;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "sumond", "--config", "/etc/sumon.json", "-o", "/tmp/out", "-i", "60", "--debug", "-vv",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/sumon.json")));
        assert_eq!(args.output_dir, Some(PathBuf::from("/tmp/out")));
        assert_eq!(args.interval, Some(60));
        assert!(args.debug);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.proc_path, "/proc");
    }

    #[test]
    fn test_log_level() {
        assert_eq!(log_level(0, false), Level::INFO);
        assert_eq!(log_level(1, false), Level::DEBUG);
        assert_eq!(log_level(3, false), Level::TRACE);
        assert_eq!(log_level(2, true), Level::ERROR);
    }

    #[test]
    fn test_resolve_output_dir_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let default = dir.path().join("default");

        let chosen = resolve_output_dir(Some(blocker.join("out")), default.clone()).unwrap();
        assert_eq!(chosen, default);
        assert!(default.is_dir());

        let configured = dir.path().join("configured");
        let chosen = resolve_output_dir(Some(configured.clone()), default).unwrap();
        assert_eq!(chosen, configured);

        assert!(resolve_output_dir(None, blocker.join("x")).is_err());
    }

    #[test]
    fn test_watch_dirs_deduplicates() {
        let rule = |path: &str| {
            MonitorRule::from_spec(&MonitorSpec {
                file_path: path.to_string(),
                ..MonitorSpec::default()
            })
        };
        let rules = vec![
            rule("/var/log/aguila/Sequencer 1/TraceLog.txt"),
            rule("/var/log/aguila/Sequencer 1/Other.txt"),
            rule("/var/log/aguila/Sequencer 2/TraceLog.txt"),
            rule("relative.txt"),
        ];
        assert_eq!(
            watch_dirs(&rules),
            vec![
                PathBuf::from("/var/log/aguila/Sequencer 1"),
                PathBuf::from("/var/log/aguila/Sequencer 2"),
            ]
        );
    }
}
