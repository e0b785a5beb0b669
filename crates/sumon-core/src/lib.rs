//! sumon-core: the system utilization monitor library.
//!
//! Provides:
//! - `config`: JSON configuration and monitor rules
//! - `activity`: incremental log activity detection (skip rules, bookmarks)
//! - `aggregator`: interval-scoped shared counters
//! - `input`: keyboard/mouse counting and the evdev listener
//! - `collector`: `/proc` readers, host identity, directory watcher
//! - `storage`: snapshot records, daily files, retention
//! - `scheduler`: the interval loop and producer shutdown
//! - `worker`: stoppable background threads
//! - `fmt`: timestamp and duration renderings

pub mod activity;
pub mod aggregator;
pub mod collector;
pub mod config;
pub mod fmt;
pub mod input;
pub mod scheduler;
pub mod storage;
pub mod worker;
