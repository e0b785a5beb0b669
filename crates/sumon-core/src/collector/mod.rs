//! Data sources read from the host: `/proc` accounting, host identity and
//! directory polling.
//!
//! Everything that reads `/proc` goes through the [`FileSystem`] trait so it
//! can be exercised against [`MockFs`].

pub mod cpu;
pub mod host;
pub mod mock;
pub mod process;
pub mod procfs;
pub mod traits;
pub mod watcher;

pub use cpu::{CpuSampler, spawn_cpu_sampler};
pub use host::HostInfo;
pub use mock::MockFs;
pub use process::ProcessTable;
pub use procfs::CollectError;
pub use traits::{FileSystem, RealFs};
pub use watcher::{DirectoryWatcher, spawn_watcher};
