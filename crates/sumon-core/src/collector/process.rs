//! Per-process CPU time, grouped by process name.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tracing::trace;

use crate::collector::procfs::{CollectError, ProcStat, parse_proc_stat};
use crate::collector::traits::FileSystem;

/// Clock ticks per second (USER_HZ).
const CLK_TCK: u64 = 100;

/// Reads process accounting from `/proc/[pid]/stat`.
pub struct ProcessTable<F: FileSystem> {
    fs: F,
    proc_path: String,
}

impl<F: FileSystem> ProcessTable<F> {
    pub fn new(fs: F, proc_path: impl Into<String>) -> Self {
        Self {
            fs,
            proc_path: proc_path.into(),
        }
    }

    /// Lists the numeric entries of the proc directory.
    pub fn list_pids(&self) -> Result<Vec<u32>, CollectError> {
        let entries = self.fs.read_dir(Path::new(&self.proc_path))?;
        let mut pids: Vec<u32> = entries
            .iter()
            .filter_map(|p| p.file_name()?.to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    pub fn collect_process(&self, pid: u32) -> Result<ProcStat, CollectError> {
        let path = format!("{}/{}/stat", self.proc_path, pid);
        let content = self.fs.read_to_string(Path::new(&path))?;
        Ok(parse_proc_stat(&content)?)
    }

    /// The `limit` process names with the most accumulated CPU time,
    /// descending. Processes sharing a name are summed; names with no CPU
    /// time are left out. Processes that vanish mid-scan are skipped.
    pub fn top_processes(&self, limit: usize) -> Result<Vec<(String, Duration)>, CollectError> {
        let mut by_name: HashMap<String, u64> = HashMap::new();
        for pid in self.list_pids()? {
            match self.collect_process(pid) {
                Ok(stat) => *by_name.entry(stat.comm).or_insert(0) += stat.utime + stat.stime,
                Err(e) => trace!("Skipping process {}: {}", pid, e),
            }
        }

        let mut ranked: Vec<(String, u64)> =
            by_name.into_iter().filter(|(_, ticks)| *ticks > 0).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);

        Ok(ranked
            .into_iter()
            .map(|(name, ticks)| (name, ticks_to_duration(ticks)))
            .collect())
    }
}

fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_millis(ticks.saturating_mul(1000 / CLK_TCK))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    fn table() -> ProcessTable<MockFs> {
        let mut fs = MockFs::new();
        fs.add_process(1, "systemd", 300, 200);
        fs.add_process(200, "python3", 1000, 50);
        fs.add_process(201, "python3", 400, 0);
        fs.add_process(300, "idle thing", 0, 0);
        fs.add_process(400, "sshd", 20, 30);
        fs.add_file("/proc/meminfo", "MemTotal: 1 kB\n");
        fs.add_dir("/proc/self");
        ProcessTable::new(fs, "/proc")
    }

    #[test]
    fn test_list_pids_ignores_non_numeric() {
        assert_eq!(table().list_pids().unwrap(), vec![1, 200, 201, 300, 400]);
    }

    #[test]
    fn test_top_processes_groups_and_orders() {
        let top = table().top_processes(10).unwrap();
        let names: Vec<&str> = top.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["python3", "systemd", "sshd"]);
        assert_eq!(top[0].1, Duration::from_millis(14_500));
        assert_eq!(top[2].1, Duration::from_millis(500));
    }

    #[test]
    fn test_top_processes_limit() {
        let top = table().top_processes(2).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[1].0, "systemd");
    }

    #[test]
    fn test_missing_proc_dir_is_error() {
        let table = ProcessTable::new(MockFs::new(), "/proc");
        assert!(table.top_processes(10).is_err());
    }
}
