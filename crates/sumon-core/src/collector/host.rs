//! Machine identity fields stamped on every snapshot.

use std::path::Path;

use crate::collector::procfs::{CollectError, parse_uptime_ms};
use crate::collector::traits::FileSystem;

/// Static identity of the host and the user running the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub machine_name: String,
    pub processor_count: usize,
    pub user_domain_name: String,
    pub user_name: String,
}

impl HostInfo {
    /// Gathers identity from `/proc/sys/kernel` and the environment.
    pub fn collect(fs: &impl FileSystem) -> Self {
        let machine_name = read_trimmed(fs, "/proc/sys/kernel/hostname")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string());

        // An unset NIS domain reads as "(none)".
        let user_domain_name = read_trimmed(fs, "/proc/sys/kernel/domainname")
            .filter(|d| d != "(none)")
            .unwrap_or_else(|| machine_name.clone());

        let user_name = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();

        let processor_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            machine_name,
            processor_count,
            user_domain_name,
            user_name,
        }
    }
}

/// Milliseconds since boot.
pub fn uptime_ms(fs: &impl FileSystem, proc_path: &str) -> Result<u64, CollectError> {
    let content = fs.read_to_string(Path::new(&format!("{}/uptime", proc_path)))?;
    Ok(parse_uptime_ms(&content)?)
}

fn read_trimmed(fs: &impl FileSystem, path: &str) -> Option<String> {
    fs.read_to_string(Path::new(path))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    #[test]
    fn test_collect_from_proc() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/sys/kernel/hostname", "tester-42\n");
        fs.add_file("/proc/sys/kernel/domainname", "(none)\n");

        let host = HostInfo::collect(&fs);
        assert_eq!(host.machine_name, "tester-42");
        assert_eq!(host.user_domain_name, "tester-42");
        assert!(host.processor_count >= 1);
    }

    #[test]
    fn test_domain_name_used_when_set() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/sys/kernel/hostname", "tester-42");
        fs.add_file("/proc/sys/kernel/domainname", "lab.example");
        assert_eq!(HostInfo::collect(&fs).user_domain_name, "lab.example");
    }

    #[test]
    fn test_uptime_ms() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/uptime", "12345.67 54321.00\n");
        assert_eq!(uptime_ms(&fs, "/proc").unwrap(), 12_345_670);
        assert!(uptime_ms(&MockFs::new(), "/proc").is_err());
    }
}
