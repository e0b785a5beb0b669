//! Filesystem access behind a trait so `/proc` readers can be tested with
//! an in-memory tree.

use std::io;
use std::path::{Path, PathBuf};

/// Abstraction for the read-only filesystem operations the collectors need.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Checks if a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Lists entries in a directory (non-recursive).
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Real filesystem implementation that delegates to `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(path)?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_fs_roundtrip_in_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hostname");
        std::fs::write(&file, "workstation-07\n").unwrap();

        let fs = RealFs::new();
        assert!(fs.exists(&file));
        assert!(!fs.exists(&dir.path().join("missing")));
        assert_eq!(fs.read_to_string(&file).unwrap(), "workstation-07\n");
        assert_eq!(fs.read_dir(dir.path()).unwrap(), vec![file]);
    }
}
