//! File system layout of the daemon's storage directory.
//!
//! ```text
//! <project>/.modulard/
//!   config.toml      optional configuration
//!   daemon.sock      client socket
//!   daemon.pid       pid of the running daemon
//!   cache/index.jsonl
//!   cache/artifacts/ indexed module artifacts
//!   cache/scratch/   unindexed artifacts (cache disabled), cleared on start
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Name of the storage directory under the project root.
pub const STORAGE_DIR: &str = ".modulard";

/// Storage layer for modulard.
#[derive(Debug, Clone)]
pub struct Storage {
    /// Root directory (.modulard/)
    root: PathBuf,
}

impl Storage {
    /// Initialize the storage directory tree under a project root.
    pub fn init(project_root: &Path) -> Result<Self> {
        let storage = Self::open(project_root);
        fs::create_dir_all(storage.artifacts_dir())?;
        fs::create_dir_all(storage.scratch_dir())?;
        Ok(storage)
    }

    /// Open a storage directory without touching the file system.
    pub fn open(project_root: &Path) -> Self {
        Self {
            root: project_root.join(STORAGE_DIR),
        }
    }

    /// Get root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root.join("daemon.sock")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn index_path(&self) -> PathBuf {
        self.cache_dir().join("index.jsonl")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.cache_dir().join("artifacts")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.cache_dir().join("scratch")
    }

    /// Remove everything left in the scratch directory by a previous run.
    pub fn clear_scratch(&self) -> Result<usize> {
        let dir = self.scratch_dir();
        if !dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::init(dir.path()).unwrap();
        assert!(storage.artifacts_dir().is_dir());
        assert!(storage.scratch_dir().is_dir());
        assert_eq!(storage.root(), dir.path().join(".modulard"));
        assert!(storage.index_path().ends_with("cache/index.jsonl"));
    }

    #[test]
    fn clear_scratch_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::init(dir.path()).unwrap();
        fs::write(storage.scratch_dir().join("a.pcm"), b"x").unwrap();
        fs::write(storage.scratch_dir().join("b.pcm"), b"y").unwrap();
        assert_eq!(storage.clear_scratch().unwrap(), 2);
        assert_eq!(fs::read_dir(storage.scratch_dir()).unwrap().count(), 0);
    }
}
