//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage the on-disk layout one cache
//! instance expects: a main directory, browse and PSE directories, and a
//! persistence store file, all under one temp root per test.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Full-quality cache directory
    pub cache_dir: PathBuf,
    /// Browse-copy directory
    pub browse_dir: PathBuf,
    /// PSE-report directory
    pub pse_dir: PathBuf,
    /// Persistence store file
    pub store_file: PathBuf,
    /// Advisory transfer lock file
    pub transfer_lock: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> std::io::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let cache_dir = root.join("cache");
        let browse_dir = root.join("browse");
        let pse_dir = root.join("pse");

        std::fs::create_dir_all(&cache_dir)?;
        std::fs::create_dir_all(&browse_dir)?;
        std::fs::create_dir_all(&pse_dir)?;

        Ok(Self {
            store_file: root.join(format!("store-{}.json", test_id)),
            transfer_lock: root.join("transfer.lock"),
            _temp_dir: temp_dir,
            cache_dir,
            browse_dir,
            pse_dir,
            test_id,
        })
    }

    /// Staging subdirectory used for in-flight files
    pub fn creating_dir(&self) -> PathBuf {
        self.cache_dir.join("creating")
    }

    /// Create a file in the main cache directory with content
    pub fn create_cache_file(&self, name: &str, content: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.cache_dir.join(name);
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.cache_dir.exists());
        assert!(env.browse_dir.exists());
        assert!(env.pse_dir.exists());
        assert!(!env.store_file.exists());
    }

    #[test]
    fn test_environment_unique_store_files() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.test_id, env2.test_id);
    }

    #[test]
    fn test_create_cache_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_cache_file("a.mxf", b"essence").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"essence");
    }
}
