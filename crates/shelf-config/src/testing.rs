//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Temporary cache roots
//! - A project directory for config files and input blobs
//!
//! # Usage
//!
//! ```ignore
//! use shelf_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     // env.cache_root and env.project_root are isolated per test
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::{Config, PROJECT_CONFIG};

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Data directory; the cache store lives in `cache_root` under it
    pub data_dir: PathBuf,
    /// Isolated cache store directory
    pub cache_root: PathBuf,
    /// Project root for the test
    pub project_root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let data_dir = root.join("data");
        let project_root = root.join("project");
        let cache_root = data_dir.join(format!("cache-{}", test_id));

        std::fs::create_dir_all(&cache_root)?;
        std::fs::create_dir_all(&project_root)?;

        Ok(Self {
            _temp_dir: temp_dir,
            data_dir,
            cache_root,
            project_root,
            test_id,
        })
    }

    /// A default config pointing at this environment's cache root
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.data_dir = self.data_dir.clone();
        cfg.storage.subdir = format!("cache-{}", self.test_id);
        cfg
    }

    /// Path of the project-local config file
    pub fn project_config_path(&self) -> PathBuf {
        self.project_root.join(PROJECT_CONFIG)
    }

    /// Write the project-local config file
    pub fn write_project_config(&self, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.project_config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Create a test file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.project_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}
