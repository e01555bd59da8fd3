use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use directories::ProjectDirs;

use super::pow_mode::PowMode;

pub const CACHE_DIRECTORY_NAME: &str = "caches";
pub const DATASET_DIRECTORY_NAME: &str = "datasets";

/// Where the engine keeps its epoch files between runs.
#[derive(Debug, Clone)]
pub struct DataDirectory {
    data_dir: PathBuf,
}

impl DataDirectory {
    /// The default varies by operating system and includes the pow mode,
    /// so test-sized files never mix with real ones, e.g.
    ///
    /// - Linux:   /home/alice/.local/share/epochash/normal
    /// - macOS:   /Users/Alice/Library/Application Support/org.epochash.epochash/normal
    pub fn get(root_dir: Option<PathBuf>, mode: PowMode) -> Result<Self> {
        let data_dir = match root_dir {
            Some(root) => root,
            None => ProjectDirs::from("org", "epochash", "epochash")
                .context("Could not determine data directory")?
                .data_dir()
                .to_path_buf(),
        };

        Ok(DataDirectory {
            data_dir: data_dir.join(mode.to_string()),
        })
    }

    /// Create directory if it does not exist
    pub fn create_dir_if_not_exists(dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create data directory {}", dir.to_string_lossy()))
    }

    pub fn root_dir_path(&self) -> PathBuf {
        self.data_dir.clone()
    }

    pub fn cache_dir_path(&self) -> PathBuf {
        self.data_dir.join(CACHE_DIRECTORY_NAME)
    }

    pub fn dataset_dir_path(&self) -> PathBuf {
        self.data_dir.join(DATASET_DIRECTORY_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_nest_under_mode() {
        let root = tempfile::tempdir().unwrap();
        let dirs = DataDirectory::get(Some(root.path().to_path_buf()), PowMode::Test).unwrap();

        assert_eq!(root.path().join("test"), dirs.root_dir_path());
        assert_eq!(root.path().join("test").join("caches"), dirs.cache_dir_path());
        assert_eq!(root.path().join("test").join("datasets"), dirs.dataset_dir_path());

        DataDirectory::create_dir_if_not_exists(&dirs.cache_dir_path()).unwrap();
        assert!(dirs.cache_dir_path().is_dir());
    }
}
