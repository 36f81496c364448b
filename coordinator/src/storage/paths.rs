use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{WalletError, WalletResult};

/// Manages filesystem paths used by the client.
#[derive(Debug, Clone)]
pub struct ClientPaths {
    /// Root directory for client data.
    root_dir: PathBuf,
    /// File holding the persisted bearer token.
    token_file: PathBuf,
    /// Directory for disposable cache data.
    cache_dir: PathBuf,
    /// Path to persisted coordinator configuration.
    config_file: PathBuf,
}

impl ClientPaths {
    /// Default token file name used on disk.
    pub const DEFAULT_TOKEN_FILENAME: &'static str = "session.token";
    /// Default configuration file name used on disk.
    pub const DEFAULT_CONFIG_FILENAME: &'static str = "coordinator.config";

    /// Create a new path manager rooted at the provided directory.
    pub fn new(root: impl AsRef<Path>) -> WalletResult<Self> {
        let root_dir = root.as_ref().to_path_buf();
        if root_dir.as_os_str().is_empty() {
            return Err(WalletError::StorageError(
                "Client root directory cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            token_file: root_dir.join(Self::DEFAULT_TOKEN_FILENAME),
            cache_dir: root_dir.join("cache"),
            config_file: root_dir.join(Self::DEFAULT_CONFIG_FILENAME),
            root_dir,
        })
    }

    /// Ensure the directory structure exists, creating missing folders.
    pub fn ensure_directories(&self) -> WalletResult<()> {
        fs::create_dir_all(&self.root_dir)?;
        fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }

    pub fn token_file(&self) -> &Path {
        &self.token_file
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_client_paths_creation() {
        let temp_dir = TempDir::new().unwrap();
        let paths = ClientPaths::new(temp_dir.path()).unwrap();

        assert_eq!(
            paths.token_file(),
            temp_dir.path().join(ClientPaths::DEFAULT_TOKEN_FILENAME)
        );
        assert_eq!(paths.cache_dir(), temp_dir.path().join("cache"));
        assert_eq!(
            paths.config_file(),
            temp_dir.path().join(ClientPaths::DEFAULT_CONFIG_FILENAME)
        );
    }

    #[test]
    fn test_empty_root_directory_rejected() {
        match ClientPaths::new("") {
            Err(WalletError::StorageError(msg)) => {
                assert!(msg.contains("cannot be empty"));
            }
            _ => panic!("Expected StorageError for empty root"),
        }
    }

    #[test]
    fn test_ensure_directories() {
        let temp_dir = TempDir::new().unwrap();
        let paths = ClientPaths::new(temp_dir.path().join("nested")).unwrap();

        paths.ensure_directories().unwrap();

        assert!(paths.root_dir().exists());
        assert!(paths.cache_dir().exists());
    }
}
