use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use blake3::Hasher as Blake3;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{write_atomic, ClientPaths};
use crate::errors::WalletResult;

const TOKEN_FILE_VERSION: u16 = 1;

/// Durable storage for the bearer token, the only state kept across reloads.
pub trait TokenStore: Send + Sync + fmt::Debug {
    fn load(&self) -> WalletResult<Option<SecretString>>;
    fn save(&self, token: &SecretString) -> WalletResult<()>;
    /// Remove any persisted token. Succeeds when nothing is stored.
    fn clear(&self) -> WalletResult<()>;
}

#[derive(Serialize, Deserialize)]
struct TokenFile {
    version: u16,
    saved_at: DateTime<Utc>,
    checksum: [u8; 32],
    token: Zeroizing<String>,
}

/// Token persisted as a small checksummed JSON file.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn from_paths(paths: &ClientPaths) -> Self {
        Self::new(paths.token_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> WalletResult<Option<SecretString>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let bytes = Zeroizing::new(fs::read(&self.path)?);
        let file: TokenFile = match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("Discarding unreadable token file: {}", e);
                self.clear()?;
                return Ok(None);
            }
        };

        if file.version != TOKEN_FILE_VERSION || checksum(&file.token) != file.checksum {
            log::warn!("Discarding token file that failed integrity verification");
            self.clear()?;
            return Ok(None);
        }

        if file.token.is_empty() {
            return Ok(None);
        }
        Ok(Some(SecretString::from(file.token.to_string())))
    }

    fn save(&self, token: &SecretString) -> WalletResult<()> {
        let token = Zeroizing::new(token.expose_secret().to_string());
        let file = TokenFile {
            version: TOKEN_FILE_VERSION,
            saved_at: Utc::now(),
            checksum: checksum(&token),
            token,
        };
        let serialized = Zeroizing::new(serde_json::to_vec(&file)?);
        write_atomic(&self.path, &serialized, true)
    }

    fn clear(&self) -> WalletResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Token kept only for the lifetime of the process.
#[derive(Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<SecretString>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for MemoryTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryTokenStore")
            .field("stored", &self.token.lock().is_some())
            .finish()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> WalletResult<Option<SecretString>> {
        Ok(self
            .token
            .lock()
            .as_ref()
            .map(|token| SecretString::from(token.expose_secret().to_string())))
    }

    fn save(&self, token: &SecretString) -> WalletResult<()> {
        *self.token.lock() = Some(SecretString::from(token.expose_secret().to_string()));
        Ok(())
    }

    fn clear(&self) -> WalletResult<()> {
        *self.token.lock() = None;
        Ok(())
    }
}

fn checksum(token: &str) -> [u8; 32] {
    let mut hasher = Blake3::new();
    hasher.update(token.as_bytes());
    *hasher.finalize().as_bytes()
}
