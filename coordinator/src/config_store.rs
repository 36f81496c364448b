use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use blake3::Hasher as Blake3;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{WalletError, WalletResult};
use crate::storage::{write_atomic, ClientPaths};

const CONFIG_VERSION: u16 = 1;
/// Lower bound between reconnect attempts on the realtime channel.
pub const MIN_RECONNECT_DELAY_MS: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://e-wallet-springboot-backend-production.up.railway.app"
                .to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RealtimeConfig {
    pub endpoint: String,
    pub topic_prefix: String,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://e-wallet-springboot-backend.onrender.com/ws/websocket".to_string(),
            topic_prefix: "/topic/qr/".to_string(),
            reconnect_delay_ms: 5_000,
            connect_timeout_secs: 10,
        }
    }
}

impl RealtimeConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.max(MIN_RECONNECT_DELAY_MS))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationConfig {
    pub capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { capacity: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub network: NetworkConfig,
    pub realtime: RealtimeConfig,
    pub notifications: NotificationConfig,
    pub environment: String,
    pub last_updated: DateTime<Utc>,
    pub version: u16,
}

impl CoordinatorConfig {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            network: NetworkConfig::default(),
            realtime: RealtimeConfig::default(),
            notifications: NotificationConfig::default(),
            environment: environment.into(),
            last_updated: Utc::now(),
            version: CONFIG_VERSION,
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// Apply `EWALLET_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| -> Option<String> {
            let value = lookup(name)?;
            if value.trim().is_empty() {
                log::warn!("Environment variable {} is empty", name);
                return None;
            }
            if value.chars().any(|c| c.is_control()) {
                log::warn!(
                    "Environment variable {} contains control characters, ignoring",
                    name
                );
                return None;
            }
            log::debug!("Applying configuration override from {}", name);
            Some(value.trim().to_string())
        };
        let read_u64 = |name: &str| -> Option<u64> {
            let value = read(name)?;
            match value.parse() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    log::warn!("Environment variable {} is not a number, ignoring", name);
                    None
                }
            }
        };

        if let Some(url) = read("EWALLET_API_URL") {
            self.network.api_base_url = url;
        }
        if let Some(url) = read("EWALLET_WS_URL") {
            self.realtime.endpoint = url;
        }
        if let Some(secs) = read_u64("EWALLET_REQUEST_TIMEOUT_SECS") {
            self.network.request_timeout_secs = secs;
        }
        if let Some(ms) = read_u64("EWALLET_RECONNECT_DELAY_MS") {
            if ms < MIN_RECONNECT_DELAY_MS {
                log::warn!(
                    "EWALLET_RECONNECT_DELAY_MS={} is below the minimum, using {}",
                    ms,
                    MIN_RECONNECT_DELAY_MS
                );
            }
            self.realtime.reconnect_delay_ms = ms.max(MIN_RECONNECT_DELAY_MS);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigEnvelope {
    version: u16,
    checksum: [u8; 32],
    payload: CoordinatorConfig,
    modified_at_unix: i64,
}

/// Handles persistence of coordinator configuration with integrity checks.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_paths(paths: &ClientPaths) -> Self {
        Self {
            path: paths.config_file().to_path_buf(),
        }
    }

    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load_or_default(
        &self,
        environment: impl Into<String>,
    ) -> WalletResult<CoordinatorConfig> {
        if !self.path.exists() {
            let config = CoordinatorConfig::new(environment);
            self.save(&config)?;
            return Ok(config);
        }

        let bytes = fs::read(&self.path)?;
        let envelope: ConfigEnvelope = serde_json::from_slice(&bytes)
            .map_err(|e| WalletError::ValidationError(format!("Unreadable config: {}", e)))?;
        if envelope.version != CONFIG_VERSION {
            return Err(WalletError::ValidationError(format!(
                "Unsupported config version {}",
                envelope.version
            )));
        }

        if checksum(&envelope.payload)? != envelope.checksum {
            return Err(WalletError::ValidationError(
                "Config integrity verification failed".to_string(),
            ));
        }

        Ok(envelope.payload)
    }

    pub fn save(&self, config: &CoordinatorConfig) -> WalletResult<()> {
        let mut payload = config.clone();
        payload.touch();

        let envelope = ConfigEnvelope {
            version: CONFIG_VERSION,
            checksum: checksum(&payload)?,
            modified_at_unix: Utc::now().timestamp(),
            payload,
        };

        let serialized = serde_json::to_vec_pretty(&envelope)?;
        write_atomic(&self.path, &serialized, false)
    }

    pub fn update<F>(
        &self,
        environment: impl Into<String>,
        updater: F,
    ) -> WalletResult<CoordinatorConfig>
    where
        F: FnOnce(&mut CoordinatorConfig) -> WalletResult<()>,
    {
        let mut config = self.load_or_default(environment)?;
        updater(&mut config)?;
        config.touch();
        self.save(&config)?;
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn checksum(config: &CoordinatorConfig) -> WalletResult<[u8; 32]> {
    let mut hasher = Blake3::new();
    let encoded = serde_json::to_vec(config)?;
    hasher.update(&encoded);
    Ok(*hasher.finalize().as_bytes())
}
