use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tradedesk_core::{BridgeConfig, BridgeError};

/// Timing policy for the bridge connection.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Extra connection attempts after the first one fails.
    pub max_retries: u32,
    /// Fixed pause between connection attempts.
    pub retry_delay: Duration,
    /// Upper bound for a single connection attempt.
    pub connect_timeout: Duration,
    /// How long a command waits for its response.
    pub request_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl BridgeOptions {
    /// Longest `connect()` can take before giving up.
    pub fn connect_deadline(&self) -> Duration {
        (self.connect_timeout + self.retry_delay) * (self.max_retries + 1)
    }
}

/// JSON file holding the bridge connection record.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record, falling back to defaults when the file does not exist.
    pub fn load(&self) -> Result<BridgeConfig, BridgeError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "Bridge config not found, using defaults");
                return Ok(BridgeConfig::default());
            }
            Err(e) => {
                return Err(BridgeError::Config(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let config: BridgeConfig = serde_json::from_str(&raw).map_err(|e| {
            BridgeError::Config(format!("failed to parse {}: {}", self.path.display(), e))
        })?;
        info!(
            path = %self.path.display(),
            endpoint = %config.endpoint(),
            enabled = config.enabled,
            "Loaded bridge config"
        );
        Ok(config)
    }

    /// Write the record, creating parent directories as needed.
    pub async fn save(&self, config: &BridgeConfig) -> Result<(), BridgeError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                BridgeError::Config(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        let json = serde_json::to_string_pretty(config)
            .map_err(|e| BridgeError::Config(format!("serialization error: {}", e)))?;
        tokio::fs::write(&self.path, json).await.map_err(|e| {
            BridgeError::Config(format!("failed to write {}: {}", self.path.display(), e))
        })?;
        info!(path = %self.path.display(), endpoint = %config.endpoint(), "Saved bridge config");
        Ok(())
    }
}
