//! Pool configuration
//!
//! A single JSON file with every field defaulted, so an empty or missing
//! file yields a working pool. A corrupted file falls back to defaults
//! with a warning rather than refusing to start.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum simultaneous liveness checks. This is the pool's main
    /// throughput/latency knob: too high exhausts ephemeral ports and trips
    /// remote connection limits, too low lets the backlog of unchecked
    /// credentials grow.
    pub check_concurrency: usize,

    /// Hard deadline for one credential check, connect through IP test.
    pub check_timeout_secs: u64,

    /// Minimum spacing between checks of the same credential.
    pub check_interval_secs: u64,

    /// Delete credentials that fail a liveness check.
    pub auto_delete_dead: bool,

    /// Unbind ports whose tunnel stopped proxying.
    pub auto_replace_dead: bool,

    /// Never rebind a port to a credential it already consumed.
    pub unique_per_port: bool,

    /// Rotate still-healthy tunnels once they have been connected longer
    /// than `rotation_interval_secs`, bounding the lifetime of any egress IP.
    pub auto_rotate: bool,
    pub rotation_interval_secs: u64,

    /// Transient-failure retry budget per establishment.
    pub connect_retries: u32,

    /// TCP connect + SSH handshake timeout.
    pub connect_timeout_secs: u64,

    /// Overall deadline for one assign-and-connect pass.
    pub establish_deadline_secs: u64,

    /// Ports seeded into the pool at startup.
    pub ports: Vec<u16>,

    pub supplier: SupplierConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            check_concurrency: 50,
            check_timeout_secs: 60,
            check_interval_secs: 60,
            auto_delete_dead: false,
            auto_replace_dead: true,
            unique_per_port: false,
            auto_rotate: false,
            rotation_interval_secs: 60,
            connect_retries: 3,
            connect_timeout_secs: 30,
            establish_deadline_secs: 60,
            ports: Vec::new(),
            supplier: SupplierConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn establish_deadline(&self) -> Duration {
        Duration::from_secs(self.establish_deadline_secs)
    }

    pub fn check_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.check_interval_secs as i64)
    }

    pub fn rotation_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.rotation_interval_secs as i64)
    }
}

/// External credential marketplace settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupplierConfig {
    pub enabled: bool,
    pub api_key: String,
    /// Country filter; "All" disables filtering.
    pub country: String,
}

impl Default for SupplierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            country: "All".into(),
        }
    }
}

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads and writes the config file on disk.
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the configuration. Missing file ⇒ defaults; unparseable file ⇒
    /// defaults with a warning.
    pub async fn load(&self) -> Result<PoolConfig, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => Ok(config),
                Err(e) => {
                    warn!("config file {} is corrupted ({}), using defaults", self.path.display(), e);
                    Ok(PoolConfig::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PoolConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, config: &PoolConfig) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = PoolConfig::default();
        assert_eq!(config.check_concurrency, 50);
        assert_eq!(config.connect_retries, 3);
        assert!(config.auto_replace_dead);
        assert!(!config.supplier.enabled);
        assert_eq!(config.supplier.country, "All");
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"unique_per_port": true, "ports": [20000, 20001]}"#).unwrap();
        assert!(config.unique_per_port);
        assert_eq!(config.ports, vec![20000, 20001]);
        assert_eq!(config.check_concurrency, 50);
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ConfigStorage::new(dir.path().join("sshpool.json"));
        let config = storage.load().await.unwrap();
        assert_eq!(config.rotation_interval_secs, 60);
    }

    #[tokio::test]
    async fn corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sshpool.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        let config = ConfigStorage::new(path).load().await.unwrap();
        assert_eq!(config.check_concurrency, 50);
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ConfigStorage::new(dir.path().join("nested").join("sshpool.json"));

        let mut config = PoolConfig::default();
        config.auto_rotate = true;
        config.ports = vec![20000];
        config.supplier.api_key = "key".into();

        storage.save(&config).await.unwrap();
        let loaded = storage.load().await.unwrap();
        assert!(loaded.auto_rotate);
        assert_eq!(loaded.ports, vec![20000]);
        assert_eq!(loaded.supplier.api_key, "key");
    }
}
