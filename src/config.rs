//! Service configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub evidence: EvidenceConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the local database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Attempts before a transiently failing mutation goes dead
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on any retry delay in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Randomize retry delays across [0, delay]
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Structured mutations in flight at once (distinct targets)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Evidence uploads in flight at once
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,

    /// Timeout applied to every remote call, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Background sync interval in milliseconds
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    /// Probe the remote API before trusting a link-layer "online"
    #[serde(default = "default_true")]
    pub probe_enabled: bool,

    /// Seconds after which the last reachability check is considered stale
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Assume the link is up at startup
    #[serde(default = "default_true")]
    pub assume_online_at_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceConfig {
    /// Local evidence quota in bytes (0 = unlimited)
    #[serde(default = "default_max_local_bytes")]
    pub max_local_bytes: u64,

    /// Longest edge of stored photos in pixels
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,

    /// JPEG quality for normalized photos (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Remote bucket path prefix
    #[serde(default = "default_bucket_prefix")]
    pub bucket_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the system of record
    #[serde(default = "default_remote_url")]
    pub base_url: String,

    /// API key sent with every request
    #[serde(default)]
    pub api_key: Option<String>,

    /// Storage bucket for evidence
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Loopback control API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

// Defaults
fn default_data_dir() -> PathBuf {
    PathBuf::from("./inspection-data")
}
fn default_max_attempts() -> u32 { 5 }
fn default_backoff_base_ms() -> u64 { 2_000 }
fn default_backoff_max_ms() -> u64 { 5 * 60 * 1000 }
fn default_true() -> bool { true }
fn default_max_concurrent() -> usize { 4 }
fn default_max_concurrent_uploads() -> usize { 2 }
fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_sync_interval() -> u64 { 30_000 }
fn default_stale_after_secs() -> u64 { 60 }
fn default_max_local_bytes() -> u64 { 2 * 1024 * 1024 * 1024 } // 2GB
fn default_max_dimension() -> u32 { 1920 }
fn default_jpeg_quality() -> u8 { 80 }
fn default_bucket_prefix() -> String { "projects".to_string() }
fn default_remote_url() -> String { "http://localhost:54321".to_string() }
fn default_bucket() -> String { "audit-evidence".to_string() }
fn default_http_port() -> u16 { 8787 }

impl Default for StoreConfig {
    fn default() -> Self {
        Self { data_dir: default_data_dir() }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: true,
            max_concurrent: default_max_concurrent(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            request_timeout_ms: default_request_timeout_ms(),
            sync_interval_ms: default_sync_interval(),
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_enabled: true,
            stale_after_secs: default_stale_after_secs(),
            assume_online_at_start: true,
        }
    }
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            max_local_bytes: default_max_local_bytes(),
            max_dimension: default_max_dimension(),
            jpeg_quality: default_jpeg_quality(),
            bucket_prefix: default_bucket_prefix(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_remote_url(),
            api_key: None,
            bucket: default_bucket(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { http_port: default_http_port() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            sync: SyncConfig::default(),
            connectivity: ConnectivityConfig::default(),
            evidence: EvidenceConfig::default(),
            remote: RemoteConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Path of the SQLite database
    pub fn database_path(&self) -> PathBuf {
        self.store.data_dir.join("inspection.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.sync.backoff_base_ms, 2_000);
        assert!(config.connectivity.probe_enabled);
        assert_eq!(config.api.http_port, 8787);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
[sync]
max_attempts = 8
max_concurrent = 2
"#,
        )
        .unwrap();
        assert_eq!(config.sync.max_attempts, 8);
        assert_eq!(config.sync.max_concurrent, 2);
        assert_eq!(config.sync.max_concurrent_uploads, 2);
        assert_eq!(config.sync.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("inspection-sync.toml");

        let mut config = Config::default();
        config.remote.base_url = "https://records.example.org".to_string();
        config.evidence.max_dimension = 1280;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.remote.base_url, "https://records.example.org");
        assert_eq!(loaded.evidence.max_dimension, 1280);
    }
}
