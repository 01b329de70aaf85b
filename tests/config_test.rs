//! Config loading and defaults integration tests

use inspection_sync::config::Config;
use inspection_sync::error::ConfigError;
use tempfile::TempDir;

/// A complete file overrides every default
#[test]
fn test_config_with_all_fields() {
    let toml_str = r#"
[store]
data_dir = "/var/lib/inspection"

[sync]
max_attempts = 8
backoff_base_ms = 500
backoff_max_ms = 120000
jitter = false
max_concurrent = 6
max_concurrent_uploads = 1
request_timeout_ms = 10000
sync_interval_ms = 15000

[connectivity]
probe_enabled = false
stale_after_secs = 30
assume_online_at_start = false

[evidence]
max_local_bytes = 1048576
max_dimension = 1280
jpeg_quality = 70
bucket_prefix = "sites"

[remote]
base_url = "https://records.example.org"
api_key = "k-123"
bucket = "evidence"

[api]
http_port = 9000
"#;

    let config: Config = toml::from_str(toml_str).expect("valid config");

    assert_eq!(config.store.data_dir.to_str(), Some("/var/lib/inspection"));
    assert_eq!(config.sync.max_attempts, 8);
    assert_eq!(config.sync.backoff_base_ms, 500);
    assert!(!config.sync.jitter);
    assert_eq!(config.sync.max_concurrent_uploads, 1);
    assert_eq!(config.sync.request_timeout().as_secs(), 10);
    assert_eq!(config.sync.sync_interval().as_secs(), 15);
    assert!(!config.connectivity.probe_enabled);
    assert!(!config.connectivity.assume_online_at_start);
    assert_eq!(config.evidence.max_dimension, 1280);
    assert_eq!(config.evidence.bucket_prefix, "sites");
    assert_eq!(config.remote.api_key.as_deref(), Some("k-123"));
    assert_eq!(config.api.http_port, 9000);
    assert_eq!(
        config.database_path(),
        std::path::PathBuf::from("/var/lib/inspection/inspection.db")
    );
}

#[test]
fn test_config_partial_overrides() {
    let config: Config = toml::from_str(
        r#"
[remote]
base_url = "https://staging.example.org"
"#,
    )
    .unwrap();

    assert_eq!(config.remote.base_url, "https://staging.example.org");
    assert_eq!(config.remote.bucket, "audit-evidence");
    assert!(config.remote.api_key.is_none());
    assert_eq!(config.sync.max_concurrent, 4);
    assert_eq!(config.evidence.jpeg_quality, 80);
}

#[test]
fn test_save_then_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("inspection-sync.toml");

    let mut config = Config::default();
    config.sync.max_attempts = 9;
    config.remote.base_url = "https://records.example.org".into();
    config.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded.sync.max_attempts, 9);
    assert_eq!(loaded.remote.base_url, "https://records.example.org");
    assert_eq!(loaded.api.http_port, config.api.http_port);
}

#[test]
fn test_config_missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let result = Config::load(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn test_invalid_toml_returns_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[sync\nmax_attempts = ").unwrap();

    assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
}

#[test]
fn test_wrong_type_is_rejected() {
    let result: Result<Config, _> = toml::from_str(
        r#"
[sync]
max_attempts = "many"
"#,
    );
    assert!(result.is_err());
}
