//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use peernet::config::{
    LoggingConfig, NetworkConfig, NodeConfig, ReputationConfig, TransportConfig,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NodeConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_listen_address() {
    let mut config = NodeConfig::default();
    config.network.listen_address = Some("invalid_address".to_string());

    let errors = config.validate();
    assert!(!errors.is_empty(), "Should have validation errors");
    assert!(errors.iter().any(|e| e.contains("Invalid listen address")));
}

#[test]
fn test_invalid_seed_peer() {
    let mut config = NodeConfig::default();
    config.network.seed_peers = vec!["203.0.113.7:8333".to_string(), "seed.local".to_string()];

    let errors = config.validate();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("Invalid seed peer: 'seed.local'"));
}

#[test]
fn test_short_connect_timeout() {
    let mut config = NodeConfig::default();
    config.network.connect_timeout = Duration::from_millis(50);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connect timeout too short")));
}

#[test]
fn test_long_connect_timeout() {
    let mut config = NodeConfig::default();
    config.network.connect_timeout = Duration::from_secs(400);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Connect timeout too long")));
}

#[test]
fn test_handshake_timeout_follows_connect_timeout() {
    let mut config = NetworkConfig::default();
    config.connect_timeout = Duration::from_secs(7);
    assert_eq!(config.handshake_timeout(), Duration::from_secs(14));
}

#[test]
fn test_excessive_outbound_target() {
    let mut config = NodeConfig::default();
    config.network.max_outbound = 5000;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max outbound connections too high")));
}

#[test]
fn test_empty_data_dir() {
    let mut config = NodeConfig::default();
    config.network.data_dir = PathBuf::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Data directory cannot be empty")));
}

#[test]
fn test_tiny_max_message_size() {
    let mut config = NodeConfig::default();
    config.transport.max_message_size = 512;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max message size too small")));
}

#[test]
fn test_buffer_larger_than_max_message() {
    let mut config = NodeConfig::default();
    config.transport.buffer_size = 8192;
    config.transport.max_message_size = 4096;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("exceeds max message size")));
}

#[test]
fn test_zero_worker_threads() {
    let mut config = NodeConfig::default();
    config.transport.worker_threads = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Worker thread count must be greater than 0")));
}

#[test]
fn test_zero_pool_depth() {
    let mut config = NodeConfig::default();
    config.transport.buffer_pool_depth = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Buffer pool depth must be greater than 0")));
}

#[test]
fn test_snapshot_name_collides_with_lock() {
    let mut config = NodeConfig::default();
    config.reputation.snapshot_file = "lock".to_string();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("collides with the lock file")));
}

#[test]
fn test_zero_scan_passes() {
    let mut config = NodeConfig::default();
    config.reputation.scan_passes = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Scan passes must be greater than 0")));
}

#[test]
fn test_empty_app_name() {
    let mut config = NodeConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_log_to_file_without_path() {
    let mut config = NodeConfig::default();
    config.logging.log_to_file = true;
    config.logging.log_file_path = None;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_no_logging_outputs() {
    let mut config = NodeConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = NodeConfig::default();
    config.network.listen_address = Some(String::new());

    let result = config.validate_strict();
    assert!(result.is_err());

    if let Err(e) = result {
        let error_str = e.to_string();
        assert!(error_str.contains("Configuration validation failed"));
    }
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = NodeConfig::default();

    config.network.listen_address = Some(String::new());
    config.network.data_dir = PathBuf::new();
    config.transport.worker_threads = 0;
    config.reputation.max_records = 0;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(
        errors.len() >= 5,
        "Expected at least 5 errors, got {}: {:?}",
        errors.len(),
        errors
    );
}

#[test]
fn test_file_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("node.toml");

    let config = NodeConfig {
        network: NetworkConfig {
            listen_address: Some("0.0.0.0:8333".to_string()),
            max_outbound: 12,
            max_inbound: 64,
            seed_peers: vec!["203.0.113.7:8333".to_string()],
            connect_timeout: Duration::from_secs(5),
            data_dir: PathBuf::from("/var/lib/peernet"),
        },
        transport: TransportConfig {
            buffer_size: 32 * 1024,
            worker_threads: 3,
            ..TransportConfig::default()
        },
        reputation: ReputationConfig {
            max_records: 1000,
            ..ReputationConfig::default()
        },
        logging: LoggingConfig {
            app_name: "seed-node".to_string(),
            log_level: Level::DEBUG,
            json_format: true,
            ..LoggingConfig::default()
        },
    };
    assert!(config.validate().is_empty());

    config.save_to_file(&path).expect("save");
    let loaded = NodeConfig::from_file(&path).expect("load");
    assert_eq!(loaded.network.listen_address.as_deref(), Some("0.0.0.0:8333"));
    assert_eq!(loaded.network.max_outbound, 12);
    assert_eq!(loaded.network.seed_peers, config.network.seed_peers);
    assert_eq!(loaded.network.connect_timeout, Duration::from_secs(5));
    assert_eq!(loaded.transport.buffer_size, 32 * 1024);
    assert_eq!(loaded.transport.worker_threads, 3);
    assert_eq!(loaded.reputation.max_records, 1000);
    assert_eq!(loaded.logging.log_level, Level::DEBUG);
    assert!(loaded.logging.json_format);
    assert_eq!(
        loaded.snapshot_path(),
        PathBuf::from("/var/lib/peernet/peers.dat")
    );
}

#[test]
fn test_example_config_parses() {
    let example = NodeConfig::example_config();
    let parsed = NodeConfig::from_toml(&example).expect("example config parses");
    assert!(parsed.validate().is_empty());
}
