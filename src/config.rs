//! # Configuration Management
//!
//! Centralized configuration for a node.
//!
//! [`NodeConfig`] groups four sections: `network` (addresses, connection
//! limits, timeouts), `transport` (buffers, worker pool, event loop),
//! `reputation` (cool-downs, persistence) and `logging`.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - `PEERNET_*` environment overrides via `from_env()`
//!
//! Durations are written as milliseconds.

use crate::error::{ProtocolError, Result};
use crate::reputation::record::ReputationPolicy;
use crate::utils::buffer_pool::DEFAULT_POOL_DEPTH;
use crate::utils::lock_file::LOCK_FILE_NAME;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Default per-connection read and write buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default largest accepted envelope, also the pooled buffer size
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default admission target for outbound connections
pub const DEFAULT_MAX_OUTBOUND: usize = 8;

/// Default cap on accepted connections
pub const DEFAULT_MAX_INBOUND: usize = 117;

/// Default number of records kept in the snapshot
pub const DEFAULT_MAX_RECORDS: usize = 4096;

/// Worker threads used when none are configured: `2 * cpus + 1`
pub fn default_worker_threads() -> usize {
    2 * num_cpus::get() + 1
}

/// Main node configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub reputation: ReputationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NodeConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `PEERNET_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value.parse::<T>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid value for {key}: '{value}'"))
            })
        }

        if let Some(addr) = var("PEERNET_LISTEN_ADDRESS") {
            self.network.listen_address = (!addr.is_empty()).then_some(addr);
        }
        if let Some(seeds) = var("PEERNET_SEED_PEERS") {
            self.network.seed_peers = seeds
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = var("PEERNET_MAX_OUTBOUND") {
            self.network.max_outbound = parse("PEERNET_MAX_OUTBOUND", &v)?;
        }
        if let Some(v) = var("PEERNET_MAX_INBOUND") {
            self.network.max_inbound = parse("PEERNET_MAX_INBOUND", &v)?;
        }
        if let Some(v) = var("PEERNET_CONNECT_TIMEOUT_MS") {
            self.network.connect_timeout =
                Duration::from_millis(parse("PEERNET_CONNECT_TIMEOUT_MS", &v)?);
        }
        if let Some(dir) = var("PEERNET_DATA_DIR") {
            self.network.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = var("PEERNET_WORKER_THREADS") {
            self.transport.worker_threads = parse("PEERNET_WORKER_THREADS", &v)?;
        }
        if let Some(v) = var("PEERNET_MAX_MESSAGE_SIZE") {
            self.transport.max_message_size = parse("PEERNET_MAX_MESSAGE_SIZE", &v)?;
        }
        if let Some(v) = var("PEERNET_MAX_RECORDS") {
            self.reputation.max_records = parse("PEERNET_MAX_RECORDS", &v)?;
        }
        if let Some(level) = var("PEERNET_LOG_LEVEL") {
            self.logging.log_level = parse("PEERNET_LOG_LEVEL", &level)?;
        }
        Ok(())
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.network.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.reputation.validate());
        errors.extend(self.logging.validate());

        if self.transport.buffer_size > self.transport.max_message_size {
            errors.push(format!(
                "Buffer size {} exceeds max message size {}",
                self.transport.buffer_size, self.transport.max_message_size
            ));
        }
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// Path of the single-instance lock file
    pub fn lock_path(&self) -> PathBuf {
        self.network.data_dir.join(LOCK_FILE_NAME)
    }

    /// Path of the reputation snapshot
    pub fn snapshot_path(&self) -> PathBuf {
        self.network.data_dir.join(&self.reputation.snapshot_file)
    }
}

/// Addresses, connection limits and connection timeouts
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address for inbound connections (e.g., "0.0.0.0:8333"); none disables listening
    pub listen_address: Option<String>,

    /// Admission target for outbound connections
    pub max_outbound: usize,

    /// Maximum number of accepted connections
    pub max_inbound: usize,

    /// Endpoints announced to the reputation store at start ("host:port")
    pub seed_peers: Vec<String>,

    /// Time allowed for an outbound connect to complete
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Directory holding the lock file and the reputation snapshot
    pub data_dir: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            max_outbound: DEFAULT_MAX_OUTBOUND,
            max_inbound: DEFAULT_MAX_INBOUND,
            seed_peers: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            data_dir: PathBuf::from("data"),
        }
    }
}

impl NetworkConfig {
    /// Time allowed for the version handshake, twice the connect timeout
    pub fn handshake_timeout(&self) -> Duration {
        self.connect_timeout * 2
    }

    /// Validate network configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(addr) = &self.listen_address {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                errors.push(format!(
                    "Invalid listen address format: '{addr}' (expected format: '0.0.0.0:8333')"
                ));
            }
        }

        for seed in &self.seed_peers {
            if seed.parse::<std::net::SocketAddr>().is_err() {
                errors.push(format!(
                    "Invalid seed peer: '{seed}' (expected format: '203.0.113.7:8333')"
                ));
            }
        }

        if self.max_outbound > 1024 {
            errors.push(format!(
                "Max outbound connections too high: {} (maximum: 1024)",
                self.max_outbound
            ));
        }

        if self.max_inbound > 100_000 {
            errors.push(format!(
                "Max inbound connections very high: {} (ensure system resources can support this)",
                self.max_inbound
            ));
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        if self.data_dir.as_os_str().is_empty() {
            errors.push("Data directory cannot be empty".to_string());
        }

        errors
    }
}

/// Buffers, worker pool and event loop tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Per-connection local read and write buffer size in bytes
    pub buffer_size: usize,

    /// Largest accepted envelope in bytes; pooled buffers have this size
    pub max_message_size: usize,

    /// Idle pooled buffers kept for reuse
    pub buffer_pool_depth: usize,

    /// Worker threads running connection tasks
    pub worker_threads: usize,

    /// Upper bound on one readiness wait
    #[serde(with = "duration_serde")]
    pub poll_timeout: Duration,

    /// Initial delay between checks while waiting for in-flight tasks at shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_backoff: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            buffer_pool_depth: DEFAULT_POOL_DEPTH,
            worker_threads: default_worker_threads(),
            poll_timeout: Duration::from_millis(250),
            shutdown_backoff: Duration::from_secs(1),
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.buffer_size < 1024 {
            errors.push("Buffer size too small (minimum: 1 KB)".to_string());
        }

        if self.max_message_size < 1024 {
            errors.push("Max message size too small (minimum: 1 KB)".to_string());
        } else if self.max_message_size > u32::MAX as usize {
            errors.push(format!(
                "Max message size too large: {} bytes (maximum: {})",
                self.max_message_size,
                u32::MAX
            ));
        }

        if self.buffer_pool_depth == 0 {
            errors.push("Buffer pool depth must be greater than 0".to_string());
        }

        if self.worker_threads == 0 {
            errors.push("Worker thread count must be greater than 0".to_string());
        } else if self.worker_threads > 1024 {
            errors.push(format!(
                "Worker thread count too high: {} (maximum: 1024)",
                self.worker_threads
            ));
        }

        if self.poll_timeout.as_millis() < 1 {
            errors.push("Poll timeout too short (minimum: 1ms)".to_string());
        } else if self.poll_timeout.as_secs() > 10 {
            errors.push("Poll timeout too long (maximum: 10s)".to_string());
        }

        if self.shutdown_backoff.as_millis() < 10 {
            errors.push("Shutdown back-off too short (minimum: 10ms)".to_string());
        }

        errors
    }
}

/// Reputation store timing and persistence
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Records kept in the snapshot
    pub max_records: usize,

    /// Subtracted from now to cap timestamps advertised by peers
    #[serde(with = "duration_serde")]
    pub network_penalty: Duration,

    /// Cool-down after a failed connection
    #[serde(with = "duration_serde")]
    pub fail_timeout: Duration,

    /// Cool-down after a connection attempt
    #[serde(with = "duration_serde")]
    pub attempt_timeout: Duration,

    /// Passes over the selection slots before candidate scanning gives up
    pub scan_passes: u32,

    /// Interval between periodic snapshot saves
    #[serde(with = "duration_serde")]
    pub save_interval: Duration,

    /// Snapshot file name inside the data directory
    pub snapshot_file: String,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        let policy = ReputationPolicy::default();
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            network_penalty: Duration::from_secs(u64::from(policy.network_penalty)),
            fail_timeout: Duration::from_secs(u64::from(policy.fail_timeout)),
            attempt_timeout: Duration::from_secs(u64::from(policy.attempt_timeout)),
            scan_passes: 5,
            save_interval: Duration::from_secs(300),
            snapshot_file: String::from("peers.dat"),
        }
    }
}

impl ReputationConfig {
    /// Timing policy in whole seconds
    pub fn policy(&self) -> ReputationPolicy {
        fn secs(d: Duration) -> u32 {
            u32::try_from(d.as_secs()).unwrap_or(u32::MAX)
        }
        ReputationPolicy {
            network_penalty: secs(self.network_penalty),
            fail_timeout: secs(self.fail_timeout),
            attempt_timeout: secs(self.attempt_timeout),
        }
    }

    /// Validate reputation configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_records == 0 {
            errors.push("Max records must be greater than 0".to_string());
        }

        if self.scan_passes == 0 {
            errors.push("Scan passes must be greater than 0".to_string());
        }

        if self.save_interval.as_secs() < 1 {
            errors.push("Save interval too short (minimum: 1s)".to_string());
        }

        if self.snapshot_file.is_empty() {
            errors.push("Snapshot file name cannot be empty".to_string());
        } else if self.snapshot_file == LOCK_FILE_NAME {
            errors.push(format!(
                "Snapshot file name '{LOCK_FILE_NAME}' collides with the lock file"
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("peernet"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
