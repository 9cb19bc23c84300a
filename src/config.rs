//! # Configuration Management
//!
//! Centralized configuration for the tiered link server and client.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables via `from_env()` (`TIERED_LINK_*`)
//! - Direct instantiation with defaults, optionally through `default_with_overrides()`
//!
//! The retry table and worker pool sizing are deployment settings, not business rules;
//! every value here can be changed per deployment and is checked by `validate()`.

use crate::core::serialization::SerializationFormat;
use crate::error::{ProtocolError, Result};
use crate::protocol::message::Priority;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Current protocol version written into every header
pub const PROTOCOL_VERSION: u8 = 1;

/// Max allowed framed packet size (header + payload + checksum)
pub const MAX_PACKET_SIZE: usize = 4 * 1024 * 1024;

/// Default file chunk size (1 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub pools: PoolsConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
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

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("TIERED_LINK_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("TIERED_LINK_TLS_ADDRESS") {
            config.server.tls_address = Some(addr);
        }

        if let Ok(path) = std::env::var("TIERED_LINK_CERT_PATH") {
            config.server.cert_path = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("TIERED_LINK_KEY_PATH") {
            config.server.key_path = Some(PathBuf::from(path));
        }

        if let Ok(root) = std::env::var("TIERED_LINK_OUTPUT_ROOT") {
            config.server.output_root = PathBuf::from(root);
        }

        if let Ok(timeout) = std::env::var("TIERED_LINK_HEARTBEAT_TIMEOUT_MS") {
            let val = timeout.parse::<u64>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid TIERED_LINK_HEARTBEAT_TIMEOUT_MS: {e}"))
            })?;
            config.server.heartbeat_timeout = Duration::from_millis(val);
        }

        if let Ok(size) = std::env::var("TIERED_LINK_CHUNK_SIZE") {
            let val = size.parse::<usize>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid TIERED_LINK_CHUNK_SIZE: {e}"))
            })?;
            config.transfer.chunk_size = val;
        }

        Ok(config)
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
        errors.extend(self.server.validate());
        errors.extend(self.pools.validate());
        errors.extend(self.retry.validate());
        errors.extend(self.transfer.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());

        // A full chunk frame must fit in a packet
        if self.transfer.chunk_size + CHUNK_FRAME_OVERHEAD > self.transport.max_packet_size {
            errors.push(format!(
                "Chunk size {} does not fit in max packet size {} (needs {} bytes of headroom)",
                self.transfer.chunk_size, self.transport.max_packet_size, CHUNK_FRAME_OVERHEAD
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
}

/// Headroom for header, checksum and chunk metadata around raw chunk bytes
const CHUNK_FRAME_OVERHEAD: usize = 64 * 1024;

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Plain TCP listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// TLS listen address, if TLS is enabled
    #[serde(default)]
    pub tls_address: Option<String>,

    /// PEM certificate chain for the TLS listener
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// PEM PKCS#8 private key for the TLS listener
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Root directory under which received files are stored, one subdirectory per client
    pub output_root: PathBuf,

    /// Clients silent for longer than this are disconnected
    #[serde(with = "duration_serde")]
    pub heartbeat_timeout: Duration,

    /// How often the heartbeat monitor runs
    #[serde(with = "duration_serde")]
    pub heartbeat_check_interval: Duration,

    /// Upper bound for a single frame write
    #[serde(with = "duration_serde")]
    pub send_timeout: Duration,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Interval of the periodic monitoring report
    #[serde(with = "duration_serde")]
    pub monitoring_interval: Duration,

    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            tls_address: None,
            cert_path: None,
            key_path: None,
            output_root: PathBuf::from("received"),
            heartbeat_timeout: timeout::HEARTBEAT_TIMEOUT,
            heartbeat_check_interval: timeout::KEEPALIVE_INTERVAL,
            send_timeout: timeout::DEFAULT_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            monitoring_interval: Duration::from_secs(30),
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if let Some(tls) = &self.tls_address {
            if tls.parse::<std::net::SocketAddr>().is_err() {
                errors.push(format!("Invalid TLS address format: '{tls}'"));
            }
            if self.cert_path.is_none() || self.key_path.is_none() {
                errors.push("TLS address requires both cert_path and key_path".to_string());
            }
        }

        if self.output_root.as_os_str().is_empty() {
            errors.push("Output root cannot be empty".to_string());
        }

        if self.heartbeat_timeout.as_millis() < 100 {
            errors.push("Heartbeat timeout too short (minimum: 100ms)".to_string());
        }

        if self.heartbeat_check_interval.as_millis() < 10 {
            errors.push("Heartbeat check interval too short (minimum: 10ms)".to_string());
        } else if self.heartbeat_check_interval > self.heartbeat_timeout {
            errors.push("Heartbeat check interval cannot exceed heartbeat timeout".to_string());
        }

        if self.send_timeout.as_millis() < 10 {
            errors.push("Send timeout too short (minimum: 10ms)".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.monitoring_interval.as_millis() < 100 {
            errors.push("Monitoring interval too short (minimum: 100ms)".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        }

        errors
    }
}

/// Sizing for one priority worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Workers kept alive at all times
    pub min_workers: usize,

    /// Upper bound on workers
    pub max_workers: usize,

    /// Queue depth above which the monitor adds a worker
    pub scale_up_threshold: usize,

    /// How often the monitor samples queue depth
    #[serde(with = "duration_serde")]
    pub monitor_interval: Duration,

    /// Idle time after which a surplus worker exits
    #[serde(with = "duration_serde")]
    pub idle_cooldown: Duration,
}

impl PoolSettings {
    pub fn new(min_workers: usize, max_workers: usize, scale_up_threshold: usize) -> Self {
        Self {
            min_workers,
            max_workers,
            scale_up_threshold,
            monitor_interval: Duration::from_millis(100),
            idle_cooldown: Duration::from_secs(5),
        }
    }

    pub fn validate(&self, name: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.min_workers == 0 {
            errors.push(format!("{name}: min_workers must be at least 1"));
        }
        if self.max_workers < self.min_workers {
            errors.push(format!(
                "{name}: max_workers ({}) cannot be less than min_workers ({})",
                self.max_workers, self.min_workers
            ));
        }
        if self.max_workers > 1024 {
            errors.push(format!("{name}: max_workers too large (maximum: 1024)"));
        }
        if self.monitor_interval.as_millis() < 10 {
            errors.push(format!("{name}: monitor interval too short (minimum: 10ms)"));
        }
        if self.idle_cooldown < self.monitor_interval {
            errors.push(format!(
                "{name}: idle cooldown cannot be shorter than the monitor interval"
            ));
        }
        errors
    }
}

/// Pool sizing for the six fixed pools
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolsConfig {
    pub incoming_high: PoolSettings,
    pub incoming_medium: PoolSettings,
    pub incoming_low: PoolSettings,
    pub outgoing_high: PoolSettings,
    pub outgoing_medium: PoolSettings,
    pub outgoing_low: PoolSettings,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            incoming_high: PoolSettings::new(2, 8, 32),
            incoming_medium: PoolSettings::new(1, 4, 64),
            incoming_low: PoolSettings::new(1, 2, 128),
            outgoing_high: PoolSettings::new(2, 8, 32),
            outgoing_medium: PoolSettings::new(1, 4, 64),
            outgoing_low: PoolSettings::new(1, 2, 128),
        }
    }
}

impl PoolsConfig {
    pub fn incoming(&self, priority: Priority) -> PoolSettings {
        match priority {
            Priority::High => self.incoming_high,
            Priority::Medium => self.incoming_medium,
            Priority::Low => self.incoming_low,
        }
    }

    pub fn outgoing(&self, priority: Priority) -> PoolSettings {
        match priority {
            Priority::High => self.outgoing_high,
            Priority::Medium => self.outgoing_medium,
            Priority::Low => self.outgoing_low,
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.incoming_high.validate("incoming_high"));
        errors.extend(self.incoming_medium.validate("incoming_medium"));
        errors.extend(self.incoming_low.validate("incoming_low"));
        errors.extend(self.outgoing_high.validate("outgoing_high"));
        errors.extend(self.outgoing_medium.validate("outgoing_medium"));
        errors.extend(self.outgoing_low.validate("outgoing_low"));
        errors
    }
}

/// Retry behaviour for one priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Total send attempts before the message moves to the resume queue
    pub max_retries: u32,

    /// Delay before each re-attempt
    #[serde(with = "duration_serde")]
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
        }
    }
}

/// Retry table keyed by priority
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    pub high: RetryPolicy,
    pub medium: RetryPolicy,
    pub low: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            high: RetryPolicy::new(3, Duration::from_millis(100)),
            medium: RetryPolicy::new(3, Duration::from_millis(500)),
            low: RetryPolicy::new(2, Duration::from_secs(2)),
        }
    }
}

impl RetryConfig {
    /// Policy lookup; a pure function of priority
    pub fn policy(&self, priority: Priority) -> RetryPolicy {
        match priority {
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for priority in Priority::ALL {
            let policy = self.policy(priority);
            if policy.max_retries == 0 {
                errors.push(format!("Retry policy {priority}: max_retries must be at least 1"));
            }
            if policy.interval.as_secs() > 300 {
                errors.push(format!(
                    "Retry policy {priority}: interval too long (maximum: 300s)"
                ));
            }
        }
        errors
    }
}

/// File transfer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferConfig {
    /// Size of each file chunk in bytes
    pub chunk_size: usize,

    /// How long a sender waits for outstanding chunk acknowledgements per round
    #[serde(with = "duration_serde")]
    pub ack_timeout: Duration,

    /// Re-send rounds for unacknowledged chunks before giving up
    pub max_resend_rounds: u32,

    /// Directory name (under each client's output root) where chunks are staged
    pub staging_dir_name: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            ack_timeout: Duration::from_secs(10),
            max_resend_rounds: 3,
            staging_dir_name: String::from(".staging"),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.chunk_size == 0 {
            errors.push("Chunk size cannot be 0".to_string());
        }
        if self.ack_timeout.as_millis() < 10 {
            errors.push("Ack timeout too short (minimum: 10ms)".to_string());
        }
        if self.staging_dir_name.is_empty()
            || self.staging_dir_name.contains('/')
            || self.staging_dir_name.contains('\\')
        {
            errors.push("Staging dir name must be a single non-empty path component".to_string());
        }
        errors
    }
}

/// Wire-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum framed packet size in bytes
    pub max_packet_size: usize,

    /// Header versions accepted on decode
    pub supported_versions: Vec<u8>,

    /// Payload serialization format
    #[serde(default)]
    pub serialization_format: SerializationFormat,

    /// Number of encode buffers kept warm
    pub buffer_pool_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            supported_versions: vec![PROTOCOL_VERSION],
            serialization_format: SerializationFormat::Bincode,
            buffer_pool_size: 32,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_packet_size < 1024 {
            errors.push("Max packet size too small (minimum: 1 KB)".to_string());
        } else if self.max_packet_size > u32::MAX as usize {
            errors.push("Max packet size cannot exceed the 32-bit length field".to_string());
        }

        if self.supported_versions.is_empty() {
            errors.push("At least one supported protocol version is required".to_string());
        } else if !self.supported_versions.contains(&PROTOCOL_VERSION) {
            errors.push(format!(
                "Supported versions must include the current version {PROTOCOL_VERSION}"
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
            app_name: String::from("tiered-link"),
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
                if let Some(parent) = Path::new(path).parent() {
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
