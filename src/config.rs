//! # Configuration Management
//!
//! Centralized configuration for the Conduit messaging library.
//!
//! This module provides structured configuration for servers and clients,
//! including connection parameters, timeouts, queue bounds, flow-control
//! watermarks, and compression settings.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-variable overrides (`CONDUIT_*`)
//!
//! ## Operational Considerations
//! - Queue bounds and watermarks drive PAUSE/RESUME flow control
//! - The heartbeat interval/timeout pair bounds failure detection latency
//! - The shared password travels as a SHA-256 hash; deploy on trusted
//!   networks or terminate TLS below this layer

use crate::error::{ConduitError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Current supported protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes identifying Conduit frames (0x434E4454 -> "CNDT")
pub const MAGIC_BYTES: [u8; 4] = [0x43, 0x4E, 0x44, 0x54];

/// Max allowed frame payload size (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Minimum payload size (bytes) before compression is attempted
pub const COMPRESSION_THRESHOLD: usize = 100;

/// Default bound for the outbound frame queue
pub const DEFAULT_SEND_QUEUE_SIZE: usize = 1000;

/// Default bound for the inbound message queue
pub const DEFAULT_RECEIVE_QUEUE_SIZE: usize = 1000;

/// Default inbound-queue fill ratio at which PAUSE is emitted
pub const DEFAULT_HIGH_WATERMARK: f64 = 0.8;

/// Default inbound-queue fill ratio at which RESUME is emitted
pub const DEFAULT_LOW_WATERMARK: f64 = 0.5;

/// Top-level configuration wrapper for TOML files carrying both roles
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ConduitConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ConduitConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ConduitError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ConduitError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ConduitError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(password) = std::env::var("CONDUIT_PASSWORD") {
            config.server.password = password.clone();
            config.client.password = password;
        }

        if let Ok(host) = std::env::var("CONDUIT_HOST") {
            config.server.host = host;
        }

        if let Ok(port) = std::env::var("CONDUIT_PORT") {
            if let Ok(val) = port.parse::<u16>() {
                config.server.port = val;
                config.client.server_port = val;
            }
        }

        if let Ok(heartbeat) = std::env::var("CONDUIT_HEARTBEAT_INTERVAL_MS") {
            if let Ok(val) = heartbeat.parse::<u64>() {
                config.server.heartbeat_interval = Duration::from_millis(val);
                config.client.heartbeat_interval = Duration::from_millis(val);
            }
        }

        if let Ok(size) = std::env::var("CONDUIT_RECEIVE_QUEUE_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                config.server.receive_queue_size = val;
                config.client.receive_queue_size = val;
            }
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

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConduitError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server name reported in AUTH_SUCCESS
    pub name: String,

    /// Server version reported in AUTH_SUCCESS
    pub version: String,

    /// Shared secret; clients present SHA-256(password)
    pub password: String,

    /// Listen host (e.g. "0.0.0.0" or "::")
    pub host: String,

    /// Listen port
    pub port: u16,

    /// Bind an IPv6 socket instead of IPv4
    pub ipv6: bool,

    /// Maximum number of concurrent authenticated connections
    pub max_connections: usize,

    /// Socket buffer size hint in bytes
    pub buffer_size: usize,

    /// Timeout for establishing a connection
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Deadline for completing the password handshake
    #[serde(with = "duration_serde")]
    pub auth_timeout: Duration,

    /// Interval between outgoing HEARTBEAT_PING frames
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Maximum tolerated silence before a connection is failed
    #[serde(with = "duration_serde")]
    pub heartbeat_timeout: Duration,

    /// Per-frame write deadline
    #[serde(with = "duration_serde")]
    pub send_timeout: Duration,

    /// Bound of the outbound frame queue
    pub send_queue_size: usize,

    /// Bound of the inbound message queue
    pub receive_queue_size: usize,

    /// Compress payloads above the threshold
    pub enable_compression: bool,

    /// Emit PAUSE/RESUME at the configured watermarks
    pub enable_backpressure: bool,

    /// Inbound fill ratio that triggers PAUSE
    pub high_watermark: f64,

    /// Inbound fill ratio that triggers RESUME
    pub low_watermark: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::from("conduit-server"),
            version: String::from(env!("CARGO_PKG_VERSION")),
            password: String::new(),
            host: String::from("0.0.0.0"),
            port: 8080,
            ipv6: false,
            max_connections: 100,
            buffer_size: 64 * 1024,
            connection_timeout: timeout::CONNECT_TIMEOUT,
            auth_timeout: timeout::AUTH_TIMEOUT,
            heartbeat_interval: timeout::KEEPALIVE_INTERVAL,
            heartbeat_timeout: timeout::KEEPALIVE_TIMEOUT,
            send_timeout: timeout::SEND_TIMEOUT,
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            receive_queue_size: DEFAULT_RECEIVE_QUEUE_SIZE,
            enable_compression: false,
            enable_backpressure: true,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.password.is_empty() {
            errors.push("Server password must be set".to_string());
        }

        if self.host.is_empty() {
            errors.push("Server host cannot be empty".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors.extend(validate_link_options(
            self.heartbeat_interval,
            self.heartbeat_timeout,
            self.send_queue_size,
            self.receive_queue_size,
            self.high_watermark,
            self.low_watermark,
        ));

        if self.auth_timeout.as_millis() < 100 {
            errors.push("Auth timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Client-side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client name reported in AUTH_REQUEST
    pub name: String,

    /// Client version reported in AUTH_REQUEST
    pub version: String,

    /// Shared secret; presented as SHA-256(password)
    pub password: String,

    /// Target server host
    pub server_host: String,

    /// Target server port
    pub server_port: u16,

    /// Connect over IPv6
    pub ipv6: bool,

    /// Socket buffer size hint in bytes
    pub buffer_size: usize,

    /// Timeout for the TCP connect attempt
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Deadline for completing the password handshake
    #[serde(with = "duration_serde")]
    pub auth_timeout: Duration,

    /// Default deadline for RPC calls
    #[serde(with = "duration_serde")]
    pub rpc_timeout: Duration,

    /// Per-frame write deadline
    #[serde(with = "duration_serde")]
    pub send_timeout: Duration,

    /// Interval between outgoing HEARTBEAT_PING frames
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Maximum tolerated silence before the connection is failed
    #[serde(with = "duration_serde")]
    pub heartbeat_timeout: Duration,

    /// Bound of the outbound frame queue
    pub send_queue_size: usize,

    /// Bound of the inbound message queue
    pub receive_queue_size: usize,

    /// Compress payloads above the threshold
    pub enable_compression: bool,

    /// Emit PAUSE/RESUME at the configured watermarks
    pub enable_backpressure: bool,

    /// Inbound fill ratio that triggers PAUSE
    pub high_watermark: f64,

    /// Inbound fill ratio that triggers RESUME
    pub low_watermark: f64,

    /// Automatically reconnect after a lost connection
    pub reconnect_enabled: bool,

    /// Maximum reconnect attempts; 0 means unlimited
    pub reconnect_attempts: u32,

    /// Initial delay before the first reconnect attempt
    #[serde(with = "duration_serde")]
    pub reconnect_delay: Duration,

    /// Backoff multiplier applied per attempt
    pub reconnect_delay_multiplier: f64,

    /// Upper bound on the reconnect delay
    #[serde(with = "duration_serde")]
    pub reconnect_delay_max: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: String::from("conduit-client"),
            version: String::from(env!("CARGO_PKG_VERSION")),
            password: String::new(),
            server_host: String::from("127.0.0.1"),
            server_port: 8080,
            ipv6: false,
            buffer_size: 64 * 1024,
            connect_timeout: timeout::CONNECT_TIMEOUT,
            auth_timeout: timeout::AUTH_TIMEOUT,
            rpc_timeout: timeout::RPC_TIMEOUT,
            send_timeout: timeout::SEND_TIMEOUT,
            heartbeat_interval: timeout::KEEPALIVE_INTERVAL,
            heartbeat_timeout: timeout::KEEPALIVE_TIMEOUT,
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            receive_queue_size: DEFAULT_RECEIVE_QUEUE_SIZE,
            enable_compression: false,
            enable_backpressure: true,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
            reconnect_enabled: true,
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            reconnect_delay_multiplier: 2.0,
            reconnect_delay_max: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.password.is_empty() {
            errors.push("Client password must be set".to_string());
        }

        if self.server_host.is_empty() {
            errors.push("Server host cannot be empty".to_string());
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        }

        if self.rpc_timeout.as_millis() < 100 {
            errors.push("RPC timeout too short (minimum: 100ms)".to_string());
        }

        errors.extend(validate_link_options(
            self.heartbeat_interval,
            self.heartbeat_timeout,
            self.send_queue_size,
            self.receive_queue_size,
            self.high_watermark,
            self.low_watermark,
        ));

        if self.reconnect_enabled {
            if self.reconnect_delay.as_millis() < 10 {
                errors.push("Reconnect delay too short (minimum: 10ms)".to_string());
            }
            if self.reconnect_delay_multiplier < 1.0 {
                errors.push("Reconnect delay multiplier must be >= 1.0".to_string());
            }
            if self.reconnect_delay_max < self.reconnect_delay {
                errors.push("Max reconnect delay must be >= initial delay".to_string());
            }
        }

        errors
    }
}

/// Checks shared by both roles for queue and heartbeat tuning
fn validate_link_options(
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    send_queue_size: usize,
    receive_queue_size: usize,
    high_watermark: f64,
    low_watermark: f64,
) -> Vec<String> {
    let mut errors = Vec::new();

    if heartbeat_interval.as_millis() < 100 {
        errors.push("Heartbeat interval too short (minimum: 100ms)".to_string());
    } else if heartbeat_interval.as_secs() > 3600 {
        errors.push("Heartbeat interval too long (maximum: 1 hour)".to_string());
    }

    if heartbeat_timeout <= heartbeat_interval {
        errors.push("Heartbeat timeout must exceed the heartbeat interval".to_string());
    }

    if send_queue_size == 0 {
        errors.push("Send queue size must be greater than 0".to_string());
    }

    if receive_queue_size == 0 {
        errors.push("Receive queue size must be greater than 0".to_string());
    }

    if !(0.0..=1.0).contains(&high_watermark) || !(0.0..=1.0).contains(&low_watermark) {
        errors.push("Watermarks must be ratios in [0.0, 1.0]".to_string());
    } else if low_watermark >= high_watermark {
        errors.push("Low watermark must be below the high watermark".to_string());
    }

    errors
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
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
            app_name: String::from("conduit"),
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

/// Helper module for Duration serialization/deserialization (milliseconds)
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
