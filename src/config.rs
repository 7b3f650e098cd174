//! # Configuration Management
//!
//! Centralized configuration for the arena protocol client.
//!
//! Four sections: the legacy server connection, what the client announces
//! about itself, NAT traversal tuning and logging. Durations are written in
//! milliseconds.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables via `from_env()`
//! - Direct instantiation with defaults
//!
//! ## Example
//! ```toml
//! [server]
//! address = "203.0.113.10:6112"
//! login_timeout = 15000
//!
//! [nat]
//! mediator_address = "203.0.113.10:6113"
//! punch_attempts = 6
//! ```

use crate::core::attribute::OpaqueId;
use crate::core::packet::DEFAULT_MAX_PACKET_SIZE;
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::ClientIdentity;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Legacy server connection
    #[serde(default)]
    pub server: ServerConfig,

    /// Client identity and collaborator channels
    #[serde(default)]
    pub client: ClientConfig,

    /// NAT traversal and peer channels
    #[serde(default)]
    pub nat: NatConfig,

    /// Logging configuration
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

    /// Defaults overridden by `ARENA_*` environment variables.
    ///
    /// Unparseable numeric values are reported, not ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("ARENA_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Some(ms) = env_millis("ARENA_LOGIN_TIMEOUT_MS")? {
            config.server.login_timeout = ms;
        }

        if let Some(ms) = env_millis("ARENA_KEEPALIVE_INTERVAL_MS")? {
            config.server.keepalive_interval = ms;
        }

        if let Ok(addr) = std::env::var("ARENA_NAT_MEDIATOR") {
            config.nat.mediator_address = addr;
        }

        if let Ok(addr) = std::env::var("ARENA_NAT_BIND") {
            config.nat.bind_address = addr;
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
        errors.extend(self.client.validate());
        errors.extend(self.nat.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        into_result(self.validate())
    }
}

fn into_result(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::ConfigError(format!(
            "Configuration validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid {name} '{raw}': {e}"))),
        Err(_) => Ok(None),
    }
}

fn check_socket_addr(errors: &mut Vec<String>, label: &str, value: &str) {
    if value.is_empty() {
        errors.push(format!("{label} cannot be empty"));
    } else if value.parse::<SocketAddr>().is_err() {
        errors.push(format!(
            "Invalid {label} format: '{value}' (expected format: '203.0.113.10:6112')"
        ));
    }
}

fn check_range(
    errors: &mut Vec<String>,
    label: &str,
    value: Duration,
    min: Duration,
    max: Duration,
) {
    if value < min {
        errors.push(format!("{label} too short (minimum: {}ms)", min.as_millis()));
    } else if value > max {
        errors.push(format!("{label} too long (maximum: {}ms)", max.as_millis()));
    }
}

/// Connection to the legacy server
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server address (e.g., "203.0.113.10:6112")
    pub address: String,

    /// Timeout for the TCP connect
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Upper bound from connect until the login result arrives
    #[serde(with = "duration_serde")]
    pub login_timeout: Duration,

    /// Expected period of server keepalives
    #[serde(with = "duration_serde")]
    pub keepalive_interval: Duration,

    /// Silent keepalive intervals before the connection is declared dead
    pub keepalive_miss_threshold: u32,

    /// Largest declared packet size accepted before the stream is dropped
    pub max_packet_size: usize,

    /// Maximum number of packets waiting for the writer task
    pub outbound_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:6112"),
            connect_timeout: timeout::CONNECT_TIMEOUT,
            login_timeout: timeout::LOGIN_TIMEOUT,
            keepalive_interval: timeout::SERVER_KEEPALIVE_INTERVAL,
            keepalive_miss_threshold: 3,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            outbound_queue_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        check_socket_addr(&mut errors, "server address", &self.address);

        check_range(
            &mut errors,
            "Connect timeout",
            self.connect_timeout,
            Duration::from_millis(100),
            Duration::from_secs(300),
        );
        check_range(
            &mut errors,
            "Login timeout",
            self.login_timeout,
            Duration::from_millis(100),
            Duration::from_secs(300),
        );
        check_range(
            &mut errors,
            "Keepalive interval",
            self.keepalive_interval,
            Duration::from_millis(10),
            Duration::from_secs(3600),
        );

        if self.keepalive_miss_threshold == 0 {
            errors.push("Keepalive miss threshold must be greater than 0".to_string());
        }

        if self.max_packet_size < 64 {
            errors.push(format!(
                "Max packet size too small: {} bytes (minimum: 64)",
                self.max_packet_size
            ));
        } else if self.max_packet_size > DEFAULT_MAX_PACKET_SIZE {
            errors.push(format!(
                "Max packet size too large: {} bytes (the size field caps frames at {})",
                self.max_packet_size, DEFAULT_MAX_PACKET_SIZE
            ));
        }

        if self.outbound_queue_capacity == 0 {
            errors.push("Outbound queue capacity must be greater than 0".to_string());
        } else if self.outbound_queue_capacity > 1_000_000 {
            errors.push(format!(
                "Outbound queue capacity too large: {} (max recommended: 1,000,000)",
                self.outbound_queue_capacity
            ));
        }

        errors
    }
}

/// What the client announces, and the collaborator-facing channel sizes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Skin name sent in ClientInfo
    pub skin: String,

    /// Human-readable version sent in ClientInfo
    pub version_label: String,

    /// Numeric version sent in ClientVersion
    pub version: u32,

    /// Build string sent in ClientVersion
    pub build: String,

    /// Optional 16-byte DID as 32 hex characters, relayed as-is
    #[serde(default)]
    pub did: Option<String>,

    /// Capacity of the event channel handed to the collaborator
    pub event_buffer: usize,

    /// Capacity of the command channel behind `ClientHandle`
    pub command_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            skin: String::from("classic"),
            version_label: String::from("2.0.0"),
            version: 200,
            build: String::from("arena-protocol"),
            did: None,
            event_buffer: 256,
            command_buffer: 64,
        }
    }
}

impl ClientConfig {
    /// Parse the configured DID.
    pub fn did(&self) -> Result<Option<OpaqueId>> {
        let Some(raw) = &self.did else {
            return Ok(None);
        };
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(raw, &mut bytes)
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid DID '{raw}': {e}")))?;
        Ok(Some(OpaqueId(bytes)))
    }

    /// The announcement used by the login handshake.
    pub fn identity(&self) -> Result<ClientIdentity> {
        Ok(ClientIdentity {
            skin: self.skin.clone(),
            version_label: self.version_label.clone(),
            version: self.version,
            build: self.build.clone(),
            did: self.did()?,
        })
    }

    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.skin.is_empty() {
            errors.push("Skin name cannot be empty".to_string());
        }
        if self.version_label.len() > u16::MAX as usize || self.build.len() > u16::MAX as usize {
            errors.push("Version strings must fit in a Text attribute".to_string());
        }
        if let Err(e) = self.did() {
            errors.push(e.to_string());
        }
        if self.event_buffer == 0 {
            errors.push("Event buffer must be greater than 0".to_string());
        }
        if self.command_buffer == 0 {
            errors.push("Command buffer must be greater than 0".to_string());
        }

        errors
    }
}

/// NAT traversal, assessment and peer channel tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NatConfig {
    /// Whether peer channels may be opened at all
    pub enabled: bool,

    /// Local UDP bind address for the engine socket
    pub bind_address: String,

    /// NAT mediation server
    pub mediator_address: String,

    /// Mediator's alternate port; enables the inbound filtering test and
    /// adds a second destination to the assessment probes
    #[serde(default)]
    pub mediator_alt_address: Option<String>,

    /// Wait for one mediator reply
    #[serde(with = "duration_serde")]
    pub mediator_timeout: Duration,

    /// Resends of an unanswered mediator request
    pub mediator_retries: u32,

    /// Mapping probes sent during assessment
    pub assessment_probes: u32,

    /// Largest port step still considered predictable
    pub max_port_delta: u16,

    /// Predicted ports tried per candidate set
    pub prediction_window: u16,

    /// Wait for the remote side to answer a connect request
    #[serde(with = "duration_serde")]
    pub signal_timeout: Duration,

    /// Length of one ping round across all candidates
    #[serde(with = "duration_serde")]
    pub punch_attempt_timeout: Duration,

    /// Ping rounds before the peer is declared unreachable
    pub punch_attempts: u32,

    /// Keepalive period on an established channel
    #[serde(with = "duration_serde")]
    pub keepalive_interval: Duration,

    /// RTO before the first RTT sample
    #[serde(with = "duration_serde")]
    pub initial_rto: Duration,

    #[serde(with = "duration_serde")]
    pub min_rto: Duration,

    #[serde(with = "duration_serde")]
    pub max_rto: Duration,

    /// Clock granularity term of the RTO formula
    #[serde(with = "duration_serde")]
    pub rto_granularity: Duration,

    /// Consecutive keepalive misses before the channel is degraded
    pub degrade_after: u32,

    /// Consecutive keepalive misses before the channel is closed
    pub lost_after: u32,

    /// Pings sent to one new endpoint while re-handshaking
    pub max_rehandshake_attempts: u32,

    /// Received payloads buffered per channel
    pub channel_buffer: usize,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: String::from("0.0.0.0:0"),
            mediator_address: String::from("127.0.0.1:6113"),
            mediator_alt_address: None,
            mediator_timeout: timeout::MEDIATOR_TIMEOUT,
            mediator_retries: 2,
            assessment_probes: 2,
            max_port_delta: 8,
            prediction_window: 4,
            signal_timeout: timeout::PEER_SIGNAL_TIMEOUT,
            punch_attempt_timeout: timeout::PUNCH_ATTEMPT_TIMEOUT,
            punch_attempts: 6,
            keepalive_interval: timeout::PEER_KEEPALIVE_INTERVAL,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(10),
            rto_granularity: Duration::from_millis(10),
            degrade_after: 3,
            lost_after: 6,
            max_rehandshake_attempts: 3,
            channel_buffer: 64,
        }
    }
}

impl NatConfig {
    /// Worst-case time spent punching before giving up.
    pub fn punch_budget(&self) -> Duration {
        self.punch_attempt_timeout * self.punch_attempts
    }

    /// Validate NAT configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        check_socket_addr(&mut errors, "NAT bind address", &self.bind_address);
        check_socket_addr(&mut errors, "mediator address", &self.mediator_address);
        if let Some(alt) = &self.mediator_alt_address {
            check_socket_addr(&mut errors, "mediator alternate address", alt);
        }

        check_range(
            &mut errors,
            "Mediator timeout",
            self.mediator_timeout,
            Duration::from_millis(10),
            Duration::from_secs(60),
        );
        check_range(
            &mut errors,
            "Punch attempt timeout",
            self.punch_attempt_timeout,
            Duration::from_millis(10),
            Duration::from_secs(30),
        );
        check_range(
            &mut errors,
            "Peer keepalive interval",
            self.keepalive_interval,
            Duration::from_millis(10),
            Duration::from_secs(600),
        );

        if self.punch_attempts == 0 {
            errors.push("Punch attempts must be greater than 0".to_string());
        }
        if self.assessment_probes == 0 {
            errors.push("Assessment probes must be greater than 0".to_string());
        }
        if self.prediction_window > 64 {
            errors.push(format!(
                "Prediction window too large: {} (maximum: 64)",
                self.prediction_window
            ));
        }
        if self.min_rto > self.max_rto {
            errors.push("min_rto cannot exceed max_rto".to_string());
        }
        if self.initial_rto < self.min_rto || self.initial_rto > self.max_rto {
            errors.push("initial_rto must lie between min_rto and max_rto".to_string());
        }
        if self.degrade_after == 0 || self.lost_after <= self.degrade_after {
            errors.push(format!(
                "Miss thresholds must satisfy 0 < degrade_after ({}) < lost_after ({})",
                self.degrade_after, self.lost_after
            ));
        }
        if self.channel_buffer == 0 {
            errors.push("Channel buffer must be greater than 0".to_string());
        }

        errors
    }

    /// The NAT section alone, as a `Result`. Checked by `NatEngine::bind`.
    pub fn validate_strict(&self) -> Result<()> {
        into_result(self.validate())
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

    /// Whether to use JSON formatting for logs
    pub json_format: bool,

    /// Include thread ids in each line
    pub thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("arena-protocol"),
            log_level: Level::INFO,
            json_format: false,
            thread_ids: false,
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
        level.as_str().to_lowercase().serialize(serializer)
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(NetworkConfig::default().validate().is_empty());
        assert_eq!(NatConfig::default().punch_budget(), Duration::from_secs(3));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = NetworkConfig::from_toml(
            r#"
            [server]
            address = "10.0.0.1:6112"
            connect_timeout = 2000
            login_timeout = 5000
            keepalive_interval = 30000
            keepalive_miss_threshold = 3
            max_packet_size = 4096
            outbound_queue_capacity = 16

            [logging]
            app_name = "arena"
            log_level = "debug"
            json_format = true
            thread_ids = false
            "#,
        )
        .unwrap();

        assert_eq!(config.server.login_timeout, Duration::from_secs(5));
        assert_eq!(config.server.max_packet_size, 4096);
        assert_eq!(config.logging.log_level, Level::DEBUG);
        assert_eq!(config.nat.punch_attempts, 6);
    }

    #[test]
    fn test_example_config_round_trips() {
        let text = NetworkConfig::example_config();
        let parsed = NetworkConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.nat.keepalive_interval, Duration::from_secs(5));
        assert_eq!(parsed.logging.log_level, Level::INFO);
    }

    #[test]
    fn test_did_parsing() {
        let mut client = ClientConfig::default();
        assert_eq!(client.did().unwrap(), None);

        client.did = Some("00112233445566778899aabbccddeeff".into());
        let did = client.did().unwrap().unwrap();
        assert_eq!(did.as_bytes()[15], 0xff);

        client.did = Some("abc".into());
        assert!(client.did().is_err());
        assert_eq!(client.validate().len(), 1);
    }
}
