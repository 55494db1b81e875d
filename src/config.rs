//! # Configuration Management
//!
//! Protocol constants and the structured configuration for a link backend.
//!
//! The constants are the canonical policy: the frame delimiter, the service
//! identifier, and the retry bounds. [`LinkConfig`] carries them as defaults
//! so an embedding application can tune timeouts and backoff without
//! touching the protocol itself.
//!
//! ## Configuration Sources
//! - Direct instantiation with defaults
//! - TOML strings or files via `from_toml()` / `from_file()`, at the
//!   embedding application's choice (the link layer never reads files itself)
//!
//! ## Timeouts
//! The wire protocol specifies no timeouts. Connect, write and read timeouts
//! are bounded here so a silent peer cannot pin a worker forever.

use crate::error::{LinkError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;
use tracing::Level;
use uuid::Uuid;

/// Marker separating the payload from the serialized message inside a frame
pub const DELIMITER: &[u8] = b"Bluetooth Nonce";

/// Well-known service identifier every peer listens under
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x69fd_a304_da91_477b_b988_28d4_9ca9_9cf5);

/// Service name advertised with the listening endpoint
pub const SERVICE_NAME: &str = "KDE Connect";

/// Version advertised in identity announcements
pub const PROTOCOL_VERSION: u32 = 5;

/// Connection attempts an outbound session makes before reporting failure
pub const OUTBOUND_CONNECT_ATTEMPTS: u32 = 6;

/// Leading attempts that use service lookup; later attempts use fallback channels
pub const SERVICE_LOOKUP_ATTEMPTS: u32 = 2;

/// Channels tried directly once service lookup has failed. Channels 0 and 1
/// are never usable for an application service.
pub const FALLBACK_CHANNELS: RangeInclusive<u8> = 2..=29;

/// Connection attempts per bonded peer when announcing identity
pub const ANNOUNCE_CONNECT_ATTEMPTS: u32 = 3;

/// Max accepted frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Main configuration structure for a link backend
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LinkConfig {
    /// Service record and frame limits
    #[serde(default)]
    pub service: ServiceConfig,

    /// Outbound session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Bonding announcer settings
    #[serde(default)]
    pub announce: AnnounceConfig,

    /// Listener loop and acceptor settings
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl LinkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| LinkError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| LinkError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| LinkError::ConfigError(format!("Failed to parse TOML: {e}")))
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
        errors.extend(self.service.validate());
        errors.extend(self.session.validate());
        errors.extend(self.announce.validate());
        errors.extend(self.listener.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LinkError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Service record advertised by the listener and looked up by outbound sessions
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Service identifier
    pub uuid: Uuid,

    /// Human readable service name
    pub name: String,

    /// Largest frame the acceptor will buffer
    pub max_frame_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            uuid: SERVICE_UUID,
            name: String::from(SERVICE_NAME),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ServiceConfig {
    /// Validate service configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.uuid.is_nil() {
            errors.push("Service UUID cannot be nil".to_string());
        }

        if self.name.is_empty() {
            errors.push("Service name cannot be empty".to_string());
        }

        // A frame must at least hold the delimiter and a minimal message
        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > 256 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum: 256 MB)",
                self.max_frame_size
            ));
        }

        errors
    }
}

/// Outbound session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Total connection attempts before a send reports failure
    pub connect_attempts: u32,

    /// Leading attempts that use service lookup instead of a fallback channel
    pub service_lookup_attempts: u32,

    /// Timeout for a single connection attempt
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Timeout for writing one whole frame
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,

    /// Timeout for fetching a payload over a secondary channel
    #[serde(with = "duration_serde")]
    pub payload_timeout: Duration,

    /// Delay after the first failed attempt; grows linearly per attempt
    #[serde(with = "duration_serde")]
    pub retry_backoff: Duration,

    /// Upper bound for the delay between attempts
    #[serde(with = "duration_serde")]
    pub max_retry_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_attempts: OUTBOUND_CONNECT_ATTEMPTS,
            service_lookup_attempts: SERVICE_LOOKUP_ATTEMPTS,
            connect_timeout: timeout::CONNECT_TIMEOUT,
            write_timeout: timeout::DEFAULT_TIMEOUT,
            payload_timeout: timeout::DEFAULT_TIMEOUT,
            retry_backoff: Duration::from_millis(200),
            max_retry_backoff: Duration::from_secs(2),
        }
    }
}

impl SessionConfig {
    /// Delay to wait after `attempt` (1-based) failed
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(attempt)
            .min(self.max_retry_backoff)
    }

    /// Validate session configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.connect_attempts == 0 {
            errors.push("Connect attempts must be greater than 0".to_string());
        } else if self.connect_attempts > 30 {
            errors.push(format!(
                "Connect attempts too high: {} (maximum: 30)",
                self.connect_attempts
            ));
        }

        if self.service_lookup_attempts > self.connect_attempts {
            errors.push("Service lookup attempts cannot exceed connect attempts".to_string());
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        if self.write_timeout.as_millis() < 100 {
            errors.push("Write timeout too short (minimum: 100ms)".to_string());
        }

        if self.payload_timeout.as_millis() < 100 {
            errors.push("Payload timeout too short (minimum: 100ms)".to_string());
        }

        if self.retry_backoff > self.max_retry_backoff {
            errors.push("Retry backoff cannot exceed max retry backoff".to_string());
        }

        if self.max_retry_backoff.as_secs() > 60 {
            errors.push("Max retry backoff too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Bonding announcer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnnounceConfig {
    /// Connection attempts per bonded peer
    pub attempts: u32,

    /// Delay between attempts to the same peer
    #[serde(with = "duration_serde")]
    pub retry_backoff: Duration,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            attempts: ANNOUNCE_CONNECT_ATTEMPTS,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl AnnounceConfig {
    /// Validate announcer configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.attempts == 0 {
            errors.push("Announce attempts must be greater than 0".to_string());
        } else if self.attempts > 10 {
            errors.push(format!(
                "Announce attempts too high: {} (maximum: 10)",
                self.attempts
            ));
        }

        if self.retry_backoff.as_secs() > 60 {
            errors.push("Announce retry backoff too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Listener loop and acceptor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Timeout for reading one whole inbound frame
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,

    /// Pause after a failed listen or accept before the next iteration
    #[serde(with = "duration_serde")]
    pub error_backoff: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            read_timeout: timeout::DEFAULT_TIMEOUT,
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl ListenerConfig {
    /// Validate listener configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.read_timeout.as_millis() < 100 {
            errors.push("Read timeout too short (minimum: 100ms)".to_string());
        } else if self.read_timeout.as_secs() > 600 {
            errors.push("Read timeout too long (maximum: 600s)".to_string());
        }

        if self.error_backoff.as_secs() > 60 {
            errors.push("Listener error backoff too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Settings for [`init_logging`](crate::utils::logging::init_logging)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Name recorded when logging starts
    pub app_name: String,

    /// Default filter level; `RUST_LOG` overrides it
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    pub log_to_console: bool,

    /// Also write to `log_file_path` through a non-blocking appender
    pub log_to_file: bool,

    pub log_file_path: Option<String>,

    /// JSON lines instead of the plain formatter
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("rfcomm-link"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match self.app_name.len() {
            0 => errors.push("Application name cannot be empty".to_string()),
            len if len > 64 => errors.push(format!(
                "Application name too long: {len} characters (maximum: 64)"
            )),
            _ => {}
        }

        match (self.log_to_file, self.log_file_path.as_deref()) {
            (true, None) => {
                errors.push("log_file_path must be specified when log_to_file is true".to_string())
            }
            (true, Some(path)) => {
                let missing_dir = Path::new(path)
                    .parent()
                    .filter(|dir| !dir.as_os_str().is_empty() && !dir.exists());
                if let Some(dir) = missing_dir {
                    errors.push(format!("Log file directory does not exist: {}", dir.display()));
                }
            }
            (false, _) => {}
        }

        if !self.log_to_console && !self.log_to_file {
            errors.push("At least one logging output (console or file) must be enabled".to_string());
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
        level.as_str().to_ascii_lowercase().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Level::from_str(&name)
            .map_err(|_| serde::de::Error::custom(format!("Unknown log level '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_uuid_matches_wire_constant() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "69fda304-da91-477b-b988-28d49ca99cf5"
        );
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let config = SessionConfig {
            retry_backoff: Duration::from_millis(100),
            max_retry_backoff: Duration::from_millis(250),
            ..SessionConfig::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(5), Duration::from_millis(250));
    }

    #[test]
    fn test_delimiter_is_fifteen_bytes() {
        assert_eq!(DELIMITER.len(), 15);
    }
}
