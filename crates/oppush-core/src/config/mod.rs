//! Configuration management for OpPush.
//!
//! This module handles loading, saving, and validating OpPush configuration,
//! and turns it into the options the transfer layer runs with.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/oppush/config.toml` |
//! | macOS | `~/Library/Application Support/com.oppush.OpPush/config.toml` |
//! | Windows | `%APPDATA%\oppush\OpPush\config\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use oppush_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Watchdog: {:?}", config.transfer.session_timeout);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::session::{AccessFailurePolicy, QuirkTable, SessionOptions};
use crate::transfer::TransferOptions;
use crate::transport::tcp::DEFAULT_CONNECT_TIMEOUT;
use crate::transport::TcpConnector;
use crate::{
    DEFAULT_MAX_PACKET_SIZE, DEFAULT_OBEX_TCP_PORT, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_RETRY_BACKOFF_MS, DEFAULT_SESSION_TIMEOUT_SECS, MIN_MAX_PACKET_SIZE,
    OBJECT_PUSH_UUID,
};

/// Main configuration struct for OpPush.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transfer settings
    pub transfer: TransferConfig,
    /// Connection settings
    pub connection: ConnectionConfig,
    /// OBEX settings
    pub obex: ObexConfig,
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Sleep between scans of an idle queue
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Watchdog window for the first acknowledgment of a share
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,
    /// Pause before reporting a session-level failure
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// How long stopping waits for the session to tear down
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
    /// Count header sent on CONNECT (defaults to the queue length)
    pub count_hint: Option<u32>,
    /// What to do with unreadable sources
    pub access_failure: AccessFailurePolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            settle_delay: Duration::ZERO,
            stop_timeout: crate::transfer::DEFAULT_STOP_TIMEOUT,
            count_hint: None,
            access_failure: AccessFailurePolicy::default(),
        }
    }
}

/// Connection configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Backoff before the stale-link-key retry
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Time allowed for opening the channel
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Request an insecure channel where the transport supports it
    pub prefer_insecure: bool,
    /// Service class to connect to
    pub service_uuid: Uuid,
    /// Port for OBEX over TCP when the address carries none
    pub tcp_port: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            prefer_insecure: true,
            service_uuid: OBJECT_PUSH_UUID,
            tcp_port: DEFAULT_OBEX_TCP_PORT,
        }
    }
}

/// OBEX configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObexConfig {
    /// Largest packet to advertise on CONNECT
    pub max_packet_size: u16,
}

impl Default for ObexConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read,
    /// parsed or validated.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed or validated.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "oppush", "OpPush")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Check values the transfer layer cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if self.transfer.poll_interval.is_zero() {
            return Err(invalid("transfer.poll_interval", "must be greater than zero"));
        }
        if self.transfer.session_timeout.is_zero() {
            return Err(invalid("transfer.session_timeout", "must be greater than zero"));
        }
        if self.obex.max_packet_size < MIN_MAX_PACKET_SIZE {
            return Err(invalid(
                "obex.max_packet_size",
                &format!("must be at least {MIN_MAX_PACKET_SIZE}"),
            ));
        }
        if self.connection.connect_timeout.is_zero() {
            return Err(invalid("connection.connect_timeout", "must be greater than zero"));
        }
        Ok(())
    }

    /// Options for a transfer built from this configuration.
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            session: SessionOptions {
                poll_interval: self.transfer.poll_interval,
                session_timeout: self.transfer.session_timeout,
                count_hint: self.transfer.count_hint,
                access_failure: self.transfer.access_failure,
                max_packet_size: self.obex.max_packet_size,
                quirks: QuirkTable::default(),
            },
            settle_delay: self.transfer.settle_delay,
            stop_timeout: self.transfer.stop_timeout,
            retry_backoff: self.connection.retry_backoff,
            prefer_insecure: self.connection.prefer_insecure,
            service: self.connection.service_uuid,
        }
    }

    /// TCP connector built from the connection settings.
    pub fn tcp_connector(&self) -> TcpConnector {
        TcpConnector::new(self.connection.tcp_port, self.connection.connect_timeout)
    }
}

fn invalid(key: &str, reason: &str) -> Error {
    Error::InvalidConfig {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Durations as `"1500ms"`, `"50s"` or `"5m"`.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(s: &str) -> Result<Duration, String> {
        let number = |digits: &str| {
            digits
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        };

        if let Some(millis) = s.strip_suffix("ms") {
            number(millis).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            number(mins).map(|m| Duration::from_secs(m * 60))
        } else {
            Err(format!(
                "invalid duration format '{s}', expected e.g. 1500ms, 50s or 5m"
            ))
        }
    }
}
