//! Error types for OpPush.
//!
//! This module provides a unified error type for all OpPush operations,
//! with specific error variants for different failure modes. Every variant
//! belongs to one [`ErrorKind`]; the session maps the kind of a failed send
//! to the share's final status (see `ShareStatus::from_error_kind`).

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::obex::ResponseCode;

/// A specialized `Result` type for OpPush operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error message reported by the link layer when a remote device dropped its
/// pairing but the local side still holds the old link key.
pub const STALE_LINK_KEY_MESSAGE: &str = "Invalid exchange";

/// The main error type for OpPush.
#[derive(Error, Debug)]
pub enum Error {
    /// The transport channel could not be opened
    #[error("{0}")]
    Connect(String),

    /// The transport was closed while an operation was pending
    #[error("transport closed")]
    ConnectionClosed,

    /// The OBEX session is not connected
    #[error("OBEX session is not connected")]
    NotConnected,

    /// Malformed or oversized OBEX packet
    #[error("invalid OBEX packet: {0}")]
    ProtocolError(String),

    /// The remote answered with a response code the operation cannot continue from
    #[error("unexpected response from remote: {0}")]
    UnexpectedResponse(ResponseCode),

    /// The local source of a share could not be opened or read
    #[error("cannot access '{path}': {reason}")]
    FileAccess {
        /// Source path of the share
        path: String,
        /// Reason for the failure
        reason: String,
    },

    /// The operation was interrupted locally
    #[error("operation interrupted")]
    Interrupted,

    /// No response within the allowed window
    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Invalid user input (addresses, arguments)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A share status change that would break monotonic progress
    #[error("invalid status transition from {from} to {to}")]
    InvalidStatusTransition {
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// The transfer has not been started yet
    #[error("transfer has not been started")]
    NotStarted,

    /// The transfer session has already ended
    #[error("transfer session has ended")]
    SessionClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure taxonomy used by the transfer layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect or I/O failure on the link
    Transport,
    /// Unexpected packet or response code from the remote
    Protocol,
    /// Local file could not be resolved or read
    FileAccess,
    /// Local cancellation
    Interrupted,
    /// No response within the watchdog window
    Timeout,
    /// Bad configuration
    Config,
    /// API used out of order or with bad arguments
    Usage,
}

impl Error {
    /// Returns the taxonomy bucket of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect(_) | Self::ConnectionClosed | Self::NotConnected | Self::Io(_) => {
                ErrorKind::Transport
            }
            Self::ProtocolError(_) | Self::UnexpectedResponse(_) => ErrorKind::Protocol,
            Self::FileAccess { .. } => ErrorKind::FileAccess,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ConfigError(_) | Self::InvalidConfig { .. } => ErrorKind::Config,
            Self::InvalidInput(_)
            | Self::InvalidStatusTransition { .. }
            | Self::NotStarted
            | Self::SessionClosed => ErrorKind::Usage,
        }
    }

    /// Returns whether this is the transient stale-link-key connect failure.
    ///
    /// This is the only connect failure that earns an automatic retry.
    #[must_use]
    pub fn is_stale_link_key(&self) -> bool {
        matches!(self, Self::Connect(message) if message == STALE_LINK_KEY_MESSAGE)
    }

    /// Build a [`Error::Timeout`] for a wait of `after`.
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout(u64::try_from(after.as_millis()).unwrap_or(u64::MAX))
    }

    /// Build a [`Error::FileAccess`] for `path`.
    pub fn file_access(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::FileAccess {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
