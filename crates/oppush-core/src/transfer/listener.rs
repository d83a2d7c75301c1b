//! Callbacks for transfer progress.

use std::fmt;

use crate::share::{ShareHandle, ShareStatus};

/// Outcome of opening the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The OBEX session is open
    Connected,
    /// The channel or the OBEX session could not be opened
    Failed {
        /// What went wrong
        reason: String,
    },
}

/// Why the transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The caller stopped the transfer
    Stopped,
    /// A session-level failure ended the transfer
    Error,
    /// No channel could be opened
    ConnectFailed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "session error"),
            Self::ConnectFailed => write!(f, "connect failed"),
        }
    }
}

/// Receives transfer notifications.
///
/// All methods are called from the orchestrator's event loop, one at a time,
/// in the order the underlying events happened. Each share gets exactly one
/// of [`on_share_success`](Self::on_share_success),
/// [`on_share_failed`](Self::on_share_failed) or
/// [`on_share_timeout`](Self::on_share_timeout). Keep implementations short;
/// a slow callback delays every later event.
#[allow(unused_variables)]
pub trait TransferListener: Send + Sync {
    /// The session opened, or failed to.
    fn on_connect(&self, outcome: &ConnectOutcome) {}

    /// The transfer ended. Called exactly once.
    fn on_disconnect(&self, reason: DisconnectReason) {}

    /// A share started; `total` is its length in bytes.
    fn on_transfer_start(&self, share: &ShareHandle, total: u64) {}

    /// `sent` bytes of a share have been acknowledged.
    fn on_transfer_progress(&self, share: &ShareHandle, sent: u64) {}

    /// The remote did not acknowledge a share in time.
    fn on_share_timeout(&self, share: &ShareHandle) {}

    /// A share failed. `share` is `None` when the failure could not be tied to one.
    fn on_share_failed(&self, share: Option<&ShareHandle>, reason: ShareStatus) {}

    /// A share was delivered.
    fn on_share_success(&self, share: &ShareHandle) {}
}

/// A listener that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl TransferListener for NoopListener {}
