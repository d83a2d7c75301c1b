//! Opening the channel to the destination.
//!
//! One known transient failure earns a single retry: a remote that dropped
//! its pairing rejects the first attempt with a stale-link-key error, then
//! re-keys and accepts the next one.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Error;
use crate::transport::{ChannelSecurity, ConnectTarget, ObexTransport, TransportConnector};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDisposition {
    /// Try once more after the backoff
    Retry,
    /// Give up and report
    Fail,
}

/// Decide whether a failed attempt should be retried.
pub fn classify(err: &Error, retried: bool) -> ConnectDisposition {
    if !retried && err.is_stale_link_key() {
        ConnectDisposition::Retry
    } else {
        ConnectDisposition::Fail
    }
}

/// Result of [`ConnectionEstablisher::establish`].
#[derive(Debug)]
pub enum ConnectResult {
    /// A channel is open
    Ready(ObexTransport),
    /// All attempts failed
    Failed(Error),
    /// Cancelled before a channel was delivered
    Cancelled,
}

/// Obtains a transport for one destination.
pub struct ConnectionEstablisher {
    connector: Arc<dyn TransportConnector>,
    target: ConnectTarget,
    backoff: Duration,
}

impl std::fmt::Debug for ConnectionEstablisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEstablisher")
            .field("target", &self.target)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl ConnectionEstablisher {
    /// Create an establisher for `address`.
    ///
    /// An insecure channel is requested only when `prefer_insecure` is set
    /// and the connector supports it.
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        address: impl Into<String>,
        service: Uuid,
        prefer_insecure: bool,
        backoff: Duration,
    ) -> Self {
        let security = if prefer_insecure && connector.supports_insecure() {
            ChannelSecurity::Insecure
        } else {
            ChannelSecurity::Secure
        };
        Self {
            connector,
            target: ConnectTarget {
                address: address.into(),
                service,
                security,
            },
            backoff,
        }
    }

    /// Where this establisher connects.
    pub const fn target(&self) -> &ConnectTarget {
        &self.target
    }

    /// Open the channel, retrying once for a stale link key.
    ///
    /// Cancelling `cancel` drops any attempt in progress and interrupts the
    /// backoff; no transport is delivered afterwards.
    pub async fn establish(&self, cancel: &CancellationToken) -> ConnectResult {
        let mut retried = false;
        loop {
            tracing::info!(
                "Connecting to {} ({})",
                self.target.address,
                self.target.security
            );
            let attempt = tokio::select! {
                biased;
                () = cancel.cancelled() => return ConnectResult::Cancelled,
                attempt = self.connector.connect(&self.target) => attempt,
            };

            match attempt {
                Ok(transport) => {
                    if cancel.is_cancelled() {
                        transport.close().await;
                        return ConnectResult::Cancelled;
                    }
                    tracing::info!("Channel to {} open", transport.peer());
                    return ConnectResult::Ready(transport);
                }
                Err(e) => match classify(&e, retried) {
                    ConnectDisposition::Retry => {
                        tracing::warn!(
                            "Connect to {} failed ({}), retrying in {:?}",
                            self.target.address,
                            e,
                            self.backoff
                        );
                        retried = true;
                        tokio::select! {
                            () = cancel.cancelled() => return ConnectResult::Cancelled,
                            () = tokio::time::sleep(self.backoff) => {}
                        }
                    }
                    ConnectDisposition::Fail => {
                        tracing::error!("Connect to {} failed: {}", self.target.address, e);
                        return ConnectResult::Failed(e);
                    }
                },
            }
        }
    }
}
