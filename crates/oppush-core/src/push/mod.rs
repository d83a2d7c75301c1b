//! High-level push client.
//!
//! [`PushClient`] is the caller-facing entry point: hand it files and read
//! [`PushStatus`] updates from one channel. The orchestrator behind it is
//! started on the first share and replaced after it disconnects, so a client
//! can outlive several sessions.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use oppush_core::push::{PushClient, StatusKind};
//! use oppush_core::share::ShareInfo;
//! use oppush_core::transport::TcpConnector;
//!
//! let (mut client, mut updates) = PushClient::new("192.168.1.20", Arc::new(TcpConnector::default()));
//! client.share_file(ShareInfo::new("notes.txt"))?;
//!
//! while let Some(update) = updates.recv().await {
//!     if let StatusKind::Disconnected(_) = update.kind {
//!         break;
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::share::{ShareHandle, ShareInfo, ShareStatus};
use crate::transfer::{
    ConnectOutcome, DisconnectReason, TransferListener, TransferOptions, TransferOrchestrator,
};
use crate::transport::TransportConnector;

/// What a [`PushStatus`] update reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusKind {
    /// The OBEX session opened
    Connected,
    /// The channel or OBEX session could not be opened
    ConnectFailed {
        /// What went wrong
        reason: String,
    },
    /// The session ended
    Disconnected(DisconnectReason),
    /// A share started sending
    Started {
        /// Length in bytes
        total: u64,
    },
    /// Bytes of a share acknowledged so far
    Progress {
        /// Bytes sent
        sent: u64,
    },
    /// The remote did not acknowledge a share in time
    TimedOut,
    /// A share failed
    Failed(ShareStatus),
    /// A share was delivered
    Succeeded,
}

/// One update from a [`PushClient`].
#[derive(Debug, Clone)]
pub struct PushStatus {
    /// What happened
    pub kind: StatusKind,
    /// The share it concerns, if any
    pub share: Option<ShareHandle>,
}

impl PushStatus {
    const fn new(kind: StatusKind, share: Option<ShareHandle>) -> Self {
        Self { kind, share }
    }

    /// Whether this update ends the session.
    pub const fn is_disconnect(&self) -> bool {
        matches!(self.kind, StatusKind::Disconnected(_))
    }
}

/// Forwards listener callbacks as [`PushStatus`] updates.
struct StatusForwarder {
    tx: mpsc::UnboundedSender<PushStatus>,
    disconnected: Arc<AtomicBool>,
}

impl StatusForwarder {
    fn forward(&self, kind: StatusKind, share: Option<&ShareHandle>) {
        if self
            .tx
            .send(PushStatus::new(kind, share.cloned()))
            .is_err()
        {
            tracing::trace!("Status receiver dropped");
        }
    }
}

impl TransferListener for StatusForwarder {
    fn on_connect(&self, outcome: &ConnectOutcome) {
        let kind = match outcome {
            ConnectOutcome::Connected => StatusKind::Connected,
            ConnectOutcome::Failed { reason } => StatusKind::ConnectFailed {
                reason: reason.clone(),
            },
        };
        self.forward(kind, None);
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.forward(StatusKind::Disconnected(reason), None);
    }

    fn on_transfer_start(&self, share: &ShareHandle, total: u64) {
        self.forward(StatusKind::Started { total }, Some(share));
    }

    fn on_transfer_progress(&self, share: &ShareHandle, sent: u64) {
        self.forward(StatusKind::Progress { sent }, Some(share));
    }

    fn on_share_timeout(&self, share: &ShareHandle) {
        self.forward(StatusKind::TimedOut, Some(share));
    }

    fn on_share_failed(&self, share: Option<&ShareHandle>, reason: ShareStatus) {
        self.forward(StatusKind::Failed(reason), share);
    }

    fn on_share_success(&self, share: &ShareHandle) {
        self.forward(StatusKind::Succeeded, Some(share));
    }
}

struct ActiveTransfer {
    orchestrator: TransferOrchestrator,
    disconnected: Arc<AtomicBool>,
}

impl ActiveTransfer {
    fn is_ended(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst) || !self.orchestrator.is_running()
    }
}

/// Pushes files to one destination.
pub struct PushClient {
    destination: String,
    connector: Arc<dyn TransportConnector>,
    options: TransferOptions,
    status_tx: mpsc::UnboundedSender<PushStatus>,
    active: Option<ActiveTransfer>,
}

impl std::fmt::Debug for PushClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushClient")
            .field("destination", &self.destination)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl PushClient {
    /// Create a client for `destination` with default options.
    pub fn new(
        destination: impl Into<String>,
        connector: Arc<dyn TransportConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<PushStatus>) {
        Self::with_options(destination, connector, TransferOptions::default())
    }

    /// Create a client for `destination`.
    pub fn with_options(
        destination: impl Into<String>,
        connector: Arc<dyn TransportConnector>,
        options: TransferOptions,
    ) -> (Self, mpsc::UnboundedReceiver<PushStatus>) {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let client = Self {
            destination: destination.into(),
            connector,
            options,
            status_tx,
            active: None,
        };
        (client, status_rx)
    }

    /// Destination address.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Whether a transfer is running.
    pub fn is_connected(&self) -> bool {
        self.active.as_ref().is_some_and(|active| !active.is_ended())
    }

    /// Start connecting if no transfer is running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&mut self) {
        if self.is_connected() {
            return;
        }
        if self.active.take().is_some() {
            tracing::debug!("Previous transfer to {} ended, starting a new one", self.destination);
        }

        let disconnected = Arc::new(AtomicBool::new(false));
        let forwarder = StatusForwarder {
            tx: self.status_tx.clone(),
            disconnected: Arc::clone(&disconnected),
        };
        let mut orchestrator = TransferOrchestrator::new(
            self.destination.clone(),
            Arc::clone(&self.connector),
            Arc::new(forwarder),
            self.options.clone(),
        );
        orchestrator.start();

        self.active = Some(ActiveTransfer {
            orchestrator,
            disconnected,
        });
    }

    /// Queue a file for sending, connecting first if needed.
    ///
    /// The share's destination is set to this client's destination.
    ///
    /// # Errors
    ///
    /// Returns an error if the share cannot be handed to a running transfer.
    pub fn share_file(&mut self, share: ShareInfo) -> Result<ShareHandle> {
        let share = share.with_destination(self.destination.clone()).into_handle();
        tracing::debug!("Sharing {} with {}", share.path().display(), self.destination);

        self.connect();
        match self.add(Arc::clone(&share)) {
            Err(Error::SessionClosed) => {
                // The transfer ended between the check and the send.
                self.active = None;
                self.connect();
                self.add(Arc::clone(&share))?;
            }
            other => other?,
        }
        Ok(share)
    }

    /// Stop the running transfer, if any, and wait for it to end.
    pub async fn disconnect(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.orchestrator.stop().await;
        }
    }

    fn add(&self, share: ShareHandle) -> Result<()> {
        self.active
            .as_ref()
            .ok_or(Error::NotStarted)?
            .orchestrator
            .add_share(share)
    }
}
