//! Events flowing from the connector and the session to the event loop.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::share::ShareHandle;

/// Something the event loop must react to.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// The OBEX session is open
    ConnectSuccess,
    /// No channel could be opened
    ConnectFailure {
        /// Error reported by the connector
        reason: String,
    },
    /// A share's source could not be opened
    AccessFailure(ShareHandle),
    /// A share started; carries its total length
    TransferStart(ShareHandle, u64),
    /// Bytes acknowledged so far for a share
    TransferProgress(ShareHandle, u64),
    /// A share was delivered
    ShareComplete(ShareHandle),
    /// A share was stopped locally
    ShareInterrupted(ShareHandle),
    /// The session or a share failed
    SessionError(Option<ShareHandle>),
    /// The session has fully torn down
    SessionComplete,
    /// The remote did not acknowledge the first chunk in time
    ConnectTimeout,
}

impl TransferEvent {
    /// The share this event is about, if any.
    pub const fn share(&self) -> Option<&ShareHandle> {
        match self {
            Self::AccessFailure(share)
            | Self::TransferStart(share, _)
            | Self::TransferProgress(share, _)
            | Self::ShareComplete(share)
            | Self::ShareInterrupted(share)
            | Self::SessionError(Some(share)) => Some(share),
            _ => None,
        }
    }
}

/// Receiving end of the event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<TransferEvent>;

/// Posts events to the loop, now or after a delay.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl EventSender {
    /// Create a connected sender/receiver pair.
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Post an event. Returns false if the loop is gone.
    pub fn send(&self, event: TransferEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                tracing::trace!("Event loop gone, dropping {:?}", event);
                false
            }
        }
    }

    /// Post an event once `delay` has elapsed unless the returned timer is cancelled first.
    pub fn send_after(&self, delay: Duration, event: TransferEvent) -> TimerHandle {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
        TimerHandle { handle }
    }

    /// Whether the loop has stopped receiving.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A scheduled event that has not fired yet.
#[derive(Debug)]
pub struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    /// Remove the scheduled event. No effect if it already fired.
    pub fn cancel(self) {
        self.handle.abort();
    }

    /// Whether the event has been posted (or the timer cancelled).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
