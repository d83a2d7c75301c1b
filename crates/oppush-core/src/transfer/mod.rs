//! Transfer orchestration for one destination.
//!
//! The [`TransferOrchestrator`] ties the pieces together:
//!
//! 1. A [`ConnectionEstablisher`] task opens the channel
//! 2. The channel is handed to a [`ClientSession`], which streams the queue
//! 3. Everything the establisher and session report arrives as a
//!    [`TransferEvent`] on one channel, consumed by a single event loop
//! 4. The event loop is the only place listener callbacks run
//!
//! Shares can be added at any time after [`start`](TransferOrchestrator::start),
//! even before the channel exists.

pub mod connect;
pub mod event;
pub mod listener;

pub use connect::{classify, ConnectDisposition, ConnectResult, ConnectionEstablisher};
pub use event::{EventReceiver, EventSender, TimerHandle, TransferEvent};
pub use listener::{ConnectOutcome, DisconnectReason, NoopListener, TransferListener};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::session::{AccessFailurePolicy, ClientSession, SessionHandle, SessionOptions};
use crate::share::{ClientErrorKind, ShareHandle, ShareQueue, ShareStatus};
use crate::transport::{ObexTransport, TransportCloser, TransportConnector};
use crate::{DEFAULT_RETRY_BACKOFF_MS, OBJECT_PUSH_UUID};

/// Default time allowed for a stopping session to finish.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables for a transfer.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Session tunables
    pub session: SessionOptions,
    /// Pause before reporting a session-level failure
    pub settle_delay: Duration,
    /// How long `stop` waits for the session to tear down
    pub stop_timeout: Duration,
    /// Backoff before the stale-link-key retry
    pub retry_backoff: Duration,
    /// Request an insecure channel when the connector supports it
    pub prefer_insecure: bool,
    /// Service class to connect to
    pub service: Uuid,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            settle_delay: Duration::ZERO,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            prefer_insecure: true,
            service: OBJECT_PUSH_UUID,
        }
    }
}

#[derive(Debug)]
enum Command {
    TransportReady(ObexTransport),
    AddShare(ShareHandle),
    Stop,
}

struct Running {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Drives the transfer of a queue of shares to one destination.
pub struct TransferOrchestrator {
    destination: String,
    connector: Arc<dyn TransportConnector>,
    listener: Arc<dyn TransferListener>,
    options: TransferOptions,
    queue: ShareQueue,
    running: Option<Running>,
}

impl std::fmt::Debug for TransferOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOrchestrator")
            .field("destination", &self.destination)
            .field("queued", &self.queue.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl TransferOrchestrator {
    /// Create an orchestrator for `destination`. Nothing happens until [`start`](Self::start).
    pub fn new(
        destination: impl Into<String>,
        connector: Arc<dyn TransportConnector>,
        listener: Arc<dyn TransferListener>,
        options: TransferOptions,
    ) -> Self {
        Self {
            destination: destination.into(),
            connector,
            listener,
            options,
            queue: ShareQueue::new(),
            running: None,
        }
    }

    /// Destination address.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Whether the event loop is running.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Start the event loop and begin connecting. No-op if already started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        if self.running.is_some() {
            tracing::debug!("Transfer to {} already started", self.destination);
            return;
        }
        tracing::info!("Starting transfer to {}", self.destination);

        let (events, events_rx) = EventSender::channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let establisher = ConnectionEstablisher::new(
            Arc::clone(&self.connector),
            self.destination.clone(),
            self.options.service,
            self.options.prefer_insecure,
            self.options.retry_backoff,
        );
        tokio::spawn(establish_task(
            establisher,
            cancel.clone(),
            commands.clone(),
            events.clone(),
        ));

        let event_loop = EventLoop {
            listener: Arc::clone(&self.listener),
            options: self.options.clone(),
            queue: self.queue.clone(),
            events,
            cancel,
            session: None,
            closer: None,
            current: None,
            reported: HashSet::new(),
            connected: false,
            stop_deadline: None,
            disconnect_reason: None,
            commands_open: true,
        };
        let task = tokio::spawn(event_loop.run(events_rx, commands_rx));

        self.running = Some(Running { commands, task });
    }

    /// Stop the transfer and wait for the event loop to finish.
    ///
    /// Cancels a connection attempt in progress, stops the session and lets
    /// it tear down (bounded by the stop timeout). Safe to call at any point,
    /// and more than once.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        tracing::info!("Stopping transfer to {}", self.destination);

        let _ = running.commands.send(Command::Stop);
        if let Err(e) = running.task.await {
            tracing::error!("Transfer event loop panicked: {}", e);
        }
    }

    /// Queue a share for sending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] before [`start`](Self::start), and
    /// [`Error::SessionClosed`] once the transfer has ended.
    pub fn add_share(&self, share: ShareHandle) -> Result<()> {
        let running = self.running.as_ref().ok_or(Error::NotStarted)?;
        running
            .commands
            .send(Command::AddShare(share))
            .map_err(|_| Error::SessionClosed)
    }

    /// Send a share again after a recoverable refusal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatusTransition`] if the share's status does
    /// not allow a retry, or the errors of [`add_share`](Self::add_share).
    pub fn retry_share(&self, share: ShareHandle) -> Result<()> {
        if self.running.is_none() {
            return Err(Error::NotStarted);
        }
        share.mark_for_retry()?;
        self.add_share(share)
    }
}

async fn establish_task(
    establisher: ConnectionEstablisher,
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
    events: EventSender,
) {
    match establisher.establish(&cancel).await {
        ConnectResult::Ready(transport) => {
            if let Err(mpsc::error::SendError(command)) =
                commands.send(Command::TransportReady(transport))
            {
                if let Command::TransportReady(transport) = command {
                    transport.close().await;
                }
            }
        }
        ConnectResult::Failed(e) => {
            events.send(TransferEvent::ConnectFailure {
                reason: e.to_string(),
            });
        }
        ConnectResult::Cancelled => {
            tracing::debug!("Connection attempt cancelled");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

struct EventLoop {
    listener: Arc<dyn TransferListener>,
    options: TransferOptions,
    queue: ShareQueue,
    events: EventSender,
    cancel: CancellationToken,
    session: Option<SessionHandle>,
    closer: Option<TransportCloser>,
    current: Option<ShareHandle>,
    reported: HashSet<Uuid>,
    connected: bool,
    stop_deadline: Option<Instant>,
    disconnect_reason: Option<DisconnectReason>,
    commands_open: bool,
}

impl EventLoop {
    async fn run(
        mut self,
        mut events: EventReceiver,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        loop {
            let deadline = self.stop_deadline;
            let flow = tokio::select! {
                biased;
                Some(event) = events.recv() => self.handle_event(event).await,
                command = commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::debug!("Orchestrator dropped, stopping");
                        self.commands_open = false;
                        self.begin_stop(DisconnectReason::Stopped)
                    }
                },
                () = wait_deadline(deadline) => {
                    tracing::warn!("Session did not finish within {:?}", self.options.stop_timeout);
                    Flow::Exit
                }
            };
            if flow == Flow::Exit {
                break;
            }
        }

        // Shares added while exiting are failed with the rest of the queue.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::AddShare(share) if !self.queue.contains(&share) => {
                    self.reported.remove(&share.id());
                    self.queue.push(share);
                }
                Command::TransportReady(transport) => transport.close().await,
                Command::AddShare(_) | Command::Stop => {}
            }
        }

        self.finish();
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::TransportReady(transport) => {
                if self.stop_deadline.is_some() {
                    transport.close().await;
                    return Flow::Continue;
                }
                self.closer = Some(transport.closer());
                self.session = Some(ClientSession::spawn(
                    transport,
                    self.queue.clone(),
                    self.events.clone(),
                    self.options.session.clone(),
                ));
                Flow::Continue
            }
            Command::AddShare(share) => {
                if self.queue.contains(&share) {
                    tracing::warn!("Share {} is already queued", share.id());
                } else {
                    tracing::debug!("Queued share {} ({})", share.id(), share.path().display());
                    self.reported.remove(&share.id());
                    self.queue.push(share);
                }
                Flow::Continue
            }
            Command::Stop => self.begin_stop(DisconnectReason::Stopped),
        }
    }

    async fn handle_event(&mut self, event: TransferEvent) -> Flow {
        match event {
            TransferEvent::ConnectSuccess => {
                self.connected = true;
                self.listener.on_connect(&ConnectOutcome::Connected);
            }
            TransferEvent::ConnectFailure { reason } => {
                self.settle().await;
                self.fail_remaining(ShareStatus::ClientError(ClientErrorKind::ConnectionError));
                self.listener.on_connect(&ConnectOutcome::Failed { reason });
                self.disconnect_reason = Some(DisconnectReason::ConnectFailed);
                return Flow::Exit;
            }
            TransferEvent::AccessFailure(share) => match self.options.session.access_failure {
                AccessFailurePolicy::MarkFailed => {
                    self.report_failed(&share, ShareStatus::ClientError(ClientErrorKind::FileError));
                }
                AccessFailurePolicy::Retain => {
                    tracing::warn!("Share {} unreadable, keeping it queued", share.id());
                }
            },
            TransferEvent::TransferStart(share, total) => {
                self.listener.on_transfer_start(&share, total);
                self.current = Some(share);
            }
            TransferEvent::TransferProgress(share, sent) => {
                self.listener.on_transfer_progress(&share, sent);
            }
            TransferEvent::ShareComplete(share) => {
                self.clear_current(&share);
                if self.reported.insert(share.id()) {
                    self.listener.on_share_success(&share);
                } else {
                    tracing::debug!("Share {} already reported", share.id());
                }
            }
            TransferEvent::ShareInterrupted(share) => {
                self.close_transport();
                self.mark_failed(Some(share), ShareStatus::Canceled).await;
            }
            TransferEvent::SessionError(None) => {
                if !self.connected {
                    self.listener.on_connect(&ConnectOutcome::Failed {
                        reason: "OBEX session could not be opened".to_string(),
                    });
                }
                self.mark_failed(None, ShareStatus::UnknownError).await;
                return self.begin_stop(DisconnectReason::Error);
            }
            TransferEvent::SessionError(Some(share)) => {
                let status = share.status();
                if status.is_session_fatal() {
                    self.mark_failed(Some(share), status).await;
                    return self.begin_stop(DisconnectReason::Error);
                }
                self.report_failed(&share, status);
            }
            TransferEvent::SessionComplete => {
                tracing::debug!("Session complete");
                self.session = None;
                return Flow::Exit;
            }
            TransferEvent::ConnectTimeout => {
                tracing::warn!("Remote did not answer within {:?}", self.options.session.session_timeout);
                self.close_transport();
                match self.current.take() {
                    Some(share) if self.reported.insert(share.id()) => {
                        self.listener.on_share_timeout(&share);
                    }
                    Some(share) => tracing::debug!("Share {} already reported", share.id()),
                    None => tracing::debug!("Timeout with no share in flight"),
                }
            }
        }
        Flow::Continue
    }

    fn begin_stop(&mut self, reason: DisconnectReason) -> Flow {
        if self.disconnect_reason.is_none() {
            self.disconnect_reason = Some(reason);
        }
        if self.stop_deadline.is_some() {
            return Flow::Continue;
        }

        self.cancel.cancel();
        match &self.session {
            Some(session) => {
                session.stop();
                self.stop_deadline = Some(Instant::now() + self.options.stop_timeout);
                Flow::Continue
            }
            None => Flow::Exit,
        }
    }

    fn close_transport(&self) {
        if let Some(closer) = &self.closer {
            closer.close();
        }
    }

    fn clear_current(&mut self, share: &ShareHandle) {
        if self
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, share))
        {
            self.current = None;
        }
    }

    async fn settle(&self) {
        if !self.options.settle_delay.is_zero() {
            tokio::time::sleep(self.options.settle_delay).await;
        }
    }

    /// Report a session-level or interrupt failure after the settle delay.
    async fn mark_failed(&mut self, share: Option<ShareHandle>, reason: ShareStatus) {
        self.settle().await;

        match share.or_else(|| self.current.clone()) {
            Some(share) => {
                if share.status() != reason {
                    if let Err(e) = share.set_status(reason) {
                        tracing::debug!("Share {} keeps its status: {}", share.id(), e);
                    }
                }
                self.report_failed(&share, reason);
            }
            None => self.listener.on_share_failed(None, reason),
        }
    }

    fn report_failed(&mut self, share: &ShareHandle, reason: ShareStatus) {
        self.clear_current(share);
        if self.reported.insert(share.id()) {
            tracing::warn!("Share {} failed: {}", share.id(), reason);
            self.listener.on_share_failed(Some(share), reason);
        } else {
            tracing::debug!("Share {} already reported", share.id());
        }
    }

    fn fail_remaining(&mut self, reason: ShareStatus) {
        for share in self.queue.drain() {
            if share.status().is_terminal() {
                continue;
            }
            if let Err(e) = share.set_status(reason) {
                tracing::debug!("Share {} keeps its status: {}", share.id(), e);
            }
            self.report_failed(&share, reason);
        }
    }

    fn finish(mut self) {
        self.cancel.cancel();
        if let Some(session) = self.session.take() {
            session.stop();
            session.closer().close();
        }

        let reason = self.disconnect_reason.unwrap_or(DisconnectReason::Stopped);
        let leftover = if self.connected || reason == DisconnectReason::Stopped {
            ShareStatus::Canceled
        } else {
            ShareStatus::ClientError(ClientErrorKind::ConnectionError)
        };
        self.fail_remaining(leftover);

        tracing::info!("Transfer ended: {}", reason);
        self.listener.on_disconnect(reason);
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
