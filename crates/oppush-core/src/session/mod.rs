//! The send-side protocol session.
//!
//! A [`ClientSession`] owns the transport for its whole life. It opens the
//! OBEX session, then keeps pulling the oldest pending share from the
//! [`ShareQueue`] and streams it, until it is stopped. Every step is reported
//! as a [`TransferEvent`]; the session never calls a listener itself.
//!
//! ## States
//!
//! ```text
//! Idle → Connecting → Connected → Waiting ⇄ Sending → Disconnecting → Terminated
//! ```
//!
//! ## Sending one share
//!
//! 1. Name, type and length headers go into a PUT
//! 2. The first chunk is sent with the watchdog armed; the remote's answer
//!    decides whether to continue
//! 3. Each further chunk waits for `Continue`/`Ok` before the next is read
//! 4. The final response code decides the share's status
//!
//! Stopping a session that is blocked on the remote closes the transport, so
//! the pending read fails immediately instead of waiting for the peer.

pub mod quirks;

pub use quirks::{Quirk, QuirkTable};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorKind, Result};
use crate::file::{FileResolver, ResolvedFile};
use crate::obex::{HeaderSet, ObexClient, PutOperation, ResponseCode};
use crate::share::{ClientErrorKind, ServerErrorKind, ShareHandle, ShareQueue, ShareStatus};
use crate::transfer::{EventSender, TransferEvent};
use crate::transport::{ObexTransport, TransportCloser};
use crate::{DEFAULT_MAX_PACKET_SIZE, DEFAULT_POLL_INTERVAL_MS, DEFAULT_SESSION_TIMEOUT_SECS};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not running yet
    Idle,
    /// Opening the OBEX session
    Connecting,
    /// OBEX session open
    Connected,
    /// Polling the queue for work
    Waiting,
    /// Streaming a share
    Sending,
    /// Closing the OBEX session and transport
    Disconnecting,
    /// Finished; `SessionComplete` has been posted
    Terminated,
}

/// What to do with a share whose source cannot be opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessFailurePolicy {
    /// Mark it as a file error and drop it from the queue
    #[default]
    MarkFailed,
    /// Leave it pending and look again after one poll interval
    Retain,
}

/// Tunables for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Sleep between scans of an empty queue
    pub poll_interval: Duration,
    /// Watchdog window for the first acknowledgment of a share
    pub session_timeout: Duration,
    /// Count header for CONNECT; defaults to the queue length at start
    pub count_hint: Option<u32>,
    /// Handling of unreadable sources
    pub access_failure: AccessFailurePolicy,
    /// Largest packet to advertise in CONNECT
    pub max_packet_size: u16,
    /// Filename workarounds keyed by destination prefix
    pub quirks: QuirkTable,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            count_hint: None,
            access_failure: AccessFailurePolicy::default(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            quirks: QuirkTable::default(),
        }
    }
}

/// Starts sessions.
#[derive(Debug)]
pub struct ClientSession;

impl ClientSession {
    /// Spawn a session over `transport` that sends the shares in `queue`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        transport: ObexTransport,
        queue: ShareQueue,
        events: EventSender,
        options: SessionOptions,
    ) -> SessionHandle {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let shared = Arc::new(Shared {
            interrupted: AtomicBool::new(false),
            wake: CancellationToken::new(),
            waiting: Mutex::new(false),
            closer: transport.closer(),
        });

        let runner = SessionRunner {
            client: ObexClient::with_max_packet_size(transport, options.max_packet_size),
            queue,
            events,
            options,
            resolver: FileResolver::new(),
            shared: Arc::clone(&shared),
            state: state_tx,
        };
        let task = tokio::spawn(runner.run());

        SessionHandle {
            shared,
            state: state_rx,
            task,
        }
    }
}

/// Control handle for a running session.
#[derive(Debug)]
pub struct SessionHandle {
    shared: Arc<Shared>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Ask the session to stop.
    ///
    /// Wakes an idle session. If the session is blocked on the remote, the
    /// transport is closed; the share in flight then ends with
    /// `ShareInterrupted` unless its final answer already arrived. Idempotent.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Whether stop has been requested.
    pub fn is_interrupted(&self) -> bool {
        self.shared.is_interrupted()
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Whether the session task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Capability to close the session's transport.
    pub fn closer(&self) -> TransportCloser {
        self.shared.closer.clone()
    }

    /// Wait for the session task to end.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!("Session task panicked: {}", e);
        }
    }
}

/// State shared between the session task and its handle.
#[derive(Debug)]
struct Shared {
    interrupted: AtomicBool,
    wake: CancellationToken,
    /// Set while a call is blocked on the remote
    waiting: Mutex<bool>,
    closer: TransportCloser,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        let waiting = self.lock();
        if self.interrupted.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Session stop requested");
        self.wake.cancel();

        if *waiting {
            tracing::debug!("Interrupted while waiting for remote, closing transport");
            self.closer.close();
        }
    }

    /// Run a call that blocks on the remote, flagged so `stop` can unblock it.
    async fn remote<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        {
            let mut waiting = self.lock();
            if self.is_interrupted() {
                return Err(Error::Interrupted);
            }
            *waiting = true;
        }
        let result = call.await;
        *self.lock() = false;
        result
    }

    /// Sleep up to `duration`, returning early on stop.
    async fn idle(&self, duration: Duration) {
        tokio::select! {
            () = self.wake.cancelled() => {}
            () = tokio::time::sleep(duration) => {}
        }
    }
}

struct SessionRunner {
    client: ObexClient,
    queue: ShareQueue,
    events: EventSender,
    options: SessionOptions,
    resolver: FileResolver,
    shared: Arc<Shared>,
    state: watch::Sender<SessionState>,
}

/// Bytes acknowledged and the last answer from the remote.
#[derive(Debug, Default)]
struct Cursor {
    position: u64,
    code: Option<ResponseCode>,
}

impl SessionRunner {
    async fn run(mut self) {
        tracing::info!("Session started with {}", self.client.transport().peer());

        match self.connect().await {
            Ok(()) => {
                self.events.send(TransferEvent::ConnectSuccess);
                self.set_state(SessionState::Connected);
                self.work_loop().await;
            }
            Err(_) if self.shared.is_interrupted() => {
                tracing::debug!("Session stopped before the OBEX session opened");
            }
            Err(e) => {
                tracing::error!("OBEX session connect error: {}", e);
                self.events.send(TransferEvent::SessionError(None));
            }
        }

        self.disconnect().await;
        self.set_state(SessionState::Terminated);
        self.events.send(TransferEvent::SessionComplete);
        tracing::info!("Session complete");
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Session state {:?} -> {:?}", previous, state);
        }
    }

    async fn connect(&mut self) -> Result<()> {
        self.set_state(SessionState::Connecting);

        let count = self.options.count_hint.unwrap_or_else(|| {
            u32::try_from(self.queue.len()).unwrap_or(u32::MAX).max(1)
        });
        let mut headers = HeaderSet::new();
        headers.set_count(count);

        let shared = Arc::clone(&self.shared);
        shared.remote(self.client.connect(headers)).await?;
        tracing::info!("OBEX session created (count hint {})", count);
        Ok(())
    }

    async fn work_loop(&mut self) {
        while !self.shared.is_interrupted() {
            match self.queue.next_pending() {
                Some(share) => self.process(share).await,
                None => {
                    self.set_state(SessionState::Waiting);
                    tracing::trace!(
                        "No pending shares, sleeping {:?}",
                        self.options.poll_interval
                    );
                    self.shared.idle(self.options.poll_interval).await;
                }
            }
        }
    }

    async fn process(&mut self, share: ShareHandle) {
        match self.resolver.resolve(&share).await {
            Err(e) => {
                tracing::warn!("Cannot read share {} ({}): {}", share.id(), share.path().display(), e);
                self.events.send(TransferEvent::AccessFailure(share.clone()));
                match self.options.access_failure {
                    AccessFailurePolicy::MarkFailed => {
                        update_status(&share, ShareStatus::ClientError(ClientErrorKind::FileError));
                        self.queue.remove(&share);
                    }
                    AccessFailurePolicy::Retain => {
                        self.set_state(SessionState::Waiting);
                        self.shared.idle(self.options.poll_interval).await;
                    }
                }
            }
            Ok(file) => {
                if let Err(e) = share.set_status(ShareStatus::Running) {
                    tracing::warn!("Skipping share {}: {}", share.id(), e);
                    self.queue.remove(&share);
                    return;
                }
                tracing::info!(
                    "Sending {} ({}, {} bytes)",
                    file.name,
                    file.content_type,
                    file.length
                );
                self.events
                    .send(TransferEvent::TransferStart(share.clone(), file.length));
                self.set_state(SessionState::Sending);

                let status = self.send_file(&share, file).await;
                self.finish(&share, status);
            }
        }
    }

    fn finish(&self, share: &ShareHandle, status: ShareStatus) {
        self.queue.remove(share);

        if self.shared.is_interrupted() && !status.is_success() {
            tracing::info!("Share {} interrupted", share.id());
            update_status(share, ShareStatus::Canceled);
            self.events
                .send(TransferEvent::ShareInterrupted(share.clone()));
            return;
        }

        update_status(share, status);
        if status.is_success() {
            tracing::info!("Share {} sent", share.id());
            self.events.send(TransferEvent::ShareComplete(share.clone()));
        } else {
            tracing::warn!("Share {} failed: {}", share.id(), status);
            self.events
                .send(TransferEvent::SessionError(Some(share.clone())));
        }
    }

    async fn send_file(&mut self, share: &ShareHandle, file: ResolvedFile) -> ShareStatus {
        let ResolvedFile {
            name,
            content_type,
            length,
            mut reader,
        } = file;

        let name = self
            .options
            .quirks
            .apply(share.destination(), &name)
            .into_owned();
        let mut headers = HeaderSet::new();
        headers.set_name(name);
        headers.set_type(content_type);
        headers.set_length(length);

        let shared = Arc::clone(&self.shared);
        let context = StreamContext {
            shared: &shared,
            events: &self.events,
            share,
            length,
            timeout: self.options.session_timeout,
        };

        let mut op = match self.client.put(headers) {
            Ok(op) => op,
            Err(e) => {
                tracing::error!("Error when starting PUT for {}: {}", share.id(), e);
                return ShareStatus::ClientError(ClientErrorKind::DataError);
            }
        };

        let mut cursor = Cursor::default();
        let streamed = stream_object(&mut op, reader.as_mut(), &context, &mut cursor).await;

        let mut aborted = false;
        let mut status = match streamed {
            Err(e) => {
                let kind = e.kind();
                match kind {
                    ErrorKind::Interrupted => {}
                    ErrorKind::FileAccess => tracing::warn!("Read failed for {}: {}", share.id(), e),
                    _ => tracing::error!("Error when sending {}: {}", share.id(), e),
                }
                // A dead link cannot carry an ABORT.
                if !matches!(kind, ErrorKind::Transport | ErrorKind::Timeout) {
                    abort(&mut op, context.timeout).await;
                    aborted = true;
                }
                ShareStatus::from_error_kind(kind)
            }
            Ok(()) => match cursor.code {
                Some(code @ (ResponseCode::Forbidden
                | ResponseCode::NotAcceptable
                | ResponseCode::UnsupportedType)) => {
                    tracing::info!("Remote refused {}: {}", share.id(), code);
                    ShareStatus::ServerError(ServerErrorKind::from_response(code))
                }
                _ if !shared.is_interrupted() && cursor.position == length => {
                    // An empty object gets its first answer here.
                    let watchdog = cursor.code.is_none().then(|| {
                        context
                            .events
                            .send_after(context.timeout, TransferEvent::ConnectTimeout)
                    });
                    let closed = shared.remote(op.close_output()).await;
                    if let Some(watchdog) = watchdog {
                        watchdog.cancel();
                    }
                    if let Err(e) = closed {
                        tracing::error!("Error when finishing {}: {}", share.id(), e);
                    }
                    ShareStatus::Success
                }
                _ => {
                    tracing::info!(
                        "Send of {} interrupted at {} of {}",
                        share.id(),
                        cursor.position,
                        length
                    );
                    abort(&mut op, context.timeout).await;
                    aborted = true;
                    ShareStatus::Canceled
                }
            },
        };

        if !aborted {
            match op.response_code().await {
                Ok(ResponseCode::Ok) => {}
                Ok(code) => {
                    tracing::info!("Final response for {} is {}", share.id(), code);
                    status = ShareStatus::ServerError(ServerErrorKind::from_response(code));
                }
                Err(e) => {
                    tracing::debug!("No final response for {}: {}", share.id(), e);
                    status = ShareStatus::ClientError(ClientErrorKind::ConnectionError);
                }
            }
        }
        op.close();

        status
    }

    async fn disconnect(&mut self) {
        self.set_state(SessionState::Disconnecting);
        let timeout = self.options.session_timeout;

        if self.client.is_connected() && !self.client.transport().is_closed() {
            let result = tokio::time::timeout(timeout, self.client.disconnect())
                .await
                .unwrap_or_else(|_| Err(Error::timeout(timeout)));
            match result {
                Ok(()) => tracing::debug!("OBEX session disconnected"),
                Err(e) => tracing::warn!("OBEX session disconnect error: {}", e),
            }
        }

        self.client.close().await;
        tracing::debug!("OBEX session closed");

        self.shared.closer.close();
        tracing::debug!("Transport to {} closed", self.client.transport().peer());
    }
}

struct StreamContext<'a> {
    shared: &'a Shared,
    events: &'a EventSender,
    share: &'a ShareHandle,
    length: u64,
    timeout: Duration,
}

/// Stream the object body, stopping on refusal or interrupt.
async fn stream_object(
    op: &mut PutOperation<'_>,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    ctx: &StreamContext<'_>,
    cursor: &mut Cursor,
) -> Result<()> {
    if ctx.shared.is_interrupted() || cursor.position == ctx.length {
        return Ok(());
    }

    let path = ctx.share.path().display().to_string();
    let mut buffer = vec![0u8; op.max_packet_size().max(1)];

    let n = read_chunk(reader, chunk_buffer(&mut buffer, cursor, ctx.length), &path).await?;
    let last_chunk = cursor.position + n as u64 == ctx.length;

    let watchdog = ctx
        .events
        .send_after(ctx.timeout, TransferEvent::ConnectTimeout);
    let first = ctx
        .shared
        .remote(async {
            op.write(&buffer[..n]).await?;
            if last_chunk {
                op.close_output().await?;
            }
            op.response_code().await
        })
        .await;
    watchdog.cancel();

    let code = first?;
    cursor.code = Some(code);
    if !code.is_proceed() {
        return Ok(());
    }
    cursor.position += n as u64;
    tracing::debug!("Remote accepted first chunk of {}", ctx.share.id());
    ctx.events.send(TransferEvent::TransferProgress(
        ctx.share.clone(),
        cursor.position,
    ));

    while !ctx.shared.is_interrupted() && cursor.position < ctx.length {
        let n = read_chunk(reader, chunk_buffer(&mut buffer, cursor, ctx.length), &path).await?;
        let code = ctx
            .shared
            .remote(async {
                op.write(&buffer[..n]).await?;
                op.response_code().await
            })
            .await?;
        cursor.code = Some(code);
        if !code.is_proceed() {
            tracing::debug!("Remote stopped {} with {}", ctx.share.id(), code);
            break;
        }
        cursor.position += n as u64;
        tracing::trace!(
            "Sent {} of {} bytes for {}",
            cursor.position,
            ctx.length,
            ctx.share.id()
        );
        ctx.events.send(TransferEvent::TransferProgress(
            ctx.share.clone(),
            cursor.position,
        ));
    }

    Ok(())
}

/// The part of `buffer` the next chunk may use without passing `length`.
fn chunk_buffer<'b>(buffer: &'b mut [u8], cursor: &Cursor, length: u64) -> &'b mut [u8] {
    let remaining = length.saturating_sub(cursor.position);
    let len = usize::try_from(remaining).map_or(buffer.len(), |r| r.min(buffer.len()));
    &mut buffer[..len]
}

/// Fill `buffer` from `reader`, stopping early only at end of stream.
async fn read_chunk(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    buffer: &mut [u8],
    path: &str,
) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let got = reader
            .read(&mut buffer[filled..])
            .await
            .map_err(|e| Error::file_access(path, e))?;
        if got == 0 {
            break;
        }
        filled += got;
    }
    if filled == 0 {
        return Err(Error::file_access(path, "source ended before its length"));
    }
    Ok(filled)
}

async fn abort(op: &mut PutOperation<'_>, timeout: Duration) {
    let result = tokio::time::timeout(timeout, op.abort())
        .await
        .unwrap_or_else(|_| Err(Error::timeout(timeout)));
    if let Err(e) = result {
        tracing::debug!("PUT abort failed: {}", e);
    }
}

fn update_status(share: &ShareHandle, status: ShareStatus) {
    if let Err(e) = share.set_status(status) {
        tracing::warn!("Share {}: {}", share.id(), e);
    }
}
