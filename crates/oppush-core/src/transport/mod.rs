//! Byte-stream channels the OBEX client runs over.
//!
//! A [`TransportConnector`] turns a [`ConnectTarget`] into an open
//! [`ObexTransport`]. The transport owns the stream and a cancellation token;
//! every read and write races that token, so any holder of a
//! [`TransportCloser`] can unblock pending I/O from another task.

pub mod tcp;

pub use tcp::{parse_host_address, TcpConnector};

use std::fmt;
use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::obex::{self, Packet};

/// Any bidirectional async byte stream.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Link-level security requested for the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSecurity {
    /// Authenticated and encrypted channel
    Secure,
    /// Unauthenticated channel, no pairing prompt on the remote
    Insecure,
}

impl fmt::Display for ChannelSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secure => write!(f, "secure"),
            Self::Insecure => write!(f, "insecure"),
        }
    }
}

/// Where and how to open a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Destination address, as given by the caller
    pub address: String,
    /// Service class to connect to
    pub service: Uuid,
    /// Requested channel security
    pub security: ChannelSecurity,
}

impl ConnectTarget {
    /// Target the object-push service on `address`.
    pub fn object_push(address: impl Into<String>, security: ChannelSecurity) -> Self {
        Self {
            address: address.into(),
            service: crate::OBJECT_PUSH_UUID,
            security,
        }
    }
}

/// Opens channels to remote devices.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open a channel to `target`.
    ///
    /// Failures should be reported as [`Error::Connect`] carrying the
    /// underlying message verbatim; the caller matches on it to decide
    /// whether a retry is worthwhile.
    async fn connect(&self, target: &ConnectTarget) -> Result<ObexTransport>;

    /// Whether this connector can open [`ChannelSecurity::Insecure`] channels.
    fn supports_insecure(&self) -> bool {
        false
    }
}

/// An open channel to a remote device.
pub struct ObexTransport {
    stream: Box<dyn ByteStream>,
    closed: CancellationToken,
    peer: String,
}

impl fmt::Debug for ObexTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObexTransport")
            .field("peer", &self.peer)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ObexTransport {
    /// Wrap an already-open stream.
    pub fn new<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: ByteStream + 'static,
    {
        Self {
            stream: Box::new(stream),
            closed: CancellationToken::new(),
            peer: peer.into(),
        }
    }

    /// Remote peer description (address or name).
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// A handle that can close this transport from another task.
    pub fn closer(&self) -> TransportCloser {
        TransportCloser {
            token: self.closed.clone(),
        }
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send a packet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the transport is closed before
    /// or during the write.
    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        let token = self.closed.clone();
        if token.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        tokio::select! {
            biased;
            () = token.cancelled() => Err(Error::ConnectionClosed),
            result = obex::write_packet(self.stream.as_mut(), packet) => result.map_err(map_io),
        }
    }

    /// Receive a response packet.
    ///
    /// `to_connect` must be true when awaiting the answer to a CONNECT.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the transport is closed before
    /// or during the read, or the remote hangs up.
    pub async fn recv_response(&mut self, to_connect: bool) -> Result<Packet> {
        let token = self.closed.clone();
        if token.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        tokio::select! {
            biased;
            () = token.cancelled() => Err(Error::ConnectionClosed),
            result = obex::read_response(self.stream.as_mut(), to_connect) => result.map_err(map_io),
        }
    }

    /// Flush and shut down the write half without marking the transport closed.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("Transport shutdown for {} failed: {}", self.peer, e);
        }
    }

    /// Shut down the stream and mark the transport closed.
    pub async fn close(mut self) {
        if !self.closed.is_cancelled() {
            self.shutdown().await;
        }
        self.closed.cancel();
        tracing::debug!("Transport to {} closed", self.peer);
    }
}

fn map_io(err: Error) -> Error {
    match err {
        Error::Io(e)
            if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ) =>
        {
            Error::ConnectionClosed
        }
        other => other,
    }
}

/// Capability to close a transport owned by another task.
#[derive(Debug, Clone)]
pub struct TransportCloser {
    token: CancellationToken,
}

impl TransportCloser {
    /// Close the transport; pending and future I/O fails with [`Error::ConnectionClosed`].
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}
