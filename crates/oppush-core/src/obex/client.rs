//! OBEX client session and PUT operations.
//!
//! Every body chunk is a request/response pair: [`PutOperation::write`]
//! returns only after the remote answered, and the answer is available from
//! [`PutOperation::response_code`]. This keeps flow control in the hands of
//! the remote and makes every blocking point a single transport read.

use super::{
    Header, HeaderSet, Opcode, Packet, ResponseCode, HEADER_PREFIX_SIZE, PACKET_PREFIX_SIZE,
};
use crate::error::{Error, Result};
use crate::transport::ObexTransport;
use crate::{DEFAULT_MAX_PACKET_SIZE, MIN_MAX_PACKET_SIZE};

const CONNECTION_ID_SIZE: usize = 5;

/// Client side of an OBEX session over one transport.
#[derive(Debug)]
pub struct ObexClient {
    transport: ObexTransport,
    local_max_packet: u16,
    negotiated_max_packet: u16,
    connected: bool,
    connection_id: Option<u32>,
}

impl ObexClient {
    /// Create a client with the default receive limit.
    pub fn new(transport: ObexTransport) -> Self {
        Self::with_max_packet_size(transport, DEFAULT_MAX_PACKET_SIZE)
    }

    /// Create a client advertising `max_packet_size` as its receive limit.
    pub fn with_max_packet_size(transport: ObexTransport, max_packet_size: u16) -> Self {
        let max_packet_size = max_packet_size.max(MIN_MAX_PACKET_SIZE);
        Self {
            transport,
            local_max_packet: max_packet_size,
            negotiated_max_packet: MIN_MAX_PACKET_SIZE,
            connected: false,
            connection_id: None,
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &ObexTransport {
        &self.transport
    }

    /// Whether CONNECT succeeded and DISCONNECT has not been sent.
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Packet size agreed with the remote.
    pub const fn negotiated_max_packet_size(&self) -> u16 {
        self.negotiated_max_packet
    }

    /// Open the OBEX session.
    ///
    /// Returns the headers of the remote's response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedResponse`] if the remote does not answer
    /// `Ok`, or a transport error.
    pub async fn connect(&mut self, headers: HeaderSet) -> Result<HeaderSet> {
        self.transport
            .send(&Packet::connect(self.local_max_packet, headers))
            .await?;
        let response = self.transport.recv_response(true).await?;

        let code = response.response_code();
        if code != ResponseCode::Ok {
            return Err(Error::UnexpectedResponse(code));
        }

        let fields = response
            .connect
            .ok_or_else(|| Error::ProtocolError("CONNECT response without fields".to_string()))?;
        if fields.max_packet_size < MIN_MAX_PACKET_SIZE {
            return Err(Error::ProtocolError(format!(
                "remote max packet size {} below minimum {MIN_MAX_PACKET_SIZE}",
                fields.max_packet_size
            )));
        }

        self.negotiated_max_packet = self.local_max_packet.min(fields.max_packet_size);
        self.connection_id = response.headers.connection_id();
        self.connected = true;

        tracing::debug!(
            "OBEX session open with {} (max packet {}, connection id {:?})",
            self.transport.peer(),
            self.negotiated_max_packet,
            self.connection_id
        );
        Ok(response.headers)
    }

    /// Start a PUT operation with the given object headers.
    ///
    /// Nothing is sent until the first write, close or response-code query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] before a successful connect, or
    /// [`Error::ProtocolError`] if the headers cannot fit in one packet.
    pub fn put(&mut self, mut headers: HeaderSet) -> Result<PutOperation<'_>> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        if let Some(id) = self.connection_id {
            headers.prepend(Header::ConnectionId(id));
        }

        let needed = PACKET_PREFIX_SIZE + headers.encoded_len();
        if needed > usize::from(self.negotiated_max_packet) {
            return Err(Error::ProtocolError(format!(
                "object headers need {needed} bytes, remote accepts {}",
                self.negotiated_max_packet
            )));
        }

        Ok(PutOperation {
            client: self,
            pending_headers: Some(headers),
            last: None,
            output_closed: false,
            aborted: false,
            broken: false,
        })
    }

    /// Close the OBEX session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the session is not open, or
    /// [`Error::UnexpectedResponse`] if the remote refuses.
    pub async fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        self.connected = false;

        let mut headers = HeaderSet::new();
        if let Some(id) = self.connection_id {
            headers.set(Header::ConnectionId(id));
        }
        self.transport
            .send(&Packet::request(Opcode::Disconnect, headers))
            .await?;
        let code = self.transport.recv_response(false).await?.response_code();
        if code == ResponseCode::Ok {
            Ok(())
        } else {
            Err(Error::UnexpectedResponse(code))
        }
    }

    /// Release the session; no further requests are sent.
    pub async fn close(&mut self) {
        self.connected = false;
        self.connection_id = None;
        if !self.transport.is_closed() {
            self.transport.shutdown().await;
        }
    }

    fn connection_header(&self) -> HeaderSet {
        let mut headers = HeaderSet::new();
        if let Some(id) = self.connection_id {
            headers.set(Header::ConnectionId(id));
        }
        headers
    }

    async fn exchange(&mut self, packet: &Packet) -> Result<ResponseCode> {
        self.transport.send(packet).await?;
        Ok(self.transport.recv_response(false).await?.response_code())
    }
}

/// An in-progress PUT of one object.
#[derive(Debug)]
pub struct PutOperation<'a> {
    client: &'a mut ObexClient,
    pending_headers: Option<HeaderSet>,
    last: Option<ResponseCode>,
    output_closed: bool,
    aborted: bool,
    broken: bool,
}

impl PutOperation<'_> {
    /// Largest body chunk that fits in one packet.
    pub fn max_packet_size(&self) -> usize {
        let overhead = PACKET_PREFIX_SIZE
            + HEADER_PREFIX_SIZE
            + self.client.connection_id.map_or(0, |_| CONNECTION_ID_SIZE);
        usize::from(self.client.negotiated_max_packet).saturating_sub(overhead)
    }

    /// Send a body chunk and wait for the remote's answer.
    ///
    /// Chunks larger than [`max_packet_size`](Self::max_packet_size) are split.
    /// Stops early when the remote answers with anything but `Continue` or `Ok`;
    /// the answer is then available from [`response_code`](Self::response_code).
    ///
    /// # Errors
    ///
    /// Returns an error if the operation already finished or the transport fails.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;

        let chunk_size = self.max_packet_size().max(1);
        for chunk in data.chunks(chunk_size) {
            let mut headers = self.take_headers_for(chunk.len()).await?;
            if !self.proceeding() {
                return Ok(());
            }
            headers.push(Header::Body(chunk.to_vec()));
            self.send(Opcode::Put, headers).await?;
            if !self.proceeding() {
                break;
            }
        }
        Ok(())
    }

    /// Finish the object with a final PUT.
    ///
    /// Idempotent. Skipped when the remote already refused the object.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation was aborted or the transport fails.
    pub async fn close_output(&mut self) -> Result<()> {
        if self.output_closed {
            return Ok(());
        }
        if self.aborted {
            return Err(Error::ProtocolError("operation was aborted".to_string()));
        }
        if self.broken {
            return Err(Error::ConnectionClosed);
        }
        self.output_closed = true;
        if !self.proceeding() {
            return Ok(());
        }

        let mut headers = match self.pending_headers.take() {
            Some(headers) => headers,
            None => self.client.connection_header(),
        };
        headers.push(Header::EndOfBody(Vec::new()));
        self.send(Opcode::PutFinal, headers).await
    }

    /// The remote's latest answer.
    ///
    /// If nothing was sent yet, the object headers are sent to obtain one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if a previous exchange broke the
    /// transport, or a transport error from the exchange.
    pub async fn response_code(&mut self) -> Result<ResponseCode> {
        if self.broken {
            return Err(Error::ConnectionClosed);
        }
        if self.aborted {
            return Err(Error::ProtocolError("operation was aborted".to_string()));
        }
        if let Some(code) = self.last {
            return Ok(code);
        }

        let headers = self
            .pending_headers
            .take()
            .unwrap_or_else(|| self.client.connection_header());
        self.send(Opcode::Put, headers).await?;
        self.last.ok_or(Error::ConnectionClosed)
    }

    /// Abort the operation.
    ///
    /// No-op when nothing was sent yet or the operation already ended.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails while aborting.
    pub async fn abort(&mut self) -> Result<()> {
        if self.aborted || (self.output_closed && self.last == Some(ResponseCode::Ok)) {
            return Ok(());
        }
        self.aborted = true;
        if self.last.is_none() {
            return Ok(());
        }
        if self.broken {
            return Err(Error::ConnectionClosed);
        }

        let headers = self.client.connection_header();
        match self
            .client
            .exchange(&Packet::request(Opcode::Abort, headers))
            .await
        {
            Ok(code) => {
                tracing::debug!("PUT aborted, remote answered {}", code);
                Ok(())
            }
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    /// Release the operation.
    pub fn close(self) {
        if !self.output_closed && !self.aborted && self.last.is_some() {
            tracing::debug!("PUT operation released before completion");
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.broken {
            return Err(Error::ConnectionClosed);
        }
        if self.aborted || self.output_closed {
            return Err(Error::ProtocolError(
                "write after operation finished".to_string(),
            ));
        }
        match self.last {
            Some(code) if !code.is_proceed() => Err(Error::UnexpectedResponse(code)),
            _ => Ok(()),
        }
    }

    fn proceeding(&self) -> bool {
        self.last.is_none_or(ResponseCode::is_proceed)
    }

    /// Headers to send ahead of a body chunk of `body_len` bytes.
    ///
    /// If the object headers and the chunk do not fit one packet, the object
    /// headers go out alone first.
    async fn take_headers_for(&mut self, body_len: usize) -> Result<HeaderSet> {
        let Some(headers) = self.pending_headers.take() else {
            return Ok(self.client.connection_header());
        };

        let needed = PACKET_PREFIX_SIZE + headers.encoded_len() + HEADER_PREFIX_SIZE + body_len;
        if needed <= usize::from(self.client.negotiated_max_packet) {
            return Ok(headers);
        }

        self.send(Opcode::Put, headers).await?;
        Ok(self.client.connection_header())
    }

    async fn send(&mut self, opcode: Opcode, headers: HeaderSet) -> Result<()> {
        match self.client.exchange(&Packet::request(opcode, headers)).await {
            Ok(code) => {
                self.last = Some(code);
                Ok(())
            }
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }
}
