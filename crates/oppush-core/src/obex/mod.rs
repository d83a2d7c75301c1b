//! OBEX packet codec and client primitives.
//!
//! OpPush speaks the subset of OBEX 1.0 that an object-push client needs:
//! CONNECT, PUT, ABORT and DISCONNECT.
//!
//! ## Packet Format
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      OBEX Packet                           │
//! ├────────────┬────────────┬──────────────────────────────────┤
//! │  Opcode /  │   Length   │  CONNECT fields (CONNECT only)   │
//! │  Response  │  2 bytes   │  version | flags | max packet    │
//! │   1 byte   │            │  1 byte  | 1 byte | 2 bytes      │
//! ├────────────┴────────────┴──────────────────────────────────┤
//! │                        Headers                             │
//! │                    (variable length)                       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Length: whole packet length in bytes, big-endian, includes the prefix
//! - Headers: the two high bits of the header id select the encoding
//!   (`00` UTF-16BE text, `01` byte sequence, `10` one byte, `11` four bytes)

pub mod client;

pub use client::{ObexClient, PutOperation};

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// OBEX protocol version sent in CONNECT (1.0)
pub const OBEX_VERSION: u8 = 0x10;

/// Bit set on the opcode of the last packet of a request
pub const FINAL_BIT: u8 = 0x80;

/// Opcode plus length prefix size in bytes
pub const PACKET_PREFIX_SIZE: usize = 3;

/// Size of the extra CONNECT fields in bytes
pub const CONNECT_FIELDS_SIZE: usize = 4;

/// Prefix size of a variable-length header (id plus length)
pub const HEADER_PREFIX_SIZE: usize = 3;

/// Largest length the 16-bit length field can express
pub const MAX_PACKET_LENGTH: usize = u16::MAX as usize;

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Open a session
    Connect = 0x80,
    /// Close a session
    Disconnect = 0x81,
    /// Non-final PUT packet
    Put = 0x02,
    /// Last PUT packet of an object
    PutFinal = 0x82,
    /// Abort the current operation
    Abort = 0xFF,
}

impl Opcode {
    /// Parse an opcode from a byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x80 => Some(Self::Connect),
            0x81 => Some(Self::Disconnect),
            0x02 => Some(Self::Put),
            0x82 => Some(Self::PutFinal),
            0xFF => Some(Self::Abort),
            _ => None,
        }
    }
}

/// Response codes the object-push client distinguishes.
///
/// Everything else is carried verbatim in [`ResponseCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// 0x90, more packets expected
    Continue,
    /// 0xA0, success
    Ok,
    /// 0xC3, remote refused the object
    Forbidden,
    /// 0xC6, remote cannot accept the object
    NotAcceptable,
    /// 0xCF, remote does not handle this content type
    UnsupportedType,
    /// Any other response byte
    Other(u8),
}

impl ResponseCode {
    /// 0xC0 Bad Request
    pub const BAD_REQUEST: u8 = 0xC0;
    /// 0xD0 Internal Server Error
    pub const INTERNAL_ERROR: u8 = 0xD0;
    /// 0xD3 Service Unavailable
    pub const SERVICE_UNAVAILABLE: u8 = 0xD3;

    /// Parse a response byte.
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            0x90 => Self::Continue,
            0xA0 => Self::Ok,
            0xC3 => Self::Forbidden,
            0xC6 => Self::NotAcceptable,
            0xCF => Self::UnsupportedType,
            other => Self::Other(other),
        }
    }

    /// Encode as a response byte.
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Continue => 0x90,
            Self::Ok => 0xA0,
            Self::Forbidden => 0xC3,
            Self::NotAcceptable => 0xC6,
            Self::UnsupportedType => 0xCF,
            Self::Other(byte) => byte,
        }
    }

    /// Whether the remote is willing to keep receiving.
    pub const fn is_proceed(self) -> bool {
        matches!(self, Self::Continue | Self::Ok)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "Continue (0x90)"),
            Self::Ok => write!(f, "OK (0xA0)"),
            Self::Forbidden => write!(f, "Forbidden (0xC3)"),
            Self::NotAcceptable => write!(f, "Not Acceptable (0xC6)"),
            Self::UnsupportedType => write!(f, "Unsupported Media Type (0xCF)"),
            Self::Other(byte) => write!(f, "{byte:#04X}"),
        }
    }
}

/// Header identifiers used by object push.
pub mod header_id {
    /// Number of objects (4 bytes)
    pub const COUNT: u8 = 0xC0;
    /// Object name (unicode)
    pub const NAME: u8 = 0x01;
    /// MIME type (null-terminated ASCII byte sequence)
    pub const TYPE: u8 = 0x42;
    /// Object length (4 bytes)
    pub const LENGTH: u8 = 0xC3;
    /// Description (unicode)
    pub const DESCRIPTION: u8 = 0x05;
    /// Object body chunk (byte sequence)
    pub const BODY: u8 = 0x48;
    /// Final object body chunk (byte sequence)
    pub const END_OF_BODY: u8 = 0x49;
    /// Connection identifier (4 bytes)
    pub const CONNECTION_ID: u8 = 0xCB;
}

const ENCODING_MASK: u8 = 0xC0;
const ENCODING_UNICODE: u8 = 0x00;
const ENCODING_BYTES: u8 = 0x40;
const ENCODING_U8: u8 = 0x80;
const ENCODING_U32: u8 = 0xC0;

/// A single OBEX header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// Number of objects that will be sent
    Count(u32),
    /// Object name
    Name(String),
    /// MIME type
    Type(String),
    /// Object length in bytes
    Length(u32),
    /// Free text description
    Description(String),
    /// Chunk of the object body
    Body(Vec<u8>),
    /// Last chunk of the object body
    EndOfBody(Vec<u8>),
    /// Connection identifier assigned by the server
    ConnectionId(u32),
    /// Any header this client does not interpret
    Unknown {
        /// Header id
        id: u8,
        /// Raw value bytes
        data: Vec<u8>,
    },
}

impl Header {
    /// The header id byte.
    pub const fn id(&self) -> u8 {
        match self {
            Self::Count(_) => header_id::COUNT,
            Self::Name(_) => header_id::NAME,
            Self::Type(_) => header_id::TYPE,
            Self::Length(_) => header_id::LENGTH,
            Self::Description(_) => header_id::DESCRIPTION,
            Self::Body(_) => header_id::BODY,
            Self::EndOfBody(_) => header_id::END_OF_BODY,
            Self::ConnectionId(_) => header_id::CONNECTION_ID,
            Self::Unknown { id, .. } => *id,
        }
    }

    /// Number of bytes this header occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Count(_) | Self::Length(_) | Self::ConnectionId(_) => 5,
            Self::Name(text) | Self::Description(text) => {
                let units = text.encode_utf16().count();
                if units == 0 {
                    HEADER_PREFIX_SIZE
                } else {
                    HEADER_PREFIX_SIZE + (units + 1) * 2
                }
            }
            Self::Type(mime) => HEADER_PREFIX_SIZE + mime.len() + 1,
            Self::Body(data) | Self::EndOfBody(data) => HEADER_PREFIX_SIZE + data.len(),
            Self::Unknown { id, data } => match id & ENCODING_MASK {
                ENCODING_U8 => 2,
                ENCODING_U32 => 5,
                _ => HEADER_PREFIX_SIZE + data.len(),
            },
        }
    }

    /// Append the wire encoding of this header to `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the header does not fit the 16-bit length field.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let len = self.encoded_len();
        if len > MAX_PACKET_LENGTH {
            return Err(Error::ProtocolError(format!(
                "header {:#04x} too large: {len} bytes",
                self.id()
            )));
        }

        buf.push(self.id());
        match self {
            Self::Count(value) | Self::Length(value) | Self::ConnectionId(value) => {
                buf.extend_from_slice(&value.to_be_bytes());
            }
            Self::Name(text) | Self::Description(text) => {
                push_len(buf, len);
                if !text.is_empty() {
                    for unit in text.encode_utf16() {
                        buf.extend_from_slice(&unit.to_be_bytes());
                    }
                    buf.extend_from_slice(&[0, 0]);
                }
            }
            Self::Type(mime) => {
                push_len(buf, len);
                buf.extend_from_slice(mime.as_bytes());
                buf.push(0);
            }
            Self::Body(data) | Self::EndOfBody(data) => {
                push_len(buf, len);
                buf.extend_from_slice(data);
            }
            Self::Unknown { id, data } => match id & ENCODING_MASK {
                ENCODING_U8 => buf.push(data.first().copied().unwrap_or_default()),
                ENCODING_U32 => {
                    let mut value = [0u8; 4];
                    let n = data.len().min(4);
                    value[..n].copy_from_slice(&data[..n]);
                    buf.extend_from_slice(&value);
                }
                _ => {
                    push_len(buf, len);
                    buf.extend_from_slice(data);
                }
            },
        }
        Ok(())
    }

    /// Decode one header from the front of `data`.
    ///
    /// Returns the header and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is truncated or malformed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let id = *data
            .first()
            .ok_or_else(|| Error::ProtocolError("empty header".to_string()))?;

        match id & ENCODING_MASK {
            ENCODING_U8 => {
                let value = *data
                    .get(1)
                    .ok_or_else(|| Error::ProtocolError(format!("truncated header {id:#04x}")))?;
                Ok((
                    Self::Unknown {
                        id,
                        data: vec![value],
                    },
                    2,
                ))
            }
            ENCODING_U32 => {
                let bytes: [u8; 4] = data
                    .get(1..5)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| Error::ProtocolError(format!("truncated header {id:#04x}")))?;
                let value = u32::from_be_bytes(bytes);
                let header = match id {
                    header_id::COUNT => Self::Count(value),
                    header_id::LENGTH => Self::Length(value),
                    header_id::CONNECTION_ID => Self::ConnectionId(value),
                    _ => Self::Unknown {
                        id,
                        data: bytes.to_vec(),
                    },
                };
                Ok((header, 5))
            }
            encoding => {
                if data.len() < HEADER_PREFIX_SIZE {
                    return Err(Error::ProtocolError(format!("truncated header {id:#04x}")));
                }
                let len = usize::from(u16::from_be_bytes([data[1], data[2]]));
                if len < HEADER_PREFIX_SIZE || len > data.len() {
                    return Err(Error::ProtocolError(format!(
                        "header {id:#04x} has invalid length {len}"
                    )));
                }
                let value = &data[HEADER_PREFIX_SIZE..len];
                let header = if encoding == ENCODING_UNICODE {
                    let text = decode_unicode(value)?;
                    match id {
                        header_id::NAME => Self::Name(text),
                        header_id::DESCRIPTION => Self::Description(text),
                        _ => Self::Unknown {
                            id,
                            data: value.to_vec(),
                        },
                    }
                } else {
                    debug_assert_eq!(encoding, ENCODING_BYTES);
                    match id {
                        header_id::TYPE => Self::Type(decode_ascii(value)),
                        header_id::BODY => Self::Body(value.to_vec()),
                        header_id::END_OF_BODY => Self::EndOfBody(value.to_vec()),
                        _ => Self::Unknown {
                            id,
                            data: value.to_vec(),
                        },
                    }
                };
                Ok((header, len))
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn push_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u16).to_be_bytes());
}

fn decode_unicode(value: &[u8]) -> Result<String> {
    if value.len() % 2 != 0 {
        return Err(Error::ProtocolError(
            "unicode header has odd length".to_string(),
        ));
    }
    let mut units: Vec<u16> = value
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    if units.last() == Some(&0) {
        units.pop();
    }
    String::from_utf16(&units)
        .map_err(|e| Error::ProtocolError(format!("invalid unicode header: {e}")))
}

fn decode_ascii(value: &[u8]) -> String {
    let trimmed = value.strip_suffix(&[0]).unwrap_or(value);
    String::from_utf8_lossy(trimmed).into_owned()
}

/// An ordered list of headers.
///
/// Setters replace an existing header with the same id so a set never
/// carries two names or two lengths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    headers: Vec<Header>,
}

impl HeaderSet {
    /// Create an empty header set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header.
    pub fn set(&mut self, header: Header) {
        let id = header.id();
        if let Some(existing) = self.headers.iter_mut().find(|h| h.id() == id) {
            *existing = header;
        } else {
            self.headers.push(header);
        }
    }

    /// Append a header without replacing (used for body chunks).
    pub fn push(&mut self, header: Header) {
        self.headers.push(header);
    }

    /// Put a header at the front (OBEX requires ConnectionId first).
    pub fn prepend(&mut self, header: Header) {
        self.headers.retain(|h| h.id() != header.id());
        self.headers.insert(0, header);
    }

    /// Set the object name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.set(Header::Name(name.into()));
    }

    /// Set the MIME type.
    pub fn set_type(&mut self, mime: impl Into<String>) {
        self.set(Header::Type(mime.into()));
    }

    /// Set the object length. Lengths beyond 4 GiB cannot be expressed and are left out.
    pub fn set_length(&mut self, length: u64) {
        if let Ok(length) = u32::try_from(length) {
            self.set(Header::Length(length));
        }
    }

    /// Set the object count hint.
    pub fn set_count(&mut self, count: u32) {
        self.set(Header::Count(count));
    }

    /// Look up a header by id.
    pub fn get(&self, id: u8) -> Option<&Header> {
        self.headers.iter().find(|h| h.id() == id)
    }

    /// Object name, if present.
    pub fn name(&self) -> Option<&str> {
        match self.get(header_id::NAME) {
            Some(Header::Name(name)) => Some(name),
            _ => None,
        }
    }

    /// MIME type, if present.
    pub fn mime_type(&self) -> Option<&str> {
        match self.get(header_id::TYPE) {
            Some(Header::Type(mime)) => Some(mime),
            _ => None,
        }
    }

    /// Object length, if present.
    pub fn length(&self) -> Option<u32> {
        match self.get(header_id::LENGTH) {
            Some(Header::Length(length)) => Some(*length),
            _ => None,
        }
    }

    /// Count hint, if present.
    pub fn count(&self) -> Option<u32> {
        match self.get(header_id::COUNT) {
            Some(Header::Count(count)) => Some(*count),
            _ => None,
        }
    }

    /// Connection id, if present.
    pub fn connection_id(&self) -> Option<u32> {
        match self.get(header_id::CONNECTION_ID) {
            Some(Header::ConnectionId(id)) => Some(*id),
            _ => None,
        }
    }

    /// Concatenated Body and EndOfBody payloads.
    pub fn body(&self) -> Vec<u8> {
        self.headers
            .iter()
            .filter_map(|h| match h {
                Header::Body(data) | Header::EndOfBody(data) => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// Whether an EndOfBody header is present.
    pub fn has_end_of_body(&self) -> bool {
        self.get(header_id::END_OF_BODY).is_some()
    }

    /// Iterate over headers in wire order.
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.headers.iter()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Total encoded size of all headers.
    pub fn encoded_len(&self) -> usize {
        self.headers.iter().map(Header::encoded_len).sum()
    }

    /// Decode a run of headers filling `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if any header is malformed.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let mut set = Self::new();
        while !data.is_empty() {
            let (header, used) = Header::decode(data)?;
            set.headers.push(header);
            data = &data[used..];
        }
        Ok(set)
    }
}

/// Extra fields carried by CONNECT requests and their responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFields {
    /// OBEX version
    pub version: u8,
    /// Connect flags
    pub flags: u8,
    /// Largest packet the sender can receive
    pub max_packet_size: u16,
}

impl ConnectFields {
    /// Fields for an OBEX 1.0 CONNECT with the given receive limit.
    #[must_use]
    pub const fn new(max_packet_size: u16) -> Self {
        Self {
            version: OBEX_VERSION,
            flags: 0,
            max_packet_size,
        }
    }
}

/// A request or response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Opcode (requests) or response code (responses), final bit included
    pub code: u8,
    /// CONNECT fields, present on CONNECT requests and their responses
    pub connect: Option<ConnectFields>,
    /// Headers
    pub headers: HeaderSet,
}

impl Packet {
    /// Build a request packet.
    #[must_use]
    pub fn request(opcode: Opcode, headers: HeaderSet) -> Self {
        Self {
            code: opcode as u8,
            connect: None,
            headers,
        }
    }

    /// Build a CONNECT request.
    #[must_use]
    pub fn connect(max_packet_size: u16, headers: HeaderSet) -> Self {
        Self {
            code: Opcode::Connect as u8,
            connect: Some(ConnectFields::new(max_packet_size)),
            headers,
        }
    }

    /// Build a response packet.
    #[must_use]
    pub fn response(code: ResponseCode, headers: HeaderSet) -> Self {
        Self {
            code: code.to_byte(),
            connect: None,
            headers,
        }
    }

    /// The opcode, when this is a request.
    pub const fn opcode(&self) -> Option<Opcode> {
        Opcode::from_byte(self.code)
    }

    /// The response code, when this is a response.
    pub const fn response_code(&self) -> ResponseCode {
        ResponseCode::from_byte(self.code)
    }

    /// Whether the final bit is set.
    pub const fn is_final(&self) -> bool {
        self.code & FINAL_BIT != 0
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        PACKET_PREFIX_SIZE
            + self.connect.map_or(0, |_| CONNECT_FIELDS_SIZE)
            + self.headers.encoded_len()
    }

    /// Encode the packet to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet exceeds the 16-bit length field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = self.encoded_len();
        if len > MAX_PACKET_LENGTH {
            return Err(Error::ProtocolError(format!("packet too large: {len} bytes")));
        }

        let mut buf = Vec::with_capacity(len);
        buf.push(self.code);
        push_len(&mut buf, len);
        if let Some(fields) = self.connect {
            buf.push(fields.version);
            buf.push(fields.flags);
            buf.extend_from_slice(&fields.max_packet_size.to_be_bytes());
        }
        for header in self.headers.iter() {
            header.encode(&mut buf)?;
        }
        Ok(buf)
    }

    /// Decode a packet from its code byte and the bytes following the length field.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet is malformed.
    pub fn decode(code: u8, rest: &[u8], has_connect_fields: bool) -> Result<Self> {
        let (connect, header_bytes) = if has_connect_fields {
            if rest.len() < CONNECT_FIELDS_SIZE {
                return Err(Error::ProtocolError(
                    "CONNECT packet too short".to_string(),
                ));
            }
            let fields = ConnectFields {
                version: rest[0],
                flags: rest[1],
                max_packet_size: u16::from_be_bytes([rest[2], rest[3]]),
            };
            (Some(fields), &rest[CONNECT_FIELDS_SIZE..])
        } else {
            (None, rest)
        };

        Ok(Self {
            code,
            connect,
            headers: HeaderSet::decode(header_bytes)?,
        })
    }
}

/// Write a complete packet to a stream.
///
/// # Errors
///
/// Returns an error if encoding or writing fails.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = packet.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_packet<R, F>(reader: &mut R, has_connect_fields: F) -> Result<Packet>
where
    R: AsyncRead + Unpin + ?Sized,
    F: FnOnce(u8) -> bool,
{
    let mut prefix = [0u8; PACKET_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;

    let code = prefix[0];
    let len = usize::from(u16::from_be_bytes([prefix[1], prefix[2]]));
    if len < PACKET_PREFIX_SIZE {
        return Err(Error::ProtocolError(format!(
            "packet length {len} shorter than prefix"
        )));
    }

    let mut rest = vec![0u8; len - PACKET_PREFIX_SIZE];
    if !rest.is_empty() {
        reader.read_exact(&mut rest).await?;
    }

    Packet::decode(code, &rest, has_connect_fields(code))
}

/// Read a request packet (server side).
///
/// # Errors
///
/// Returns an error if reading fails or the packet is malformed.
pub async fn read_request<R>(reader: &mut R) -> Result<Packet>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_packet(reader, |code| code == Opcode::Connect as u8).await
}

/// Read a response packet (client side).
///
/// `to_connect` must be true when this answers a CONNECT request.
///
/// # Errors
///
/// Returns an error if reading fails or the packet is malformed.
pub async fn read_response<R>(reader: &mut R, to_connect: bool) -> Result<Packet>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_packet(reader, |_| to_connect).await
}
