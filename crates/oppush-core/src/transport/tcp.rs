//! OBEX over TCP.
//!
//! Useful for peers that expose object push on an IP network and for local
//! testing against a TCP OBEX server. Channel security does not apply here;
//! the connector always reports it cannot open insecure channels.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use super::{ConnectTarget, ObexTransport, TransportConnector};
use crate::error::{Error, Result};
use crate::DEFAULT_OBEX_TCP_PORT;

/// Default time allowed for the TCP handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Parse a host address string into a `SocketAddr`.
///
/// Accepts formats:
/// - `IP` (e.g., `192.168.1.100`) - uses `default_port`
/// - `IP:PORT` (e.g., `192.168.1.100:6500`) - uses specified port
/// - `[IPv6]` (e.g., `[::1]`) - uses `default_port`
/// - `[IPv6]:PORT` (e.g., `[::1]:6500`) - uses specified port
///
/// # Examples
///
/// ```
/// use oppush_core::transport::parse_host_address;
///
/// let addr = parse_host_address("192.168.1.100", 650).unwrap();
/// assert_eq!(addr.port(), 650);
///
/// let addr = parse_host_address("192.168.1.100:6500", 650).unwrap();
/// assert_eq!(addr.port(), 6500);
/// ```
///
/// # Errors
///
/// Returns an error if the host string cannot be parsed.
pub fn parse_host_address(host: &str, default_port: u16) -> Result<SocketAddr> {
    let host = host.trim();
    let invalid = || {
        Error::InvalidInput(format!(
            "Invalid host format '{host}'. Use IP or IP:PORT (e.g., 192.168.1.100 or 192.168.1.100:650)"
        ))
    };

    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        let ip: IpAddr = inner.parse().map_err(|_| invalid())?;
        return Ok(SocketAddr::new(ip, default_port));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    if let Some((ip_part, port_part)) = host.rsplit_once(':') {
        if !ip_part.contains(':') {
            let ip: IpAddr = ip_part.parse().map_err(|_| invalid())?;
            let port: u16 = port_part.parse().map_err(|_| {
                Error::InvalidInput(format!(
                    "Invalid port '{port_part}'. Port must be a number between 1 and 65535"
                ))
            })?;
            return Ok(SocketAddr::new(ip, port));
        }
    }

    Err(invalid())
}

/// Connects to OBEX servers over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    port: u16,
    connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_OBEX_TCP_PORT, DEFAULT_CONNECT_TIMEOUT)
    }
}

impl TcpConnector {
    /// Create a connector using `port` when the address carries none.
    pub const fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
        }
    }

    /// Port used when the address carries none.
    pub const fn port(&self) -> u16 {
        self.port
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<ObexTransport> {
        let addr = parse_host_address(&target.address, self.port)?;
        tracing::debug!(
            "Opening TCP channel to {} (service {}, {})",
            addr,
            target.service,
            target.security
        );

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Connect(format!("connection to {addr} timed out")))?
            .map_err(|e| Error::Connect(e.to_string()))?;

        configure_tcp_socket(&stream)?;

        Ok(ObexTransport::new(stream, addr.to_string()))
    }
}

fn configure_tcp_socket(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    SockRef::from(stream)
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    tracing::debug!("TCP keep-alive enabled on socket");
    Ok(())
}
