//! Transports carrying photometer records.
//!
//! A photometer is reached through one of three endpoint kinds:
//!
//! - `serial:<device>:<baud>` (USB-serial adapter, 8N1, no flow control)
//! - `tcp:<host>:<port>` (TESS-W telnet-like port 23)
//! - `udp:<host>:<port>` (TESS-W datagrams, listened for on `<port>`)
//!
//! Stream transports (serial, TCP and in-memory pipes in tests) share
//! [`StreamTransport`]; datagrams go through [`UdpTransport`]. Both implement
//! the [`Transport`] trait so a photometer link never knows which one it owns.

pub mod framing;
pub mod retry;

pub use framing::LineFramer;
pub use retry::RetryPolicy;

use crate::error::{AppResult, ZptessError};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Deadline for establishing a TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default TESS-W telnet port.
pub const DEFAULT_TCP_PORT: u16 = 23;

/// Default serial line speed.
pub const DEFAULT_BAUD: u32 = 9600;

/// Where a photometer lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Serial device and baud rate
    Serial {
        /// Device path, e.g. `/dev/ttyUSB0`
        device: String,
        /// Line speed
        baud: u32,
    },
    /// TCP stream
    Tcp {
        /// Host name or address
        host: String,
        /// Port
        port: u16,
    },
    /// UDP datagrams
    Udp {
        /// Device host, used for HTTP requests
        host: String,
        /// Local port to listen on
        port: u16,
    },
}

impl Endpoint {
    /// Network host of the device, `None` for serial endpoints.
    pub fn host(&self) -> Option<&str> {
        match self {
            Endpoint::Serial { .. } => None,
            Endpoint::Tcp { host, .. } | Endpoint::Udp { host, .. } => Some(host),
        }
    }

    /// True for serial endpoints.
    pub fn is_serial(&self) -> bool {
        matches!(self, Endpoint::Serial { .. })
    }

    /// True for TCP endpoints, the only ones that reconnect.
    pub fn is_tcp(&self) -> bool {
        matches!(self, Endpoint::Tcp { .. })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Serial { device, baud } => write!(f, "serial:{}:{}", device, baud),
            Endpoint::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
            Endpoint::Udp { host, port } => write!(f, "udp:{}:{}", host, port),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ZptessError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ZptessError::InvalidEndpoint(value.to_string());
        let (scheme, rest) = value.split_once(':').ok_or_else(invalid)?;

        match scheme.to_ascii_lowercase().as_str() {
            "serial" => {
                // Device paths never contain ':' on Linux; COM ports neither.
                let (device, baud) = match rest.rsplit_once(':') {
                    Some((device, baud)) => (device, baud.parse().map_err(|_| invalid())?),
                    None => (rest, DEFAULT_BAUD),
                };
                if device.is_empty() {
                    return Err(invalid());
                }
                Ok(Endpoint::Serial {
                    device: device.to_string(),
                    baud,
                })
            }
            "tcp" | "udp" => {
                let (host, port) = match rest.rsplit_once(':') {
                    Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
                    None if scheme.eq_ignore_ascii_case("tcp") => (rest, DEFAULT_TCP_PORT),
                    None => return Err(invalid()),
                };
                if host.is_empty() {
                    return Err(invalid());
                }
                let host = host.to_string();
                if scheme.eq_ignore_ascii_case("tcp") {
                    Ok(Endpoint::Tcp { host, port })
                } else {
                    Ok(Endpoint::Udp { host, port })
                }
            }
            _ => Err(invalid()),
        }
    }
}

/// Record-oriented device connection.
#[async_trait]
pub trait Transport: Send {
    /// Next complete record. `Ok(None)` when the peer closed the connection.
    ///
    /// Must be cancel safe: dropping the future loses no received bytes.
    async fn read_frame(&mut self) -> AppResult<Option<String>>;

    /// Sends one line (the caller includes the terminator).
    async fn write_line(&mut self, line: &str) -> AppResult<()>;

    /// Switches record framing, see [`LineFramer::set_delimiter`].
    fn set_delimiter(&mut self, delimiter: u8);

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Opens transports for endpoints. Replaced by in-memory connectors in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a fresh connection.
    async fn connect(&self, endpoint: &Endpoint) -> AppResult<Box<dyn Transport>>;
}

/// Connector for real serial ports and sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct EndpointConnector;

#[async_trait]
impl Connector for EndpointConnector {
    async fn connect(&self, endpoint: &Endpoint) -> AppResult<Box<dyn Transport>> {
        match endpoint {
            Endpoint::Serial { device, baud } => open_serial(device, *baud),
            Endpoint::Tcp { host, port } => {
                let stream =
                    tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), *port)))
                        .await
                        .map_err(|_| {
                            ZptessError::Transport(format!("Connecting to {}:{} timed out", host, port))
                        })?
                        .map_err(|e| {
                            ZptessError::Transport(format!("Connecting to {}:{}: {}", host, port, e))
                        })?;
                stream.set_nodelay(true)?;
                Ok(Box::new(StreamTransport::new(stream, endpoint.to_string())))
            }
            Endpoint::Udp { port, .. } => {
                let transport = UdpTransport::bind(SocketAddr::from(([0, 0, 0, 0], *port))).await?;
                Ok(Box::new(transport))
            }
        }
    }
}

#[cfg(feature = "tokio_serial")]
fn open_serial(device: &str, baud: u32) -> AppResult<Box<dyn Transport>> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(device, baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| ZptessError::Transport(format!("Opening {}: {}", device, e)))?;
    Ok(Box::new(StreamTransport::new(
        port,
        format!("serial:{}:{}", device, baud),
    )))
}

#[cfg(not(feature = "tokio_serial"))]
fn open_serial(_device: &str, _baud: u32) -> AppResult<Box<dyn Transport>> {
    Err(ZptessError::SerialFeatureDisabled)
}

/// Framed transport over any byte stream.
pub struct StreamTransport<S> {
    stream: S,
    framer: LineFramer,
    buf: Box<[u8; 512]>,
    label: String,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps a connected stream.
    pub fn new(stream: S, label: impl Into<String>) -> Self {
        Self {
            stream,
            framer: LineFramer::default(),
            buf: Box::new([0u8; 512]),
            label: label.into(),
        }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_frame(&mut self) -> AppResult<Option<String>> {
        loop {
            if let Some(frame) = self.framer.next_frame() {
                return Ok(Some(frame));
            }
            let n = self.stream.read(&mut self.buf[..]).await?;
            if n == 0 {
                return Ok(None);
            }
            self.framer.push(&self.buf[..n]);
        }
    }

    async fn write_line(&mut self, line: &str) -> AppResult<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    fn set_delimiter(&mut self, delimiter: u8) {
        self.framer.set_delimiter(delimiter);
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// One record per datagram. Read-only: devices do not accept commands over UDP.
pub struct UdpTransport {
    socket: UdpSocket,
    framer: LineFramer,
    buf: Box<[u8; 2048]>,
}

impl UdpTransport {
    /// Listens on `addr`.
    pub async fn bind(addr: SocketAddr) -> AppResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| ZptessError::Transport(format!("Binding UDP {}: {}", addr, e)))?;
        Ok(Self {
            socket,
            framer: LineFramer::default(),
            buf: Box::new([0u8; 2048]),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn read_frame(&mut self) -> AppResult<Option<String>> {
        loop {
            if let Some(frame) = self.framer.next_frame() {
                return Ok(Some(frame));
            }
            let (n, _peer) = self.socket.recv_from(&mut self.buf[..]).await?;
            let datagram = &self.buf[..n];
            self.framer.push(datagram);
            // A datagram is a whole record even without a terminator.
            if !datagram.contains(&self.framer.delimiter()) {
                self.framer.push(&[self.framer.delimiter()]);
            }
        }
    }

    async fn write_line(&mut self, _line: &str) -> AppResult<()> {
        Err(ZptessError::Transport(
            "UDP endpoints are receive only".to_string(),
        ))
    }

    fn set_delimiter(&mut self, delimiter: u8) {
        self.framer.set_delimiter(delimiter);
    }

    fn describe(&self) -> String {
        match self.socket.local_addr() {
            Ok(addr) => format!("udp:{}", addr),
            Err(_) => "udp".to_string(),
        }
    }
}
