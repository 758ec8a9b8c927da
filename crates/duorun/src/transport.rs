//! # Transport Abstraction
//!
//! A minimal, async interface for moving whole frames between two peers.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about frames, values or callbacks.
//!   It moves opaque buffers, one buffer per message.
//! - **Duplex**: Sending and receiving are independent. A connection sends from many
//!   tasks while its pump sits in `recv`.
//!
//! ## TCP Framing
//!
//! `[Len: 4b LE][Body: Len]`. Bodies above the configured maximum are refused on
//! both the sending and the receiving side.

use std::fmt;
use std::net::SocketAddr;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::ToSocketAddrs;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// A frame exceeded the maximum frame size.
    FrameTooLarge { size: usize, max: usize },
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::FrameTooLarge { size, max } => write!(f, "Frame of {} bytes exceeds maximum of {}", size, max),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Self::ConnectionLost(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A bidirectional message pipe.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one message.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Receives the next message. `Ok(None)` means the remote side closed cleanly.
    ///
    /// Only one task receives at a time; concurrent callers are serialized.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Stops sending. The remote side observes end-of-stream.
    async fn close(&self) -> Result<()>;
}

/// Length-prefixed frames over a TCP stream.
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    max_frame_size: usize,
    peer_addr: Option<SocketAddr>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, max_frame_size: usize) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            max_frame_size,
            peer_addr,
        }
    }

    /// Opens a TCP connection. No timeout is applied here.
    pub async fn connect(addr: impl ToSocketAddrs, max_frame_size: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream, max_frame_size))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_frame_size || size > u32::MAX as usize {
            return Err(Error::FrameTooLarge { size, max: self.max_frame_size });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        self.check_size(payload.len())?;
        let len = (payload.len() as u32).to_le_bytes();

        let mut writer = self.writer.lock().await;
        writer.write_all(&len).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;

        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(len_bytes) as usize;
        self.check_size(len)?;

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        Ok(Some(body))
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
