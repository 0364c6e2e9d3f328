//! Frame transport for the command and message channels.
//!
//! Every frame carries a 4-byte header followed by the packet body:
//!
//! ```text
//! [u16 BE body length] [u8 flags] [u8 correlation] [body: length bytes]
//! ```
//!
//! Flags:
//! - `0x01` ([`flags::SYNC`]): synchronous request, the peer must answer with
//!   exactly one reply frame on the same channel. Replies clear every flag and
//!   echo the request's correlation byte.
//!
//! The handshake a client sends once, right after connecting its command
//! socket, uses the same length-prefix style:
//!
//! ```text
//! [u16 BE path length] [path bytes] [u16 BE postfix length] [postfix bytes]
//! ```
//!
//! Blocking helpers serve the client side, async helpers serve the server.

// Rust guideline compliant 2026-02

use std::fmt;
use std::io::{self, ErrorKind, Read, Write};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum body size of a single frame in bytes.
pub const MAX_FRAME_SIZE: usize = 16 * 1024;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 4;

/// Maximum length of each handshake field in bytes.
pub const MAX_HANDSHAKE_FIELD: usize = 256;

/// Frame flag constants.
pub mod flags {
    /// Synchronous request expecting one reply.
    pub const SYNC: u8 = 0x01;
}

/// Errors produced while moving frames over a socket.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the connection (zero-byte read).
    #[error("peer hung up")]
    HungUp,

    /// A received header declares a body larger than [`MAX_FRAME_SIZE`].
    #[error("frame too large: {0} bytes declared (max {MAX_FRAME_SIZE})")]
    Oversized(usize),

    /// Refused to encode a body larger than [`MAX_FRAME_SIZE`].
    #[error("refusing to send {0} byte body (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),

    /// Malformed handshake bytes.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Any other transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Why a connection was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its end.
    HungUp,
    /// A handler asked for the connection to be closed.
    Terminated,
    /// The local side is shutting down.
    Shutdown,
    /// The peer violated the wire format.
    Protocol(String),
    /// A transport error other than hang-up.
    Io(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HungUp => f.write_str("peer hung up"),
            Self::Terminated => f.write_str("terminated"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl From<&FrameError> for DisconnectReason {
    fn from(err: &FrameError) -> Self {
        match err {
            FrameError::HungUp => Self::HungUp,
            FrameError::Io(e) => Self::Io(e.to_string()),
            FrameError::Oversized(_) | FrameError::TooLarge(_) | FrameError::Handshake(_) => {
                Self::Protocol(err.to_string())
            }
        }
    }
}

/// Decoded 4-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length in bytes.
    pub body_len: u16,
    /// Flag bits, see [`flags`].
    pub flags: u8,
    /// Correlation byte echoed by replies.
    pub correlation: u8,
}

impl FrameHeader {
    /// Header for a body of `body_len` bytes.
    pub fn new(body_len: u16, flags: u8, correlation: u8) -> Self {
        Self { body_len, flags, correlation }
    }

    /// Whether the sync flag is set.
    pub fn is_sync(&self) -> bool {
        self.flags & flags::SYNC != 0
    }

    /// Header of the reply to this request: flags cleared, correlation echoed.
    pub fn reply(&self, body_len: u16) -> Self {
        Self::new(body_len, 0, self.correlation)
    }

    /// Wire representation.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let len = self.body_len.to_be_bytes();
        [len[0], len[1], self.flags, self.correlation]
    }

    /// Parse the wire representation, rejecting lengths over the maximum.
    pub fn decode(bytes: [u8; HEADER_LEN]) -> Result<Self, FrameError> {
        let body_len = u16::from_be_bytes([bytes[0], bytes[1]]);
        if usize::from(body_len) > MAX_FRAME_SIZE {
            return Err(FrameError::Oversized(usize::from(body_len)));
        }
        Ok(Self::new(body_len, bytes[2], bytes[3]))
    }
}

/// A complete frame read from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: FrameHeader,
    /// Body bytes, exactly `header.body_len` long.
    pub body: Vec<u8>,
}

/// Encode a frame into one contiguous buffer.
pub fn encode_frame(flags: u8, correlation: u8, body: &[u8]) -> Result<Vec<u8>, FrameError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(body.len()));
    }
    let header = FrameHeader::new(body.len() as u16, flags, correlation);
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Encode the client handshake (reverse-channel path, then postfix).
pub fn encode_handshake(path: &str, postfix: &str) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::with_capacity(4 + path.len() + postfix.len());
    for (what, field) in [("path", path), ("postfix", postfix)] {
        if field.len() > MAX_HANDSHAKE_FIELD {
            return Err(FrameError::Handshake(format!(
                "{what} too long ({} bytes, max {MAX_HANDSHAKE_FIELD})",
                field.len()
            )));
        }
        buf.extend_from_slice(&(field.len() as u16).to_be_bytes());
        buf.extend_from_slice(field.as_bytes());
    }
    Ok(buf)
}

/// Fill `buf` completely, retrying on interrupted and would-block reads.
///
/// A zero-byte read is a hang-up.
pub fn read_exact_retrying<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(FrameError::HungUp),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::yield_now(),
            Err(e) => return Err(FrameError::Io(e)),
        }
    }
    Ok(())
}

/// Write all of `buf`, retrying on interrupted and would-block writes.
pub fn write_all_retrying<W: Write>(writer: &mut W, buf: &[u8]) -> Result<(), FrameError> {
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => return Err(FrameError::HungUp),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::yield_now(),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => return Err(FrameError::HungUp),
            Err(e) => return Err(FrameError::Io(e)),
        }
    }
    Ok(())
}

/// Read one frame from a blocking stream.
///
/// The header is validated before the body is allocated or read.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut raw = [0u8; HEADER_LEN];
    read_exact_retrying(reader, &mut raw)?;
    let header = FrameHeader::decode(raw)?;

    let mut body = vec![0u8; usize::from(header.body_len)];
    read_exact_retrying(reader, &mut body)?;
    Ok(Frame { header, body })
}

/// Encode and write one frame to a blocking stream.
pub fn write_frame<W: Write>(
    writer: &mut W,
    flags: u8,
    correlation: u8,
    body: &[u8],
) -> Result<(), FrameError> {
    let buf = encode_frame(flags, correlation, body)?;
    write_all_retrying(writer, &buf)
}

/// Map tokio's EOF error onto a hang-up.
fn async_read_error(e: io::Error) -> FrameError {
    if e.kind() == ErrorKind::UnexpectedEof {
        FrameError::HungUp
    } else {
        FrameError::Io(e)
    }
}

/// Read one frame from an async stream.
pub async fn read_frame_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut raw = [0u8; HEADER_LEN];
    reader.read_exact(&mut raw).await.map_err(async_read_error)?;
    let header = FrameHeader::decode(raw)?;

    let mut body = vec![0u8; usize::from(header.body_len)];
    reader.read_exact(&mut body).await.map_err(async_read_error)?;
    Ok(Frame { header, body })
}

/// Encode and write one frame to an async stream.
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    flags: u8,
    correlation: u8,
    body: &[u8],
) -> Result<(), FrameError> {
    let buf = encode_frame(flags, correlation, body)?;
    writer.write_all(&buf).await.map_err(|e| match e.kind() {
        ErrorKind::BrokenPipe => FrameError::HungUp,
        _ => FrameError::Io(e),
    })
}

async fn read_handshake_field<R: AsyncRead + Unpin>(
    reader: &mut R,
    what: &str,
) -> Result<String, FrameError> {
    let mut len = [0u8; 2];
    reader.read_exact(&mut len).await.map_err(async_read_error)?;
    let len = usize::from(u16::from_be_bytes(len));
    if len > MAX_HANDSHAKE_FIELD {
        return Err(FrameError::Handshake(format!(
            "{what} too long ({len} bytes, max {MAX_HANDSHAKE_FIELD})"
        )));
    }

    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await.map_err(async_read_error)?;
    String::from_utf8(bytes)
        .map_err(|_| FrameError::Handshake(format!("{what} is not valid UTF-8")))
}

/// Read the client handshake, returning `(path, postfix)`.
pub async fn read_handshake_async<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(String, String), FrameError> {
    let path = read_handshake_field(reader, "path").await?;
    if path.is_empty() {
        return Err(FrameError::Handshake("empty reverse path".to_string()));
    }
    let postfix = read_handshake_field(reader, "postfix").await?;
    Ok((path, postfix))
}
