//! Fixed-layout frame headers and length-prefixed payloads.
//!
//! All integers are little-endian `i32`.
//!
//! Request (client → server), 72 bytes followed by the payload:
//! ```text
//! [4]  request_id
//! [64] function_name, ASCII, NUL-terminated, zero-padded
//! [4]  payload_length
//! ```
//!
//! Response (server → client), 16 bytes followed by the payload:
//! ```text
//! [4] connection_id
//! [4] message_kind           0 = CALLBACK, 1 = RETURN
//! [4] status_or_callback_id  status for RETURN, callback id for CALLBACK
//! [4] payload_length
//! ```

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FUNCTION_NAME_LEN: usize = 64;
pub const REQUEST_HEADER_LEN: usize = 4 + FUNCTION_NAME_LEN + 4;
pub const RESPONSE_HEADER_LEN: usize = 16;

/// Largest payload accepted unless configured otherwise: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

pub const STATUS_OK: i32 = 0;
pub const STATUS_ERROR: i32 = 1;

pub type ConnectionId = i32;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer went away, possibly mid-frame.
    #[error("connection closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => FrameError::Closed,
            _ => FrameError::Io(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageKind {
    Callback = 0,
    Return = 1,
}

impl MessageKind {
    pub fn from_i32(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Callback),
            1 => Some(Self::Return),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// Client bookkeeping only; never echoed back.
    pub request_id: i32,
    pub function_name: String,
    pub payload_len: i32,
}

impl RequestHeader {
    /// Function names longer than 63 bytes are truncated on encode.
    pub fn encode(&self) -> [u8; REQUEST_HEADER_LEN] {
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        buf[..4].copy_from_slice(&self.request_id.to_le_bytes());

        let name = truncate_name(&self.function_name);
        buf[4..4 + name.len()].copy_from_slice(name.as_bytes());

        buf[4 + FUNCTION_NAME_LEN..].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; REQUEST_HEADER_LEN]) -> Result<Self, FrameError> {
        let request_id = read_i32(buf, 0);

        let raw_name = &buf[4..4 + FUNCTION_NAME_LEN];
        let end = raw_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(FUNCTION_NAME_LEN);
        let raw_name = &raw_name[..end];
        if !raw_name.is_ascii() {
            return Err(FrameError::Protocol(
                "function name is not ASCII".to_owned(),
            ));
        }
        let function_name = String::from_utf8_lossy(raw_name).into_owned();

        let payload_len = read_i32(buf, 4 + FUNCTION_NAME_LEN);
        check_len(payload_len)?;

        Ok(Self {
            request_id,
            function_name,
            payload_len,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub connection_id: ConnectionId,
    pub kind: MessageKind,
    pub status_or_callback_id: i32,
    pub payload_len: i32,
}

impl ResponseHeader {
    pub fn encode(&self) -> [u8; RESPONSE_HEADER_LEN] {
        let mut buf = [0u8; RESPONSE_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.connection_id.to_le_bytes());
        buf[4..8].copy_from_slice(&(self.kind as i32).to_le_bytes());
        buf[8..12].copy_from_slice(&self.status_or_callback_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; RESPONSE_HEADER_LEN]) -> Result<Self, FrameError> {
        let raw_kind = read_i32(buf, 4);
        let kind = MessageKind::from_i32(raw_kind)
            .ok_or_else(|| FrameError::Protocol(format!("unknown message kind {raw_kind}")))?;
        let payload_len = read_i32(buf, 12);
        check_len(payload_len)?;

        Ok(Self {
            connection_id: read_i32(buf, 0),
            kind,
            status_or_callback_id: read_i32(buf, 8),
            payload_len,
        })
    }
}

/// A complete server → client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub header: ResponseHeader,
    pub payload: Vec<u8>,
}

impl ResponseFrame {
    pub fn returning(
        connection_id: ConnectionId,
        status: i32,
        payload: Vec<u8>,
    ) -> Result<Self, FrameError> {
        Self::new(connection_id, MessageKind::Return, status, payload)
    }

    pub fn callback(
        connection_id: ConnectionId,
        callback_id: i32,
        payload: Vec<u8>,
    ) -> Result<Self, FrameError> {
        Self::new(connection_id, MessageKind::Callback, callback_id, payload)
    }

    /// The frame sent once on accept: RETURN, status 0, no payload.
    pub fn greeting(connection_id: ConnectionId) -> Self {
        Self {
            header: ResponseHeader {
                connection_id,
                kind: MessageKind::Return,
                status_or_callback_id: STATUS_OK,
                payload_len: 0,
            },
            payload: Vec::new(),
        }
    }

    fn new(
        connection_id: ConnectionId,
        kind: MessageKind,
        status_or_callback_id: i32,
        payload: Vec<u8>,
    ) -> Result<Self, FrameError> {
        let payload_len = i32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
            len: payload.len(),
            max: i32::MAX as usize,
        })?;
        Ok(Self {
            header: ResponseHeader {
                connection_id,
                kind,
                status_or_callback_id,
                payload_len,
            },
            payload,
        })
    }
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    i32::from_le_bytes(raw)
}

fn check_len(len: i32) -> Result<(), FrameError> {
    if len < 0 {
        return Err(FrameError::Protocol(format!("negative payload length {len}")));
    }
    Ok(())
}

fn truncate_name(name: &str) -> &str {
    let max = FUNCTION_NAME_LEN - 1;
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Reads exactly `len` bytes. A stream that ends early yields
/// [`FrameError::Closed`].
pub async fn read_payload<R>(reader: &mut R, len: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

pub async fn read_request<R>(
    reader: &mut R,
    max_payload_len: usize,
) -> Result<(RequestHeader, Vec<u8>), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; REQUEST_HEADER_LEN];
    reader.read_exact(&mut buf).await?;
    let header = RequestHeader::decode(&buf)?;
    let payload = read_bounded(reader, header.payload_len, max_payload_len).await?;
    Ok((header, payload))
}

pub async fn read_response<R>(
    reader: &mut R,
    max_payload_len: usize,
) -> Result<ResponseFrame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; RESPONSE_HEADER_LEN];
    reader.read_exact(&mut buf).await?;
    let header = ResponseHeader::decode(&buf)?;
    let payload = read_bounded(reader, header.payload_len, max_payload_len).await?;
    Ok(ResponseFrame { header, payload })
}

async fn read_bounded<R>(reader: &mut R, len: i32, max: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = len as usize;
    if len > max {
        return Err(FrameError::PayloadTooLarge { len, max });
    }
    read_payload(reader, len).await
}

/// Writes header then payload and flushes. Callers must hold exclusive
/// access to `writer` for the whole call.
pub async fn write_response<W>(writer: &mut W, frame: &ResponseFrame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.header.encode()).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_request<W>(
    writer: &mut W,
    request_id: i32,
    function_name: &str,
    payload: &[u8],
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let payload_len = i32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        len: payload.len(),
        max: i32::MAX as usize,
    })?;
    let header = RequestHeader {
        request_id,
        function_name: function_name.to_owned(),
        payload_len,
    };
    writer.write_all(&header.encode()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
