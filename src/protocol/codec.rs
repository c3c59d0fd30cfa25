//! Protocol codec for encoding/decoding messages
//!
//! Handles serialization of heads and bodies and their framing on the
//! stream. Every value is written as a 4 byte big-endian length followed by
//! the codec-encoded bytes, so a read always consumes exactly one value.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::io;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Head, Payload};

/// Maximum encoded value size (10 MB)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Length prefix size in front of every value
const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Codec closed")]
    Closed,
}

impl CodecError {
    /// Whether this error is a normal end of stream
    pub fn is_eof(&self) -> bool {
        matches!(self, CodecError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Registered codecs, keyed by the name negotiated in the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CodecType {
    /// Compact binary object encoding
    #[default]
    Bincode,
    /// JSON, mostly useful for debugging
    Json,
}

impl CodecType {
    /// Every registered codec
    pub const ALL: [CodecType; 2] = [CodecType::Bincode, CodecType::Json];

    /// Name sent on the wire
    pub const fn name(&self) -> &'static str {
        match self {
            CodecType::Bincode => "application/bincode",
            CodecType::Json => "application/json",
        }
    }

    /// Find a registered codec by its wire name
    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|codec| codec.name() == name)
    }

    /// Encode a single value
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let bytes = match self {
            CodecType::Bincode => bincode::serialize(value)?,
            CodecType::Json => serde_json::to_vec(value)?,
        };

        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(bytes.len(), MAX_MESSAGE_SIZE));
        }
        Ok(bytes)
    }

    /// Decode a single value
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            CodecType::Bincode => Ok(bincode::deserialize(bytes)?),
            CodecType::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CodecType {
    type Err = String;

    /// Accepts wire names as well as the short forms `bincode` and `json`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bincode" => Ok(CodecType::Bincode),
            "json" => Ok(CodecType::Json),
            other => Self::lookup(other).ok_or_else(|| format!("unknown codec type: {}", s)),
        }
    }
}

/// Decoding half of a connection codec
pub struct CodecReader<R> {
    codec: CodecType,
    reader: R,
}

impl<R: AsyncRead + Unpin> CodecReader<R> {
    pub fn new(codec: CodecType, reader: R) -> Self {
        Self { codec, reader }
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    /// Read the next head
    pub async fn read_head(&mut self) -> Result<Head, CodecError> {
        let bytes = self.read_value().await?;
        self.codec.decode(&bytes)
    }

    /// Read the body following a head, leaving it encoded
    pub async fn read_body(&mut self) -> Result<Payload, CodecError> {
        let bytes = self.read_value().await?;
        Ok(Payload::from_encoded(self.codec, bytes))
    }

    /// Consume the body following a head without decoding it
    pub async fn discard_body(&mut self) -> Result<(), CodecError> {
        let length = self.read_length().await?;
        let mut limited = (&mut self.reader).take(length as u64);
        let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;

        if skipped < length as u64 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }

    async fn read_length(&mut self) -> Result<usize, CodecError> {
        let length = self.reader.read_u32().await? as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length, MAX_MESSAGE_SIZE));
        }
        Ok(length)
    }

    async fn read_value(&mut self) -> Result<Bytes, CodecError> {
        let length = self.read_length().await?;
        let mut buf = vec![0u8; length];
        self.reader.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// Encoding half of a connection codec
///
/// Callers must serialize access (one writer at a time) so head and body
/// are never interleaved with another message.
pub struct CodecWriter<W> {
    codec: CodecType,
    writer: W,
    write_buf: BytesMut,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> CodecWriter<W> {
    pub fn new(codec: CodecType, writer: W) -> Self {
        Self {
            codec,
            writer,
            write_buf: BytesMut::with_capacity(4096),
            closed: false,
        }
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write head and body as one unit.
    ///
    /// Any failure closes the writer: a partially written frame would
    /// corrupt the stream for every later message.
    pub async fn write_message(&mut self, head: &Head, body: &Payload) -> Result<(), CodecError> {
        if self.closed {
            return Err(CodecError::Closed);
        }

        let result = self.try_write(head, body).await;
        if let Err(e) = &result {
            tracing::error!("Codec write failed, closing connection: {}", e);
            let _ = self.close().await;
        }
        result
    }

    async fn try_write(&mut self, head: &Head, body: &Payload) -> Result<(), CodecError> {
        if body.codec() != self.codec {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("body encoded with {}, connection uses {}", body.codec(), self.codec),
            )
            .into());
        }

        let head_bytes = self.codec.encode(head)?;

        self.write_buf.clear();
        self.write_buf
            .reserve(2 * LENGTH_PREFIX_SIZE + head_bytes.len() + body.len());
        self.write_buf.put_u32(head_bytes.len() as u32);
        self.write_buf.put_slice(&head_bytes);
        self.write_buf.put_u32(body.len() as u32);
        self.write_buf.put_slice(body.as_bytes());

        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the underlying stream. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<(), CodecError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.shutdown().await?;
        Ok(())
    }
}
