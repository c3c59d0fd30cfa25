//! Connection setup for CoreRPC
//!
//! Handles the one-time handshake that precedes all codec traffic:
//! - the dialing side writes a single JSON line
//! - the accepting side reads exactly that line, checks the magic number
//!   and resolves the codec

use std::pin::Pin;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{CodecError, CodecType, Handshake, MAGIC};

/// Longest handshake line accepted, newline included
pub const MAX_HANDSHAKE_LEN: usize = 1024;

/// Read half of a connection with its concrete stream type erased
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Write half of a connection with its concrete stream type erased
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Magic number mismatch: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("Unknown codec type: {0}")]
    UnknownCodec(String),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Check a handshake record and resolve its codec
pub fn validate_handshake(handshake: &Handshake) -> ConnectionResult<CodecType> {
    if handshake.magic != MAGIC {
        return Err(ConnectionError::InvalidMagic {
            expected: MAGIC,
            actual: handshake.magic,
        });
    }

    CodecType::lookup(&handshake.codec_type)
        .ok_or_else(|| ConnectionError::UnknownCodec(handshake.codec_type.clone()))
}

/// Perform the dialing side of the handshake
pub async fn send_handshake<W>(writer: &mut W, handshake: &Handshake) -> ConnectionResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let line = handshake
        .to_line()
        .map_err(|e| ConnectionError::HandshakeFailed(e.to_string()))?;

    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Perform the accepting side of the handshake.
///
/// Consumes exactly one line from `reader`; anything buffered after it
/// stays in `reader` for the codec.
pub async fn accept_handshake<R>(reader: &mut R) -> ConnectionResult<CodecType>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(128);
    let mut limited = (&mut *reader).take(MAX_HANDSHAKE_LEN as u64);
    limited.read_until(b'\n', &mut line).await?;

    if line.last() != Some(&b'\n') {
        return Err(if line.is_empty() {
            ConnectionError::Closed
        } else if line.len() >= MAX_HANDSHAKE_LEN {
            ConnectionError::HandshakeFailed(format!(
                "handshake longer than {} bytes",
                MAX_HANDSHAKE_LEN
            ))
        } else {
            ConnectionError::HandshakeFailed("connection closed during handshake".to_string())
        });
    }

    let handshake = Handshake::from_line(&line)
        .map_err(|e| ConnectionError::HandshakeFailed(format!("malformed handshake: {}", e)))?;

    validate_handshake(&handshake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_validate_handshake() {
        assert_eq!(
            validate_handshake(&Handshake::new(CodecType::Json)).unwrap(),
            CodecType::Json
        );

        let bad_magic = Handshake {
            magic: 0xdead_beef,
            codec_type: CodecType::Bincode.name().to_string(),
        };
        assert!(matches!(
            validate_handshake(&bad_magic),
            Err(ConnectionError::InvalidMagic { actual: 0xdead_beef, .. })
        ));

        let unknown = Handshake {
            magic: MAGIC,
            codec_type: "application/gob".to_string(),
        };
        assert!(matches!(
            validate_handshake(&unknown),
            Err(ConnectionError::UnknownCodec(name)) if name == "application/gob"
        ));
    }

    #[tokio::test]
    async fn test_handshake_does_not_over_read() {
        let mut raw = Handshake::new(CodecType::Json).to_line().unwrap();
        raw.extend_from_slice(b"rest of the stream");

        let mock = tokio_test::io::Builder::new().read(&raw).build();
        let mut reader = BufReader::new(mock);

        assert_eq!(accept_handshake(&mut reader).await.unwrap(), CodecType::Json);

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "rest of the stream");
    }

    #[tokio::test]
    async fn test_send_then_accept() {
        let (mut client, server) = tokio::io::duplex(1024);
        send_handshake(&mut client, &Handshake::default()).await.unwrap();

        let mut reader = BufReader::new(server);
        assert_eq!(accept_handshake(&mut reader).await.unwrap(), CodecType::Bincode);
    }

    #[tokio::test]
    async fn test_handshake_rejections() {
        let mock = tokio_test::io::Builder::new().build();
        let mut reader = BufReader::new(mock);
        assert!(matches!(
            accept_handshake(&mut reader).await,
            Err(ConnectionError::Closed)
        ));

        let mock = tokio_test::io::Builder::new().read(b"{\"magic\":").build();
        let mut reader = BufReader::new(mock);
        assert!(matches!(
            accept_handshake(&mut reader).await,
            Err(ConnectionError::HandshakeFailed(_))
        ));

        let mock = tokio_test::io::Builder::new().read(b"hello\n").build();
        let mut reader = BufReader::new(mock);
        assert!(matches!(
            accept_handshake(&mut reader).await,
            Err(ConnectionError::HandshakeFailed(_))
        ));

        let long = vec![b' '; MAX_HANDSHAKE_LEN + 10];
        let mock = tokio_test::io::Builder::new().read(&long).build();
        let mut reader = BufReader::new(mock);
        assert!(matches!(
            accept_handshake(&mut reader).await,
            Err(ConnectionError::HandshakeFailed(_))
        ));
    }
}
