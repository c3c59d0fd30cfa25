//! Protocol message definitions
//!
//! Defines the handshake record, the per-message envelope and the erased
//! body container shared by the client and the server.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{CodecError, CodecType, MAGIC};

/// Connection option record, sent once right after connect.
///
/// Always encoded as a single JSON line, independent of the codec it
/// negotiates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Must equal [`MAGIC`]
    pub magic: u32,
    /// Registered codec name, e.g. `application/bincode`
    pub codec_type: String,
}

impl Handshake {
    pub fn new(codec: CodecType) -> Self {
        Self {
            magic: MAGIC,
            codec_type: codec.name().to_string(),
        }
    }

    /// Encode as one newline-terminated JSON line
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Decode from one JSON line (trailing newline allowed)
    pub fn from_line(line: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(line)
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new(CodecType::default())
    }
}

/// Envelope preceding every message body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    /// Remote operation, formatted as `{service}.{method}`
    pub method: String,
    /// Assigned by the client, echoed back unchanged by the server
    pub seq: u64,
    /// Empty on success
    pub error: String,
}

impl Head {
    pub fn new(method: impl Into<String>, seq: u64) -> Self {
        Self {
            method: method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Copy of this head carrying an error message
    pub fn with_error(&self, error: impl Into<String>) -> Self {
        Self {
            method: self.method.clone(),
            seq: self.seq,
            error: error.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Placeholder body sent in place of a reply when a request failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentinel;

/// A message body whose concrete type is not known yet.
///
/// Holds the bytes exactly as the connection codec produced them; call
/// [`Payload::decode`] once the target type is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    codec: CodecType,
    bytes: Bytes,
}

impl Payload {
    /// Encode a value with the given codec
    pub fn encode<T: Serialize + ?Sized>(codec: CodecType, value: &T) -> Result<Self, CodecError> {
        Ok(Self {
            codec,
            bytes: Bytes::from(codec.encode(value)?),
        })
    }

    /// Wrap bytes that were already encoded with `codec`
    pub fn from_encoded(codec: CodecType, bytes: Bytes) -> Self {
        Self { codec, bytes }
    }

    /// Sentinel body for `codec`
    pub fn sentinel(codec: CodecType) -> Result<Self, CodecError> {
        Self::encode(codec, &Sentinel)
    }

    /// Decode into a concrete type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        self.codec.decode(&self.bytes)
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_line_is_single_json_object() {
        let handshake = Handshake::default();
        let line = handshake.to_line().unwrap();

        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);

        let parsed = Handshake::from_line(&line).unwrap();
        assert_eq!(parsed, handshake);
        assert_eq!(parsed.magic, MAGIC);
        assert_eq!(parsed.codec_type, "application/bincode");
    }

    #[test]
    fn test_handshake_rejects_garbage() {
        assert!(Handshake::from_line(b"not json\n").is_err());
    }

    #[test]
    fn test_head_with_error_keeps_seq() {
        let head = Head::new("Arith.Add", 7);
        assert!(!head.is_error());

        let failed = head.with_error("boom");
        assert_eq!(failed.seq, 7);
        assert_eq!(failed.method, "Arith.Add");
        assert!(failed.is_error());
    }

    #[test]
    fn test_payload_decode_with_its_codec() {
        for codec in CodecType::ALL {
            let payload = Payload::encode(codec, &(3i64, 4i64)).unwrap();
            assert_eq!(payload.codec(), codec);

            let (a, b): (i64, i64) = payload.decode().unwrap();
            assert_eq!(a + b, 7);
        }
    }

    #[test]
    fn test_sentinel_payload() {
        let json = Payload::sentinel(CodecType::Json).unwrap();
        assert_eq!(json.as_bytes(), b"null");

        let bincode = Payload::sentinel(CodecType::Bincode).unwrap();
        assert!(bincode.is_empty());
        assert_eq!(bincode.decode::<Sentinel>().unwrap(), Sentinel);
    }
}
