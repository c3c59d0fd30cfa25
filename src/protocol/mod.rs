//! Protocol module - Defines the wire protocol for CoreRPC communication
//!
//! A connection carries:
//! - one handshake record (JSON line) naming the magic number and codec
//! - an unbounded sequence of `[Head][Body]` pairs encoded with that codec
//!
//! Each Head and each Body is one codec value: a 4 byte big-endian length
//! followed by the encoded bytes.

mod message;
mod codec;

pub use message::*;
pub use codec::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for CoreRPC communication
pub const DEFAULT_PORT: u16 = 9999;

/// Magic number every handshake must carry
pub const MAGIC: u32 = 0x3141_5926;
