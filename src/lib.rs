//! CoreRPC - Concurrent request/response RPC over a single connection
//!
//! A client multiplexes many in-flight calls over one persistent byte
//! stream; the server answers each request in its own task. Both sides
//! agree on a serialization codec during a one-line handshake.

pub mod config;
pub mod network;
pub mod protocol;
pub mod service;

pub use network::{AsyncCall, Call, Client, ClientError, Server, ServerError};
pub use protocol::{CodecType, Handshake, Head, Payload};
pub use service::{Dispatch, Router, Service};
