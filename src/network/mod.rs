//! Network module - Handles RPC traffic over byte streams
//!
//! Provides:
//! - Server for accepting connections and dispatching requests
//! - Client for issuing concurrent calls over one connection
//! - Connection handshake shared by both sides

mod server;
mod client;
mod connection;

pub use server::*;
pub use client::*;
pub use connection::*;

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::CodecType;

/// Default capacity of completion channels allocated by the client
pub const DEFAULT_COMPLETION_CAPACITY: usize = 10;

/// Default limit on concurrently running handlers per connection
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 256;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Codec requested when dialing
    pub codec: CodecType,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Handlers allowed to run at once on one server connection
    pub max_concurrent_requests: usize,
    /// Capacity used when the client replaces a completion channel
    pub completion_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            codec: CodecType::default(),
            connect_timeout_ms: 5000,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            completion_capacity: DEFAULT_COMPLETION_CAPACITY,
        }
    }
}

impl NetworkConfig {
    pub fn with_codec(mut self, codec: CodecType) -> Self {
        self.codec = codec;
        self
    }

    /// Set the connect timeout, saturating at `u64::MAX` milliseconds
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_concurrent_requests(mut self, limit: usize) -> Self {
        self.max_concurrent_requests = limit.max(1);
        self
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_config_builders() {
        let config = NetworkConfig::default()
            .with_codec(CodecType::Json)
            .with_max_concurrent_requests(0);

        assert_eq!(config.codec, CodecType::Json);
        assert_eq!(config.max_concurrent_requests, 1);
        assert_eq!(config.completion_capacity, DEFAULT_COMPLETION_CAPACITY);
    }

    #[test]
    fn test_connect_timeout_saturates() {
        let config = NetworkConfig::default().with_connect_timeout(Duration::from_secs(2));
        assert_eq!(config.connect_timeout_ms, 2000);

        let config = NetworkConfig::default().with_connect_timeout(Duration::MAX);
        assert_eq!(config.connect_timeout_ms, u64::MAX);
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = resolve_host("127.0.0.1", 4242).await.unwrap();
        assert_eq!(addr.port(), 4242);
    }
}
