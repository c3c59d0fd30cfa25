//! CoreRPC Server
//!
//! The server accepts connections, performs the handshake and then reads
//! requests one after another. Every request runs in its own task so a slow
//! handler never blocks the connection; responses are written under a
//! per-connection lock and may go out in any order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;

use super::connection::{accept_handshake, BoxedReader, BoxedWriter, ConnectionError};
use super::NetworkConfig;
use crate::protocol::{CodecReader, CodecWriter, Head, Payload};
use crate::service::Dispatch;

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

type SharedWriter = Arc<Mutex<CodecWriter<BoxedWriter>>>;

/// CoreRPC Server
pub struct Server {
    /// Server configuration
    config: NetworkConfig,
    /// Request dispatcher shared by all connections
    dispatcher: Arc<dyn Dispatch>,
    /// Shutdown signal for the accept loop
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the accept loop is running
    running: Arc<RwLock<bool>>,
}

impl Server {
    /// Create a new server
    pub fn new(config: NetworkConfig, dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            config,
            dispatcher,
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Bind `addr` and accept connections in the background.
    ///
    /// Returns the bound address, useful when binding port 0.
    pub async fn start(&mut self, addr: &str) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let dispatcher = self.dispatcher.clone();
        let max_concurrent = self.config.max_concurrent_requests;
        let running = self.running.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                spawn_connection(stream, addr, dispatcher.clone(), max_concurrent);
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;
        });

        Ok(local_addr)
    }

    /// Stop accepting connections. Open connections are served until the
    /// peer closes them.
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let mut running = self.running.write().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
            *running = false;
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        Ok(())
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Accept connections from `listener` forever, serving each in its own task
    pub async fn accept(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => spawn_connection(
                    stream,
                    addr,
                    self.dispatcher.clone(),
                    self.config.max_concurrent_requests,
                ),
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Serve a single connection until the peer hangs up.
    ///
    /// Returns after every in-flight request has been answered.
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        serve_connection(
            stream,
            self.dispatcher.clone(),
            self.config.max_concurrent_requests,
        )
        .await;
    }
}

fn spawn_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<dyn Dispatch>,
    max_concurrent: usize,
) {
    tracing::info!("New connection from {}", addr);
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }

    tokio::spawn(async move {
        serve_connection(stream, dispatcher, max_concurrent).await;
        tracing::info!("Connection from {} closed", addr);
    });
}

async fn serve_connection<S>(stream: S, dispatcher: Arc<dyn Dispatch>, max_concurrent: usize)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut buffered = BufReader::new(Box::pin(read_half) as BoxedReader);

    let codec = match accept_handshake(&mut buffered).await {
        Ok(codec) => codec,
        Err(e) => {
            match e {
                ConnectionError::Closed => tracing::debug!("Connection closed before handshake"),
                e => tracing::warn!("Rejecting connection: {}", e),
            }
            let _ = write_half.shutdown().await;
            return;
        }
    };

    tracing::debug!("Handshake complete (codec {})", codec);

    let writer: SharedWriter = Arc::new(Mutex::new(CodecWriter::new(
        codec,
        Box::pin(write_half) as BoxedWriter,
    )));
    let mut reader = CodecReader::new(codec, buffered);
    let limit = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut handlers = JoinSet::new();

    loop {
        let head = match reader.read_head().await {
            Ok(head) => head,
            Err(e) if e.is_eof() => break,
            Err(e) => {
                tracing::warn!("Failed to read request head: {}", e);
                break;
            }
        };

        let args = match reader.read_body().await {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!("Failed to read argument for {} (seq {}): {}", head.method, head.seq, e);
                send_error(&writer, &head, format!("rpc: failed to read argument: {}", e)).await;
                break;
            }
        };

        let permit = match limit.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let dispatcher = dispatcher.clone();
        let writer = writer.clone();
        handlers.spawn(async move {
            handle_request(dispatcher, &writer, head, args).await;
            drop(permit);
        });

        while let Some(result) = handlers.try_join_next() {
            log_handler_exit(result);
        }
    }

    while let Some(result) = handlers.join_next().await {
        log_handler_exit(result);
    }

    let _ = writer.lock().await.close().await;
}

async fn handle_request(
    dispatcher: Arc<dyn Dispatch>,
    writer: &Mutex<CodecWriter<BoxedWriter>>,
    head: Head,
    args: Payload,
) {
    let method = head.method.clone();

    // Run the handler in its own task so a panic fails only this request
    let outcome = tokio::spawn(async move { dispatcher.dispatch(&method, args).await }).await;

    match outcome {
        Ok(Ok(reply)) => write_response(writer, &head, &reply).await,
        Ok(Err(error)) => {
            tracing::debug!("{} (seq {}) failed: {}", head.method, head.seq, error);
            send_error(writer, &head, error).await;
        }
        Err(e) => {
            tracing::error!("Handler for {} (seq {}) failed: {}", head.method, head.seq, e);
            let error = if e.is_panic() {
                "rpc: handler panicked"
            } else {
                "rpc: handler cancelled"
            };
            send_error(writer, &head, error.to_string()).await;
        }
    }
}

async fn send_error(writer: &Mutex<CodecWriter<BoxedWriter>>, head: &Head, error: String) {
    let mut writer = writer.lock().await;
    let head = head.with_error(error);

    match Payload::sentinel(writer.codec()) {
        Ok(body) => {
            if let Err(e) = writer.write_message(&head, &body).await {
                tracing::debug!("Failed to send error for seq {}: {}", head.seq, e);
            }
        }
        Err(e) => tracing::error!("Failed to encode error body: {}", e),
    }
}

async fn write_response(writer: &Mutex<CodecWriter<BoxedWriter>>, head: &Head, body: &Payload) {
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_message(head, body).await {
        tracing::debug!("Failed to write response for seq {}: {}", head.seq, e);
    }
}

fn log_handler_exit(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!("Request handler failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{send_handshake, Client, ClientError};
    use crate::protocol::{CodecType, Handshake, MAGIC};
    use crate::service::{Router, Service};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncReadExt};

    fn demo_router() -> Router {
        let mut router = Router::new();
        router
            .register(
                Service::new("Echo")
                    .method("Echo", |s: String| async move { Ok::<_, String>(s) })
                    .method("Slow", |(s, delay_ms): (String, u64)| async move {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        Ok::<_, String>(s)
                    }),
            )
            .unwrap();
        router
            .register(
                Service::new("Arith")
                    .method("Add", |(a, b): (i64, i64)| async move { Ok::<_, String>(a + b) })
                    .method("Div", |(a, b): (i64, i64)| async move {
                        if b == 0 {
                            Err("divide by zero".to_string())
                        } else {
                            Ok(a / b)
                        }
                    }),
            )
            .unwrap();
        router
    }

    /// Serve one in-memory connection, returning the client end
    fn serve_duplex(server: Arc<Server>) -> tokio::io::DuplexStream {
        let (client_io, server_io) = duplex(64 * 1024);
        tokio::spawn(async move { server.serve_conn(server_io).await });
        client_io
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let mut server = Server::new(NetworkConfig::default(), Arc::new(demo_router()));
        assert!(!server.is_running().await);
        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));

        let addr = server.start("127.0.0.1:0").await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_running().await);
        assert!(matches!(
            server.start("127.0.0.1:0").await,
            Err(ServerError::AlreadyRunning)
        ));

        server.stop().await.unwrap();
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_concurrent_calls_over_tcp() {
        let router = Arc::new(demo_router());
        let mut server = Server::new(NetworkConfig::default(), router.clone());
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let client = Client::dial(&addr.to_string(), Handshake::default()).await.unwrap();

        let calls: Vec<_> = (0..5u64)
            .map(|i| client.go::<_, String>("Echo.Slow", &(format!("req {}", i), 50 - i * 10), None))
            .collect();

        for (i, call) in calls.into_iter().enumerate() {
            let call = call.done().await.unwrap();
            assert!(call.seq > 0);
            assert_eq!(call.result.unwrap(), format!("req {}", i));
        }
        assert_eq!(router.num_calls("Echo.Slow"), Some(5));

        let sum: i64 = client.call("Arith.Add", &(2i64, 3i64)).await.unwrap();
        assert_eq!(sum, 5);
        assert_eq!(client.pending_count().await, 0);

        client.close().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_sequential_calls_leave_nothing_pending() {
        let mut server = Server::new(NetworkConfig::default(), Arc::new(demo_router()));
        let addr = server.start("127.0.0.1:0").await.unwrap();
        let client = Client::dial(&addr.to_string(), Handshake::default()).await.unwrap();

        for i in 0..5 {
            let reply: String = client.call("Echo.Echo", &format!("req {}", i)).await.unwrap();
            assert_eq!(reply, format!("req {}", i));
        }
        assert_eq!(client.pending_count().await, 0);

        client.close().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_handshake_keeps_listener_accepting() {
        let mut server = Server::new(NetworkConfig::default(), Arc::new(demo_router()));
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let rejected = [
            Handshake {
                magic: MAGIC ^ 1,
                codec_type: CodecType::Bincode.name().to_string(),
            },
            Handshake {
                magic: MAGIC,
                codec_type: "application/gob".to_string(),
            },
        ];

        for handshake in rejected {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            send_handshake(&mut stream, &handshake).await.unwrap();

            let mut rest = Vec::new();
            let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(read, 0);
        }

        assert!(server.is_running().await);
        let client = Client::dial(&addr.to_string(), Handshake::default()).await.unwrap();
        let sum: i64 = client.call("Arith.Add", &(20i64, 22i64)).await.unwrap();
        assert_eq!(sum, 42);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_only_its_call() {
        let mut router = Router::new();
        router
            .register(Service::new("Fragile").method("Check", |x: u8| async move {
                if x > 0 {
                    panic!("handler gave up on {}", x);
                }
                Ok::<_, String>(x)
            }))
            .unwrap();

        let server = Arc::new(Server::new(NetworkConfig::default(), Arc::new(router)));
        let client = Client::new(serve_duplex(server), Handshake::default()).await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            client.call::<_, u8>("Fragile.Check", &1u8),
        )
        .await
        .unwrap();
        assert!(matches!(&result, Err(ClientError::Remote(msg)) if msg == "rpc: handler panicked"));

        let ok: u8 = client.call("Fragile.Check", &0u8).await.unwrap();
        assert_eq!(ok, 0);
        assert_eq!(client.pending_count().await, 0);
        assert!(!client.unavailable().await);
    }

    #[tokio::test]
    async fn test_errors_stay_local_to_request() {
        let server = Arc::new(Server::new(NetworkConfig::default(), Arc::new(demo_router())));
        let client = Client::new(serve_duplex(server), Handshake::new(CodecType::Json))
            .await
            .unwrap();

        let err = client.call::<_, i64>("Arith.Div", &(1i64, 0i64)).await.unwrap_err();
        assert!(matches!(&err, ClientError::Remote(msg) if msg == "divide by zero"));

        let err = client.call::<_, i64>("Arith.Pow", &(1i64, 0i64)).await.unwrap_err();
        assert!(matches!(&err, ClientError::Remote(msg) if msg == "rpc: can't find method Pow"));

        let err = client.call::<_, i64>("Arith.Add", "three").await.unwrap_err();
        assert!(matches!(&err, ClientError::Remote(msg) if msg.starts_with("rpc: invalid argument")));

        let quotient: i64 = client.call("Arith.Div", &(9i64, 3i64)).await.unwrap();
        assert_eq!(quotient, 3);
        assert!(!client.unavailable().await);
    }

    #[tokio::test]
    async fn test_bad_magic_closes_connection() {
        let server = Arc::new(Server::new(NetworkConfig::default(), Arc::new(demo_router())));
        let mut io = serve_duplex(server);

        let handshake = Handshake {
            magic: MAGIC ^ 1,
            codec_type: CodecType::Bincode.name().to_string(),
        };
        send_handshake(&mut io, &handshake).await.unwrap();

        let mut writer = CodecWriter::new(CodecType::Bincode, &mut io);
        let args = Payload::encode(CodecType::Bincode, "hello").unwrap();
        // The server may already have hung up
        let _ = writer.write_message(&Head::new("Echo.Echo", 1), &args).await;

        let mut rest = Vec::new();
        io.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_responses_are_whole_frames() {
        let server = Arc::new(Server::new(NetworkConfig::default(), Arc::new(demo_router())));
        let io = serve_duplex(server);
        let (read_half, mut write_half) = tokio::io::split(io);

        send_handshake(&mut write_half, &Handshake::default()).await.unwrap();
        let mut writer = CodecWriter::new(CodecType::Bincode, write_half);
        for seq in 1..=20u64 {
            let text = "x".repeat(seq as usize * 100);
            let args = Payload::encode(CodecType::Bincode, &(text, seq % 4)).unwrap();
            writer.write_message(&Head::new("Echo.Slow", seq), &args).await.unwrap();
        }

        let mut reader = CodecReader::new(CodecType::Bincode, read_half);
        let mut seen = Vec::new();
        for _ in 0..20 {
            let head = reader.read_head().await.unwrap();
            assert!(!head.is_error());
            let reply: String = reader.read_body().await.unwrap().decode().unwrap();
            assert_eq!(reply.len(), head.seq as usize * 100);
            seen.push(head.seq);
        }

        seen.sort_unstable();
        assert_eq!(seen, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_unreadable_body_gets_error_then_close() {
        let server = Arc::new(Server::new(NetworkConfig::default(), Arc::new(demo_router())));
        let io = serve_duplex(server);
        let (read_half, mut write_half) = tokio::io::split(io);

        send_handshake(&mut write_half, &Handshake::default()).await.unwrap();
        let head = CodecType::Bincode.encode(&Head::new("Echo.Echo", 7)).unwrap();
        write_half.write_u32(head.len() as u32).await.unwrap();
        write_half.write_all(&head).await.unwrap();
        write_half.write_u32(u32::MAX).await.unwrap();
        write_half.flush().await.unwrap();

        let mut reader = CodecReader::new(CodecType::Bincode, read_half);
        let head = reader.read_head().await.unwrap();
        assert_eq!(head.seq, 7);
        assert!(head.error.starts_with("rpc: failed to read argument"));
        reader.discard_body().await.unwrap();

        assert!(reader.read_head().await.unwrap_err().is_eof());
    }

    #[tokio::test]
    async fn test_max_concurrent_requests() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (active.clone(), peak.clone());
        let mut router = Router::new();
        router
            .register(Service::new("Gate").method("Pass", move |n: u32| {
                let (active, peak) = (a.clone(), p.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(n)
                }
            }))
            .unwrap();

        let config = NetworkConfig::default().with_max_concurrent_requests(2);
        let server = Arc::new(Server::new(config, Arc::new(router)));
        let client = Client::new(serve_duplex(server), Handshake::default()).await.unwrap();

        let calls: Vec<_> = (0..8u32)
            .map(|n| client.go::<_, u32>("Gate.Pass", &n, None))
            .collect();
        for (n, call) in calls.into_iter().enumerate() {
            assert_eq!(call.done().await.unwrap().result.unwrap(), n as u32);
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
