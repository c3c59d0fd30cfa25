//! CoreRPC Client
//!
//! Issues concurrent calls over a single connection. Calls are matched to
//! responses by sequence number, so responses may arrive in any order.
//!
//! Two locks guard a client:
//! - the send lock owns the codec writer and serializes every write
//! - the state lock guards the sequence counter, the pending table and the
//!   `closing`/`shutdown` flags
//!
//! Whenever both are needed they are taken send lock first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use super::connection::{
    send_handshake, validate_handshake, BoxedReader, BoxedWriter, ConnectionError,
};
use super::NetworkConfig;
use crate::protocol::{CodecError, CodecReader, CodecType, CodecWriter, Handshake, Head, Payload};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection timeout")]
    Timeout,

    /// Error reported by the remote handler
    #[error("{0}")]
    Remote(String),

    #[error("Client is closing or shut down")]
    Shutdown,

    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A completed remote invocation
#[derive(Debug)]
pub struct Call<R> {
    /// Sequence number the call was sent with (0 if it was never sent)
    pub seq: u64,
    pub method: String,
    /// Decoded reply, or why the call failed
    pub result: ClientResult<R>,
}

impl<R> Call<R> {
    pub fn into_result(self) -> ClientResult<R> {
        self.result
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Handle returned by [`Client::go`].
///
/// Holds the completion receiver when `go` allocated the channel itself.
/// When the caller supplied a channel with room for more than one call,
/// completions are delivered there and this handle carries no receiver.
#[derive(Debug)]
pub struct AsyncCall<R> {
    method: String,
    done: Option<mpsc::Receiver<Call<R>>>,
}

impl<R> AsyncCall<R> {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn has_receiver(&self) -> bool {
        self.done.is_some()
    }

    /// Wait for the call to complete.
    ///
    /// Returns `None` if completions go to a caller-supplied channel.
    pub async fn done(mut self) -> Option<Call<R>> {
        match self.done.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    pub fn into_receiver(self) -> Option<mpsc::Receiver<Call<R>>> {
        self.done
    }
}

/// Type-erased completion for one in-flight call.
///
/// Consuming `self` means a registered call can be completed only once.
trait Completion: Send {
    fn complete(self: Box<Self>, seq: u64, outcome: ClientResult<Payload>);
}

struct Completer<R> {
    method: String,
    done: mpsc::Sender<Call<R>>,
}

impl<R: DeserializeOwned + Send + 'static> Completion for Completer<R> {
    fn complete(self: Box<Self>, seq: u64, outcome: ClientResult<Payload>) {
        let Completer { method, done } = *self;
        let result = outcome.and_then(|body| body.decode::<R>().map_err(ClientError::from));
        let call = Call {
            seq,
            method,
            result,
        };

        match done.try_send(call) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(call)) => {
                // Never block the caller of `complete`; hand off to a task
                // that waits for room in the channel.
                tracing::debug!(
                    "Completion channel full, deferring {} (seq {})",
                    call.method,
                    call.seq
                );
                tokio::spawn(async move {
                    if let Err(mpsc::error::SendError(call)) = done.send(call).await {
                        tracing::debug!(
                            "Caller dropped completion for {} (seq {})",
                            call.method,
                            call.seq
                        );
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(call)) => {
                tracing::debug!("Caller dropped completion for {} (seq {})", call.method, call.seq);
            }
        }
    }
}

/// Everything guarded by the state lock
struct ClientState {
    seq: u64,
    /// Caller asked to close
    closing: bool,
    /// Connection failed or was torn down
    shutdown: bool,
    pending: HashMap<u64, Box<dyn Completion>>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            seq: 1,
            closing: false,
            shutdown: false,
            pending: HashMap::new(),
        }
    }

    fn unavailable(&self) -> bool {
        self.closing || self.shutdown
    }

    fn register(&mut self, call: Box<dyn Completion>) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        self.pending.insert(seq, call);
        seq
    }
}

struct Shared {
    codec: CodecType,
    sending: Mutex<CodecWriter<BoxedWriter>>,
    state: Mutex<ClientState>,
}

/// Why the receive loop stopped
enum Termination {
    Closed,
    Lost(String),
}

impl Termination {
    fn error(&self) -> ClientError {
        match self {
            Termination::Closed => ClientError::Shutdown,
            Termination::Lost(reason) => ClientError::ConnectionLost(reason.clone()),
        }
    }
}

/// CoreRPC Client
pub struct Client {
    shared: Arc<Shared>,
    /// Stops the receive loop; dropping the client stops it too
    shutdown_tx: mpsc::Sender<()>,
    completion_capacity: usize,
}

impl Client {
    /// Connect to a server and perform the handshake
    pub async fn dial(addr: &str, handshake: Handshake) -> ClientResult<Self> {
        Self::dial_with_config(addr, handshake, &NetworkConfig::default()).await
    }

    /// Connect with an explicit connect timeout
    pub async fn dial_timeout(
        addr: &str,
        handshake: Handshake,
        timeout: Duration,
    ) -> ClientResult<Self> {
        let config = NetworkConfig::default().with_connect_timeout(timeout);
        Self::dial_with_config(addr, handshake, &config).await
    }

    pub async fn dial_with_config(
        addr: &str,
        handshake: Handshake,
        config: &NetworkConfig,
    ) -> ClientResult<Self> {
        // Unknown codecs fail before any connection is made
        validate_handshake(&handshake)?;

        tracing::info!("Connecting to {}", addr);

        let stream = match tokio::time::timeout(
            Duration::from_millis(config.connect_timeout_ms),
            TcpStream::connect(addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientError::Io(e)),
            Err(_) => return Err(ClientError::Timeout),
        };
        stream.set_nodelay(true)?;

        Self::with_config(stream, handshake, config).await
    }

    /// Run a client over an already connected stream
    pub async fn new<S>(stream: S, handshake: Handshake) -> ClientResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(stream, handshake, &NetworkConfig::default()).await
    }

    pub async fn with_config<S>(
        stream: S,
        handshake: Handshake,
        config: &NetworkConfig,
    ) -> ClientResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = validate_handshake(&handshake)?;
        let (read_half, mut write_half) = tokio::io::split(stream);

        if let Err(e) = send_handshake(&mut write_half, &handshake).await {
            let _ = write_half.shutdown().await;
            return Err(e.into());
        }

        let reader: BoxedReader = Box::pin(read_half);
        let writer: BoxedWriter = Box::pin(write_half);

        let shared = Arc::new(Shared {
            codec,
            sending: Mutex::new(CodecWriter::new(codec, writer)),
            state: Mutex::new(ClientState::new()),
        });

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(receive(
            shared.clone(),
            CodecReader::new(codec, BufReader::new(reader)),
            shutdown_rx,
        ));

        tracing::debug!("Client ready (codec {})", codec);

        Ok(Self {
            shared,
            shutdown_tx,
            completion_capacity: config.completion_capacity.max(2),
        })
    }

    /// Codec negotiated for this connection
    pub fn codec(&self) -> CodecType {
        self.shared.codec
    }

    /// Start a call without waiting for it.
    ///
    /// A missing completion channel, or one with capacity 1, is replaced by
    /// a larger channel whose receiver is returned in the handle. Must be
    /// called from within a tokio runtime.
    pub fn go<A, R>(
        &self,
        method: &str,
        args: &A,
        done: Option<mpsc::Sender<Call<R>>>,
    ) -> AsyncCall<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let (done, receiver) = match done {
            Some(tx) if tx.max_capacity() > 1 => (tx, None),
            _ => {
                let (tx, rx) = mpsc::channel(self.completion_capacity);
                (tx, Some(rx))
            }
        };

        let completion = Box::new(Completer {
            method: method.to_string(),
            done,
        });

        match Payload::encode(self.shared.codec, args) {
            Ok(body) => {
                tokio::spawn(send(
                    self.shared.clone(),
                    method.to_string(),
                    body,
                    completion,
                ));
            }
            Err(e) => completion.complete(0, Err(e.into())),
        }

        AsyncCall {
            method: method.to_string(),
            done: receiver,
        }
    }

    /// Call a remote method and wait for its reply
    pub async fn call<A, R>(&self, method: &str, args: &A) -> ClientResult<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        match self.go::<A, R>(method, args, None).done().await {
            Some(call) => call.result,
            None => Err(ClientError::ConnectionLost(
                "call dropped before completion".to_string(),
            )),
        }
    }

    /// Like [`Client::call`], giving up after `timeout`.
    ///
    /// A timed out call stays in the pending table until its response
    /// arrives or the connection fails.
    pub async fn call_timeout<A, R>(
        &self,
        method: &str,
        args: &A,
        timeout: Duration,
    ) -> ClientResult<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        match tokio::time::timeout(timeout, self.call(method, args)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Close the connection. Fails if the client is already closing or shut down.
    pub async fn close(&self) -> ClientResult<()> {
        {
            let mut state = self.shared.state.lock().await;
            if state.unavailable() {
                return Err(ClientError::Shutdown);
            }
            state.closing = true;
        }

        tracing::info!("Closing client");

        let _ = self.shutdown_tx.try_send(());
        self.shared.sending.lock().await.close().await?;
        Ok(())
    }

    /// Whether the client was closed or its connection failed
    pub async fn unavailable(&self) -> bool {
        self.shared.state.lock().await.unavailable()
    }

    /// Number of calls waiting for a response
    pub async fn pending_count(&self) -> usize {
        self.shared.state.lock().await.pending.len()
    }
}

/// Send path, one task per call
async fn send(shared: Arc<Shared>, method: String, body: Payload, completion: Box<dyn Completion>) {
    let mut writer = shared.sending.lock().await;

    let registered = {
        let mut state = shared.state.lock().await;
        if state.unavailable() {
            Err(completion)
        } else {
            Ok(state.register(completion))
        }
    };

    let seq = match registered {
        Ok(seq) => seq,
        Err(completion) => {
            completion.complete(0, Err(ClientError::Shutdown));
            return;
        }
    };

    let head = Head::new(method, seq);
    if let Err(e) = writer.write_message(&head, &body).await {
        tracing::debug!("Failed to send {} (seq {}): {}", head.method, seq, e);
        let call = shared.state.lock().await.pending.remove(&seq);
        if let Some(call) = call {
            call.complete(seq, Err(e.into()));
        }
    }
}

/// Receive path, one task per connection
async fn receive(
    shared: Arc<Shared>,
    mut reader: CodecReader<BufReader<BoxedReader>>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let termination = loop {
        let head = tokio::select! {
            result = reader.read_head() => match result {
                Ok(head) => head,
                Err(e) if e.is_eof() => break Termination::Lost("connection closed by peer".to_string()),
                Err(e) => break Termination::Lost(e.to_string()),
            },
            _ = shutdown_rx.recv() => break Termination::Closed,
        };

        let call = shared.state.lock().await.pending.remove(&head.seq);

        // Every response carries exactly one body, error responses included
        let body = match reader.read_body().await {
            Ok(body) => body,
            Err(e) => {
                let reason = e.to_string();
                if let Some(call) = call {
                    call.complete(head.seq, Err(e.into()));
                }
                break Termination::Lost(reason);
            }
        };

        match call {
            None => {
                tracing::debug!("Discarding response for unknown seq {}", head.seq);
            }
            Some(call) if head.is_error() => {
                call.complete(head.seq, Err(ClientError::Remote(head.error)));
            }
            Some(call) => call.complete(head.seq, Ok(body)),
        }
    };

    terminate_calls(&shared, termination).await;
}

/// Fail every pending call after the connection ended
async fn terminate_calls(shared: &Shared, termination: Termination) {
    let mut writer = shared.sending.lock().await;
    let mut state = shared.state.lock().await;

    state.shutdown = true;
    let pending = std::mem::take(&mut state.pending);

    match &termination {
        Termination::Closed => tracing::debug!("Client closed, failing {} pending calls", pending.len()),
        Termination::Lost(reason) => {
            tracing::info!("Connection lost ({}), failing {} pending calls", reason, pending.len())
        }
    }

    for (seq, call) in pending {
        call.complete(seq, Err(termination.error()));
    }

    let _ = writer.close().await;
}
