//! WebSocket Session I/O
//!
//! A [`WsSession`] owns one established WebSocket connection through two
//! dedicated tasks: a read pump and a write pump. Callers never touch the
//! socket; every `read`/`write` is a request queued to the owning pump and
//! answered over a oneshot channel. The write pump also sends keepalive pings,
//! and the read pump tears the session down when the peer stops answering.
//!
//! Lifecycle is `Active -> Closing -> Closed`. Teardown is triggered by a
//! transport error, a read deadline expiry, the peer closing, or [`WsSession::close`],
//! and it is terminal.

mod pump;


use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Session error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session has been torn down
    Closed,
    /// Read or write deadline expired
    Timeout,
    /// Underlying WebSocket failure
    Transport(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Closed => write!(f, "Session closed"),
            SessionError::Timeout => write!(f, "Session timed out"),
            SessionError::Transport(e) => write!(f, "Transport error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match e {
            Error::ConnectionClosed | Error::AlreadyClosed => SessionError::Closed,
            other => SessionError::Transport(other.to_string()),
        }
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Both pumps running
    Active,
    /// Teardown triggered, pumps exiting
    Closing,
    /// Both pumps have exited
    Closed,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Active,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Session timing and queue options
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Idle time allowed between data frames
    pub read_timeout: Duration,
    /// Deadline for each physical write
    pub write_timeout: Duration,
    /// Keepalive ping interval
    pub ping_interval: Duration,
    /// Capacity of each pump's request queue, and of the inbound frame buffer
    pub queue_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(15),
            ping_interval: Duration::from_secs(30),
            queue_capacity: 64,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Request served by the read pump
enum ReadRequest {
    /// Up to `max` bytes of the byte stream
    Bytes { max: usize, reply: Reply<Bytes> },
    /// Remainder of the current frame, or the next whole frame
    Frame { reply: Reply<Bytes> },
}

impl ReadRequest {
    fn fail(self, err: SessionError) {
        let reply = match self {
            ReadRequest::Bytes { reply, .. } | ReadRequest::Frame { reply } => reply,
        };
        let _ = reply.send(Err(err));
    }
}

/// Request served by the write pump
struct WriteRequest {
    data: Bytes,
    reply: Reply<usize>,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// State shared between the handle and both pumps
struct Shared {
    id: u64,
    state: AtomicU8,
    /// Pumps still running
    pumps: AtomicUsize,
    pings: AtomicU64,
    pongs: AtomicU64,
    teardown: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

impl Shared {
    fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == SessionState::Active as u8
    }

    /// Begin teardown. Safe to call any number of times from anywhere.
    fn teardown(&self) {
        if self
            .state
            .compare_exchange(
                SessionState::Active as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            debug!(session = self.id, "Session closing");
            self.teardown.send_replace(true);
        }
    }

    /// Called once by each pump on exit
    fn pump_exited(&self) {
        if self.pumps.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state
                .store(SessionState::Closed as u8, Ordering::Release);
            self.done.send_replace(true);
            debug!(session = self.id, "Session closed");
        }
    }
}

/// Handle to a WebSocket session. Cheap to clone; all clones share the
/// same pumps.
#[derive(Clone)]
pub struct WsSession {
    reads: mpsc::Sender<ReadRequest>,
    writes: mpsc::Sender<WriteRequest>,
    shared: Arc<Shared>,
}

impl WsSession {
    /// Start the pumps for an established WebSocket connection
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S>(ws: WebSocketStream<S>, options: SessionOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let capacity = options.queue_capacity.max(1);
        let (reads, read_rx) = mpsc::channel(capacity);
        let (writes, write_rx) = mpsc::channel(capacity);
        let (teardown, _) = watch::channel(false);
        let (done, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(SessionState::Active as u8),
            pumps: AtomicUsize::new(2),
            pings: AtomicU64::new(0),
            pongs: AtomicU64::new(0),
            teardown,
            done,
        });

        let (sink, stream) = ws.split();
        tokio::spawn(pump::read_pump(
            stream,
            read_rx,
            shared.clone(),
            shared.teardown.subscribe(),
            options.clone(),
        ));
        tokio::spawn(pump::write_pump(
            sink,
            write_rx,
            shared.clone(),
            shared.teardown.subscribe(),
            options,
        ));

        debug!(session = shared.id, "Session started");
        Self {
            reads,
            writes,
            shared,
        }
    }

    /// Process-unique session id, used in logs
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Read up to `max` bytes
    ///
    /// Frames are treated as one byte stream; the unread remainder of a frame
    /// is kept for the next call.
    pub async fn read(&self, max: usize) -> Result<Bytes, SessionError> {
        self.read_request(|reply| ReadRequest::Bytes { max, reply })
            .await
    }

    /// Read the rest of the current frame, or the next whole frame
    pub async fn read_frame(&self) -> Result<Bytes, SessionError> {
        self.read_request(|reply| ReadRequest::Frame { reply }).await
    }

    async fn read_request<F>(&self, make: F) -> Result<Bytes, SessionError>
    where
        F: FnOnce(Reply<Bytes>) -> ReadRequest,
    {
        if !self.shared.is_active() {
            return Err(SessionError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.reads
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Write `data` as one binary frame. Returns the number of bytes written.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<usize, SessionError> {
        if !self.shared.is_active() {
            return Err(SessionError::Closed);
        }
        let (reply, rx) = oneshot::channel();
        self.writes
            .send(WriteRequest {
                data: data.into(),
                reply,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Tear the session down and wait for both pumps to exit
    pub async fn close(&self) {
        self.shared.teardown();
        self.wait().await;
    }

    /// Wait until both pumps have exited
    pub async fn wait(&self) {
        let mut done = self.shared.done.subscribe();
        // The sender lives in `shared`, so this only ends on `true`
        let _ = done.wait_for(|closed| *closed).await;
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// True once teardown has begun
    pub fn is_closed(&self) -> bool {
        !self.shared.is_active()
    }

    /// Keepalive pings sent
    pub fn pings(&self) -> u64 {
        self.shared.pings.load(Ordering::Relaxed)
    }

    /// Pongs received from the peer
    pub fn pongs(&self) -> u64 {
        self.shared.pongs.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for WsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsSession")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Frame-oriented duplex connection capability
///
/// Peers and service workers are both served through this trait; what kind
/// of endpoint a connection is lives in the relay's metadata, not here.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Next inbound frame
    async fn read_frame(&self) -> Result<Bytes, SessionError>;

    /// Send one outbound frame
    async fn write(&self, data: Bytes) -> Result<usize, SessionError>;

    fn is_closed(&self) -> bool;

    /// Close the connection and wait for it to finish
    async fn close(&self);
}

#[async_trait]
impl Connection for WsSession {
    async fn read_frame(&self) -> Result<Bytes, SessionError> {
        WsSession::read_frame(self).await
    }

    async fn write(&self, data: Bytes) -> Result<usize, SessionError> {
        WsSession::write(self, data).await
    }

    fn is_closed(&self) -> bool {
        WsSession::is_closed(self)
    }

    async fn close(&self) {
        WsSession::close(self).await
    }
}
