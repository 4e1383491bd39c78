//! Read and write pumps. Each session runs exactly one of each; they are
//! the only code that touches the socket.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

use super::{ReadRequest, SessionError, SessionOptions, Shared, WriteRequest};

/// Serve queued read requests from the inbound frame stream
///
/// Data frames are buffered, up to `queue_capacity` of them. The stream is
/// polled whenever the buffer has room, so pongs and close frames are
/// observed even when no caller is reading. While the buffer is full the
/// read deadline is suspended: the slow side is the local reader.
pub(super) async fn read_pump<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    mut requests: mpsc::Receiver<ReadRequest>,
    shared: Arc<Shared>,
    mut teardown: watch::Receiver<bool>,
    options: SessionOptions,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let capacity = options.queue_capacity.max(1);
    let mut buffered: VecDeque<Bytes> = VecDeque::with_capacity(capacity);
    let mut waiter: Option<ReadRequest> = None;
    let mut deadline = Instant::now() + options.ping_interval + options.read_timeout;

    let err = loop {
        if waiter.is_some() && !buffered.is_empty() {
            let full = buffered.len() >= capacity;
            if let (Some(request), Some(data)) = (waiter.take(), buffered.pop_front()) {
                if let Some(rest) = serve(request, data) {
                    buffered.push_front(rest);
                }
            }
            if full && buffered.len() < capacity {
                // Reading resumes; the peer gets a fresh read window
                deadline = deadline.max(Instant::now() + options.read_timeout);
            }
            continue;
        }
        if !shared.is_active() {
            break SessionError::Closed;
        }
        let has_room = buffered.len() < capacity;

        tokio::select! {
            biased;

            _ = teardown.changed() => break SessionError::Closed,

            _ = time::sleep_until(deadline), if has_room => {
                debug!(session = shared.id, "Read deadline expired");
                break SessionError::Timeout;
            }

            request = requests.recv(), if waiter.is_none() => match request {
                Some(request) => waiter = Some(request),
                // Every handle is gone
                None => break SessionError::Closed,
            },

            frame = stream.next(), if has_room => match frame {
                Some(Ok(Message::Binary(data))) => {
                    deadline = deadline.max(Instant::now() + options.read_timeout);
                    if !data.is_empty() {
                        buffered.push_back(Bytes::from(data));
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    deadline = deadline.max(Instant::now() + options.read_timeout);
                    if !text.is_empty() {
                        buffered.push_back(Bytes::from(text.into_bytes()));
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    shared.pongs.fetch_add(1, Ordering::Relaxed);
                    deadline = deadline
                        .max(Instant::now() + options.ping_interval + options.read_timeout);
                    trace!(session = shared.id, "Pong received");
                }
                // Pings are answered by tungstenite itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(session = shared.id, ?frame, "Peer closed session");
                    break SessionError::Closed;
                }
                Some(Err(e)) => {
                    debug!(session = shared.id, "Read error: {}", e);
                    break SessionError::from(e);
                }
                None => break SessionError::Closed,
            },
        }
    };

    if let Some(request) = waiter.take() {
        request.fail(err);
    }
    shared.teardown();

    requests.close();
    while let Ok(request) = requests.try_recv() {
        request.fail(SessionError::Closed);
    }
    shared.pump_exited();
}

/// Answer one read request from a buffered frame. Returns what is left of
/// the frame.
fn serve(request: ReadRequest, mut data: Bytes) -> Option<Bytes> {
    let (reply, rest) = match request {
        ReadRequest::Bytes { max, reply } => {
            let rest = (data.len() > max).then(|| data.split_off(max));
            (reply, rest)
        }
        ReadRequest::Frame { reply } => (reply, None),
    };

    match reply.send(Ok(data)) {
        Ok(()) => rest,
        // Caller went away; keep the bytes for the next reader
        Err(Ok(mut data)) => {
            if let Some(rest) = rest {
                let mut joined = Vec::with_capacity(data.len() + rest.len());
                joined.extend_from_slice(&data);
                joined.extend_from_slice(&rest);
                data = Bytes::from(joined);
            }
            Some(data)
        }
        Err(Err(_)) => rest,
    }
}

/// Serialize queued writes onto the sink and send keepalive pings
pub(super) async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut requests: mpsc::Receiver<WriteRequest>,
    shared: Arc<Shared>,
    mut teardown: watch::Receiver<bool>,
    options: SessionOptions,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ticker = time::interval_at(
        Instant::now() + options.ping_interval,
        options.ping_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if !shared.is_active() {
            break;
        }

        tokio::select! {
            biased;

            _ = teardown.changed() => break,

            request = requests.recv() => {
                let Some(WriteRequest { data, reply }) = request else {
                    break;
                };
                let len = data.len();
                match send(&mut sink, Message::Binary(data.to_vec()), &options).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(len));
                    }
                    Err(e) => {
                        debug!(session = shared.id, "Write error: {}", e);
                        let _ = reply.send(Err(e));
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                match send(&mut sink, Message::Ping(Vec::new()), &options).await {
                    Ok(()) => {
                        shared.pings.fetch_add(1, Ordering::Relaxed);
                        trace!(session = shared.id, "Ping sent");
                    }
                    Err(e) => {
                        debug!(session = shared.id, "Ping failed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    shared.teardown();

    requests.close();
    while let Ok(request) = requests.try_recv() {
        let _ = request.reply.send(Err(SessionError::Closed));
    }

    // Best effort close frame
    let _ = time::timeout(options.write_timeout, sink.close()).await;
    shared.pump_exited();
}

async fn send<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    message: Message,
    options: &SessionOptions,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match time::timeout(options.write_timeout, sink.send(message)).await {
        Ok(result) => result.map_err(SessionError::from),
        Err(_) => Err(SessionError::Timeout),
    }
}
