//! A single live client session.
//!
//! ```text
//!              ┌──────────── Connection ────────────┐
//!  Hub ──send──► outbound queue (bounded, drop-full) ├──► write pump ──► socket
//!              └────────────────────────────────────┘       (pings every ping_interval)
//!  socket ──► read pump ── read deadline ── rate limiter ──► Router
//! ```
//!
//! The read pump is the only place a session blocks, and only up to
//! `read_deadline`. Delivery into the outbound queue never blocks.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::hub::Hub;
use crate::protocol::{Envelope, Payload};
use crate::router::Router;

/// Authenticated identity behind a connection.
pub type UserId = Uuid;

/// Fixed message budget per fixed window.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_messages: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_messages: 30,
            window: Duration::from_secs(60),
        }
    }
}

/// Per-connection frame counter.
///
/// Owned by the read pump, so it needs no synchronisation.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    count: u32,
    window_start: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Count one frame now. Returns `false` once the budget is exceeded.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Count one frame received at `now`.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) >= self.config.window {
            self.window_start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count <= self.config.max_messages
    }

    /// Frames counted in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Per-session transport settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Outbound queue capacity
    pub send_buffer: usize,
    /// Inbound frame budget
    pub rate_limit: RateLimitConfig,
    /// Close the session if no frame arrives within this long
    pub read_deadline: Duration,
    /// Interval between server pings; must be shorter than `read_deadline`
    pub ping_interval: Duration,
    /// Upper bound on a single socket write
    pub write_deadline: Duration,
    /// Largest accepted inbound message in bytes
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_buffer: 256,
            rate_limit: RateLimitConfig::default(),
            read_deadline: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            write_deadline: Duration::from_secs(10),
            max_message_size: 512 * 1024,
        }
    }
}

/// A connected user's outbound side, shared between the hub and the
/// session's write pump.
pub struct Connection {
    conn_id: Uuid,
    user_id: UserId,
    outbound: Mutex<Option<mpsc::Sender<Payload>>>,
    dropped: AtomicU64,
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue.
    pub fn new(user_id: UserId, send_buffer: usize) -> (Arc<Self>, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(send_buffer.max(1));
        let conn = Arc::new(Self {
            conn_id: Uuid::new_v4(),
            user_id,
            outbound: Mutex::new(Some(tx)),
            dropped: AtomicU64::new(0),
        });
        (conn, rx)
    }

    /// Unique id of this session; a user may have had many.
    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Queue a payload without waiting.
    ///
    /// Returns `false` if the queue is full (the payload is dropped) or the
    /// connection is closed.
    pub fn send(&self, payload: Payload) -> bool {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return false;
        };
        match tx.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Outbound queue full for user {} (conn {}), dropping message",
                    self.user_id,
                    self.conn_id
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Close the outbound queue. The write pump flushes what is already
    /// queued, sends a Close frame and exits. Returns `true` on the first call.
    pub fn close(&self) -> bool {
        self.outbound.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    /// Deliveries dropped because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer closed the socket or sent a Close frame
    Closed,
    /// No frame within the read deadline
    ReadTimeout,
    /// Inbound frame budget exceeded
    RateLimited,
    /// Transport error on read
    ReadError,
    /// Write pump stopped (write error, deadline, or queue closed by the hub)
    WriterStopped,
}

/// Run one authenticated session to completion.
///
/// Registers the connection with the hub, pumps frames both ways, and
/// unregisters it when either side stops.
pub async fn serve_connection<S>(
    ws: WebSocketStream<S>,
    user_id: UserId,
    hub: Hub,
    router: Arc<Router>,
    config: ConnectionConfig,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (conn, outbound_rx) = Connection::new(user_id, config.send_buffer);
    hub.register_client(conn.clone());

    let (sink, mut stream) = ws.split();
    let mut writer = tokio::spawn(write_pump(sink, outbound_rx, config.clone()));
    let mut limiter = RateLimiter::new(config.rate_limit.clone());

    let end = loop {
        let next = tokio::select! {
            _ = &mut writer => break SessionEnd::WriterStopped,
            next = tokio::time::timeout(config.read_deadline, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                log::info!("Read deadline exceeded for user {user_id}, closing");
                break SessionEnd::ReadTimeout;
            }
            Ok(None) => break SessionEnd::Closed,
            Ok(Some(Err(e))) => {
                log::debug!("WebSocket error for user {user_id}: {e}");
                break SessionEnd::ReadError;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let data: &[u8] = match &frame {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(bytes) => bytes.as_ref(),
            Message::Close(_) => break SessionEnd::Closed,
            // Control frames only prove liveness.
            _ => continue,
        };

        if !limiter.allow() {
            log::warn!(
                "User {user_id} exceeded {} messages per {:?}, disconnecting",
                config.rate_limit.max_messages,
                config.rate_limit.window
            );
            break SessionEnd::RateLimited;
        }

        match Envelope::decode(data) {
            Ok(envelope) => router.dispatch(&hub, &conn, envelope),
            Err(e) => log::warn!("Malformed frame from user {user_id}: {e}"),
        }
    };

    hub.unregister_client(conn.clone());
    // The hub closes the queue too; closing here lets the writer finish even
    // if the hub loop has already shut down.
    conn.close();
    if !writer.is_finished() {
        let _ = tokio::time::timeout(config.write_deadline, &mut writer).await;
    }

    log::debug!("Session for user {user_id} (conn {}) ended: {end:?}", conn.conn_id());
    end
}

async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<Payload>,
    config: ConnectionConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = tokio::time::Instant::now() + config.ping_interval;
    let mut ping = tokio::time::interval_at(start, config.ping_interval);

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(payload) => {
                    if !write_frame(&mut sink, frame_for(&payload), config.write_deadline).await {
                        break;
                    }
                }
                None => {
                    let _ = write_frame(&mut sink, Message::Close(None), config.write_deadline).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if !write_frame(&mut sink, Message::Ping(Default::default()), config.write_deadline).await {
                    break;
                }
            }
        }
    }
}

async fn write_frame<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    frame: Message,
    deadline: Duration,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(deadline, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::debug!("WebSocket write failed: {e}");
            false
        }
        Err(_) => {
            log::info!("Write deadline exceeded, closing session");
            false
        }
    }
}

/// JSON payloads go out as text frames; anything else as binary.
fn frame_for(payload: &Payload) -> Message {
    match std::str::from_utf8(payload) {
        Ok(text) => Message::text(text.to_owned()),
        Err(_) => Message::binary(payload.to_vec()),
    }
}
