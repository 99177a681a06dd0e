//! Live connection handles.
//!
//! A [`Connection`] is the cloneable handle stored in the registry. Writes
//! go through a bounded per-connection queue drained by a dedicated writer
//! task, which is the only code that touches the transport's write half.
//! The read half stays with the dispatch loop as a [`ConnectionReader`].
//!
//! Liveness is measured on the transport: every frame read (heartbeats
//! included) and every message frame written stamps the connection's
//! activity clock. The writer pings on a fixed interval so a live but
//! quiet peer answers with a pong before the idle window runs out.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::transport::{Frame, FrameSink, FrameSource};
use crate::{Message, RelayError, UserId};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Default interval between keepalive pings.
pub const DEFAULT_KEEPALIVE_SECS: u64 = 30;

/// Default time a sender waits on a full outbound queue.
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 5;

/// Process-unique serial number of a connection.
///
/// Distinguishes a replaced connection from its replacement when both
/// belong to the same user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-connection I/O settings.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Frames queued before senders wait.
    pub outbound_buffer: usize,
    /// Ping the peer this often. `None` disables keepalive.
    pub keepalive: Option<Duration>,
    /// Give up on a full outbound queue after this long. `None` waits forever.
    pub write_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            outbound_buffer: 64,
            keepalive: Some(Duration::from_secs(DEFAULT_KEEPALIVE_SECS)),
            write_timeout: Some(Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS)),
        }
    }
}

/// Time of the last transport activity, in milliseconds since open.
#[derive(Debug)]
struct Activity {
    opened: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            opened: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.opened.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.opened.elapsed().saturating_sub(last)
    }
}

/// Shared handle to one live connection.
#[derive(Debug, Clone)]
pub struct Connection {
    user_id: UserId,
    id: ConnectionId,
    outbound: mpsc::Sender<String>,
    write_timeout: Option<Duration>,
    activity: Arc<Activity>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Open a connection over the given transport halves.
    ///
    /// Spawns the writer task and returns the shared handle together with
    /// the read half. The connection's shutdown token is a child of
    /// `parent`, so cancelling the parent closes every connection under it.
    pub fn open<R, W>(
        user_id: UserId,
        source: R,
        sink: W,
        options: &ConnectionOptions,
        parent: &CancellationToken,
    ) -> (Connection, ConnectionReader<R>)
    where
        R: FrameSource,
        W: FrameSink,
    {
        let (tx, rx) = mpsc::channel(options.outbound_buffer.max(1));
        let shutdown = parent.child_token();
        let activity = Arc::new(Activity::new());
        let id = ConnectionId::next();

        tokio::spawn(
            Writer {
                rx,
                shutdown: shutdown.clone(),
                activity: activity.clone(),
                keepalive: options.keepalive.map(keepalive_interval),
                user_id: user_id.clone(),
                id,
            }
            .run(sink),
        );

        let connection = Connection {
            user_id: user_id.clone(),
            id,
            outbound: tx,
            write_timeout: options.write_timeout,
            activity: activity.clone(),
            shutdown,
        };
        let reader = ConnectionReader {
            source,
            user_id,
            activity,
        };
        (connection, reader)
    }

    /// The user this connection belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The connection's serial number.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message for delivery on this connection.
    ///
    /// Each call enqueues exactly one whole frame, so concurrent callers
    /// never interleave. Blocks only the calling task while the queue is
    /// full, for at most the write timeout. Fails with
    /// [`RelayError::TransportClosed`] once the connection is closed.
    pub async fn write_message(&self, message: &Message) -> Result<(), RelayError> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::TransportClosed);
        }
        let frame = message.encode()?;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(RelayError::TransportClosed),
            sent = self.enqueue(frame) => sent,
        }
    }

    async fn enqueue(&self, frame: String) -> Result<(), RelayError> {
        match self.write_timeout {
            Some(limit) => self.outbound.send_timeout(frame, limit).await.map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => RelayError::WriteTimeout(limit),
                mpsc::error::SendTimeoutError::Closed(_) => RelayError::TransportClosed,
            }),
            None => self
                .outbound
                .send(frame)
                .await
                .map_err(|_| RelayError::TransportClosed),
        }
    }

    /// Close the connection. The writer task closes the transport and the
    /// dispatch loop exits on its next suspension point.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Whether the connection has been closed or its writer has gone away.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.outbound.is_closed()
    }

    /// Time since the transport last carried a frame in either direction.
    pub fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }

    /// Token that fires when this connection closes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Read half of a connection, owned by its dispatch loop.
#[derive(Debug)]
pub struct ConnectionReader<R> {
    source: R,
    user_id: UserId,
    activity: Arc<Activity>,
}

impl<R: FrameSource> ConnectionReader<R> {
    /// Read and decode the next message, absorbing heartbeats.
    ///
    /// Fails with [`RelayError::TransportClosed`] when the peer is gone and
    /// [`RelayError::Decode`] when the frame is not a valid message.
    pub async fn read_message(&mut self) -> Result<Message, RelayError> {
        loop {
            match self.source.next_frame().await? {
                Some(Frame::Text(frame)) => {
                    self.activity.touch();
                    return Message::decode(&frame);
                }
                Some(Frame::Heartbeat) => {
                    trace!(user_id = %self.user_id, "Heartbeat");
                    self.activity.touch();
                }
                None => {
                    debug!(user_id = %self.user_id, "Peer closed the stream");
                    return Err(RelayError::TransportClosed);
                }
            }
        }
    }

    /// Time since the transport last carried a frame in either direction.
    pub fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }
}

fn keepalive_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Owns the transport's write half for the life of the connection.
struct Writer {
    rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,
    activity: Arc<Activity>,
    keepalive: Option<Interval>,
    user_id: UserId,
    id: ConnectionId,
}

impl Writer {
    /// Drain the outbound queue into the transport until the connection
    /// closes, pinging between frames.
    async fn run<W: FrameSink>(mut self, mut sink: W) {
        loop {
            let written = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                frame = self.rx.recv() => match frame {
                    Some(frame) => self.write(sink.send_frame(frame), true).await,
                    None => break,
                },
                _ = next_tick(&mut self.keepalive) => {
                    trace!(user_id = %self.user_id, connection = %self.id, "Sending keepalive ping");
                    self.write(sink.send_ping(), false).await
                }
            };

            match written {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    warn!(user_id = %self.user_id, connection = %self.id, error = %e, "Failed to write frame, closing connection");
                    self.shutdown.cancel();
                    break;
                }
                None => break,
            }
        }

        self.rx.close();
        if let Err(e) = sink.close().await {
            debug!(user_id = %self.user_id, connection = %self.id, error = %e, "Error closing transport");
        }
        debug!(user_id = %self.user_id, connection = %self.id, "Writer task stopped");
    }

    /// Run one transport write, abandoning it if the connection closes.
    ///
    /// Pings do not count as activity; only the peer's answer does.
    async fn write<F>(&self, write: F, counts_as_activity: bool) -> Option<Result<(), RelayError>>
    where
        F: std::future::Future<Output = Result<(), RelayError>>,
    {
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            result = write => {
                if counts_as_activity && result.is_ok() {
                    self.activity.touch();
                }
                Some(result)
            }
        }
    }
}
