//! Per-connection dispatch loop and message delivery.
//!
//! Each live connection runs one loop:
//!
//! `Registered -> Reading -> (Delivering | Idle) -> Reading -> ... -> Closed`
//!
//! A message read from the sender is appended to the durable store and the
//! recent-message log (both best-effort), then written to the recipient's
//! connection if the recipient is registered. Messages from one sender are
//! delivered in the order they were read; nothing is promised across
//! senders.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, trace, warn, Instrument};

use crate::cache::{advisory, SessionCache};
use crate::connection::{
    Connection, ConnectionId, ConnectionOptions, ConnectionReader, DEFAULT_KEEPALIVE_SECS,
    DEFAULT_WRITE_TIMEOUT_SECS,
};
use crate::registry::ConnectionRegistry;
use crate::store::DurableStore;
use crate::transport::{FrameSink, FrameSource};
use crate::{Message, RelayError, UserId};

/// Default outbound queue depth per connection.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// Default idle timeout (5 minutes).
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Relay tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Frames queued per connection before senders wait.
    pub outbound_buffer: usize,
    /// Close a connection whose transport carries nothing in either
    /// direction for this long. `None` disables.
    pub idle_timeout: Option<Duration>,
    /// Ping interval on every connection. `None` disables.
    pub keepalive: Option<Duration>,
    /// How long a sender waits on a recipient's full queue before the
    /// recipient is treated as failed. `None` waits forever.
    pub write_timeout: Option<Duration>,
}

impl RelayConfig {
    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            outbound_buffer: self.outbound_buffer,
            keepalive: self.keepalive,
            write_timeout: self.write_timeout,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            idle_timeout: Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)),
            keepalive: Some(Duration::from_secs(DEFAULT_KEEPALIVE_SECS)),
            write_timeout: Some(Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS)),
        }
    }
}

/// Outcome of delivering one message to its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the recipient's live connection.
    Delivered,
    /// The recipient is not connected. Not an error; the message is dropped
    /// from live delivery.
    RecipientOffline,
    /// The recipient was registered but its transport had failed or its
    /// queue stayed full past the write deadline.
    RecipientUnavailable,
}

/// States of a dispatch loop, observable through [`ConnectionTask::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Registered, loop not started.
    Registered,
    /// Waiting for the next message from the peer.
    Reading,
    /// Writing to a recipient that is connected.
    Delivering,
    /// The last message had no connected recipient.
    Idle,
    /// The loop has exited and the connection is unregistered.
    Closed,
}

/// Why a dispatch loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the transport.
    PeerClosed,
    /// The peer sent something that is not a message.
    Decode(String),
    /// The transport failed.
    Transport(String),
    /// Nothing arrived within the idle window.
    IdleTimeout,
    /// The connection was closed locally (replacement, shutdown, writer failure).
    Cancelled,
}

impl From<RelayError> for CloseReason {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::TransportClosed => CloseReason::PeerClosed,
            RelayError::Decode(msg) => CloseReason::Decode(msg),
            RelayError::Transport(msg) => CloseReason::Transport(msg),
            err @ (RelayError::Encode(_) | RelayError::WriteTimeout(_)) => {
                CloseReason::Transport(err.to_string())
            }
            RelayError::IdleTimeout => CloseReason::IdleTimeout,
            RelayError::Cancelled => CloseReason::Cancelled,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::Decode(msg) => write!(f, "decode error: {}", msg),
            CloseReason::Transport(msg) => write!(f, "transport error: {}", msg),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// What a finished dispatch loop did.
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    /// Messages read from the peer
    pub received: u64,
    /// Messages written to a live recipient
    pub delivered: u64,
    /// Messages whose recipient was offline or unavailable
    pub missed: u64,
    pub reason: CloseReason,
}

/// The delivery engine: registry plus collaborators.
///
/// Cheap to clone; every clone shares the same registry and shutdown token.
#[derive(Clone)]
pub struct Relay {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn SessionCache>,
    config: RelayConfig,
    shutdown: CancellationToken,
}

impl Relay {
    /// Create a new relay over the given registry and collaborators.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn SessionCache>,
        config: RelayConfig,
    ) -> Self {
        Self {
            registry,
            store,
            cache,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// The registry this relay delivers through.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Relay-wide token; every connection's token is a child of it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close every live connection and refuse to keep loops running.
    pub fn shutdown(&self) {
        info!(
            connections = self.registry.connection_count(),
            "Shutting down relay"
        );
        self.shutdown.cancel();
        self.registry.close_all();
    }

    /// Open and register a connection for `user_id`.
    ///
    /// Registration is complete when this returns; drive the returned task
    /// to run the dispatch loop.
    pub fn connect<R, W>(&self, user_id: UserId, source: R, sink: W) -> ConnectionTask<R>
    where
        R: FrameSource,
        W: FrameSink,
    {
        let (connection, reader) = Connection::open(
            user_id.clone(),
            source,
            sink,
            &self.config.connection_options(),
            &self.shutdown,
        );
        self.registry.register(user_id, connection.clone());
        let (state, _) = watch::channel(DispatchState::Registered);
        ConnectionTask {
            relay: self.clone(),
            connection,
            reader,
            state,
        }
    }

    /// Register a connection and run its dispatch loop as a new task.
    pub fn spawn_connection<R, W>(
        &self,
        user_id: UserId,
        source: R,
        sink: W,
    ) -> JoinHandle<ConnectionSummary>
    where
        R: FrameSource,
        W: FrameSink,
    {
        let task = self.connect(user_id, source, sink);
        let span = info_span!(
            "relay.connection",
            user_id = %task.connection.user_id(),
            connection = %task.connection.id(),
        );
        tokio::spawn(task.run().instrument(span))
    }

    /// Persist, record and deliver one message read from a sender.
    ///
    /// Store and cache failures are logged and never affect delivery.
    #[instrument(skip(self, message), fields(from = message.sender_id, to = message.recipient_id))]
    pub async fn dispatch(&self, message: Message) -> Delivery {
        self.record(&message).await;
        self.deliver(&message).await
    }

    /// Write a message to its recipient's live connection, if any.
    pub async fn deliver(&self, message: &Message) -> Delivery {
        match self.registry.lookup(&message.recipient()) {
            Some(connection) => self.deliver_to(&connection, message).await,
            None => {
                log_offline(message);
                Delivery::RecipientOffline
            }
        }
    }

    /// Persist a message and push it onto the recent log, best-effort.
    async fn record(&self, message: &Message) {
        if let Err(e) = self.store.insert_message(message).await {
            warn!(error = %e, "Failed to persist relayed message, delivering anyway");
        }

        match message.encode() {
            Ok(entry) => {
                advisory(
                    self.cache.push_recent(entry).await,
                    "record recent message",
                );
            }
            Err(e) => debug!(error = %e, "Skipping recent-message record"),
        }
    }

    async fn deliver_to(&self, connection: &Connection, message: &Message) -> Delivery {
        let recipient = connection.user_id();
        match connection.write_message(message).await {
            Ok(()) => {
                debug!(recipient = %recipient, connection = %connection.id(), "Message delivered");
                Delivery::Delivered
            }
            Err(e) => {
                warn!(
                    recipient = %recipient,
                    connection = %connection.id(),
                    error = %e,
                    "Failed to write to recipient, treating its transport as failed"
                );
                connection.close();
                Delivery::RecipientUnavailable
            }
        }
    }

    /// Read the next message, giving up once the transport has been quiet
    /// in both directions for the idle window.
    async fn read_next<R: FrameSource>(
        &self,
        reader: &mut ConnectionReader<R>,
    ) -> Result<Message, RelayError> {
        let Some(idle) = self.config.idle_timeout else {
            return reader.read_message().await;
        };

        loop {
            let quiet = reader.idle_for();
            if quiet >= idle {
                return Err(RelayError::IdleTimeout);
            }
            // Outbound writes and heartbeats move the deadline, so re-check
            // on expiry instead of failing outright.
            if let Ok(read) = tokio::time::timeout(idle - quiet, reader.read_message()).await {
                return read;
            }
        }
    }
}

fn log_offline(message: &Message) {
    info!(
        recipient = message.recipient_id,
        "Recipient not connected, message dropped from live delivery"
    );
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

/// A registered connection whose dispatch loop has not run yet.
pub struct ConnectionTask<R> {
    relay: Relay,
    connection: Connection,
    reader: ConnectionReader<R>,
    state: watch::Sender<DispatchState>,
}

impl<R: FrameSource> ConnectionTask<R> {
    /// The registered connection handle.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Watch the loop's state as it runs.
    pub fn state(&self) -> watch::Receiver<DispatchState> {
        self.state.subscribe()
    }

    /// Run the dispatch loop until the connection closes, then unregister.
    pub async fn run(mut self) -> ConnectionSummary {
        let user_id = self.connection.user_id().clone();
        let connection_id = self.connection.id();
        let token = self.connection.shutdown_token();
        info!(user_id = %user_id, connection = %connection_id, "Dispatch loop started");

        let mut received = 0;
        let mut delivered = 0;
        let mut missed = 0;

        let reason = loop {
            self.transition(DispatchState::Reading);
            let read = tokio::select! {
                biased;
                _ = token.cancelled() => Err(RelayError::Cancelled),
                read = self.relay.read_next(&mut self.reader) => read,
            };

            let message = match read {
                Ok(message) => message,
                Err(e) => {
                    if !e.is_closed() {
                        warn!(user_id = %user_id, error = %e, "Closing connection after read failure");
                    }
                    break CloseReason::from(e);
                }
            };

            received += 1;
            if message.sender() != user_id {
                debug!(
                    user_id = %user_id,
                    claimed_sender = message.sender_id,
                    "Message sender differs from connection identity"
                );
            }

            self.relay.record(&message).await;
            match self.relay.registry.lookup(&message.recipient()) {
                Some(recipient) => {
                    self.transition(DispatchState::Delivering);
                    match self.relay.deliver_to(&recipient, &message).await {
                        Delivery::Delivered => delivered += 1,
                        _ => missed += 1,
                    }
                }
                None => {
                    self.transition(DispatchState::Idle);
                    log_offline(&message);
                    missed += 1;
                }
            }
        };

        self.relay
            .registry
            .unregister_connection(&user_id, connection_id);
        self.connection.close();
        self.transition(DispatchState::Closed);

        info!(
            user_id = %user_id,
            connection = %connection_id,
            received,
            delivered,
            missed,
            reason = %reason,
            "Dispatch loop stopped"
        );

        ConnectionSummary {
            user_id,
            connection_id,
            received,
            delivered,
            missed,
            reason,
        }
    }

    fn transition(&self, next: DispatchState) {
        let previous = self.state.send_replace(next);
        trace!(from = ?previous, to = ?next, "Dispatch state transition");
    }
}
