//! Connection Registry implementation.
//!
//! Tracks live connections by user id for direct-message delivery.

use std::fmt;

use dashmap::DashMap;
use tracing::{debug, info, instrument};

use crate::connection::{Connection, ConnectionId};
use crate::UserId;

/// Registry of live connections.
///
/// Maps each user id to at most one [`Connection`]. Uses DashMap, whose
/// shards are reader/writer locked: lookups run concurrently with each
/// other and only wait on a register or unregister touching the same shard.
///
/// The registry is an owned value shared by `Arc`; tests build as many
/// independent registries as they need.
///
/// ## Usage
///
/// ```ignore
/// let registry = ConnectionRegistry::new();
///
/// // When a connection is established:
/// registry.register(user_id.clone(), connection.clone());
///
/// // When routing a message:
/// if let Some(conn) = registry.lookup(&recipient) {
///     conn.write_message(&message).await?;
/// }
///
/// // When the connection's dispatch loop exits:
/// registry.unregister_connection(&user_id, connection.id());
/// ```
pub struct ConnectionRegistry {
    connections: DashMap<UserId, Connection>,
}

impl ConnectionRegistry {
    /// Create a new connection registry.
    pub fn new() -> Self {
        info!("Creating connection registry");
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection for a user.
    ///
    /// Always succeeds. If the user already had a connection it is replaced
    /// in a single map operation, so concurrent lookups observe either the
    /// old or the new connection. The replaced connection is closed and
    /// returned.
    #[instrument(skip(self, connection), fields(user_id = %user_id, connection = %connection.id()))]
    pub fn register(&self, user_id: UserId, connection: Connection) -> Option<Connection> {
        let new_id = connection.id();
        let existing = self.connections.insert(user_id, connection);
        match &existing {
            Some(old) if old.id() != new_id => {
                old.close();
                debug!(replaced = %old.id(), "Replaced existing connection and closed it");
            }
            Some(_) => debug!("Connection re-registered"),
            None => debug!("Registered new connection"),
        }
        existing
    }

    /// Unregister whatever connection a user currently has.
    ///
    /// No-op when the user is not registered.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn unregister(&self, user_id: &UserId) -> Option<Connection> {
        let removed = self.connections.remove(user_id);
        if removed.is_some() {
            debug!("Unregistered connection");
        } else {
            debug!("Connection was not registered");
        }
        removed.map(|(_, conn)| conn)
    }

    /// Unregister a user only if the entry still belongs to `connection_id`.
    ///
    /// A dispatch loop whose connection was replaced must not evict its
    /// replacement on the way out.
    #[instrument(skip(self), fields(user_id = %user_id, connection = %connection_id))]
    pub fn unregister_connection(
        &self,
        user_id: &UserId,
        connection_id: ConnectionId,
    ) -> Option<Connection> {
        let removed = self
            .connections
            .remove_if(user_id, |_, conn| conn.id() == connection_id);
        if removed.is_some() {
            debug!("Unregistered connection");
        } else {
            debug!("Connection already replaced or removed");
        }
        removed.map(|(_, conn)| conn)
    }

    /// Look up the live connection for a user.
    ///
    /// Never waits on connection I/O.
    pub fn lookup(&self, user_id: &UserId) -> Option<Connection> {
        self.connections.get(user_id).map(|entry| entry.value().clone())
    }

    /// Check if a user is currently connected.
    pub fn is_connected(&self, user_id: &UserId) -> bool {
        self.connections.contains_key(user_id)
    }

    /// Get the number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// List all connected user ids.
    pub fn list_connections(&self) -> Vec<UserId> {
        self.connections.iter().map(|r| r.key().clone()).collect()
    }

    /// Remove all entries whose connection has already closed.
    ///
    /// Run periodically to sweep connections that were not unregistered.
    pub fn cleanup_stale(&self) -> usize {
        let stale: Vec<(UserId, ConnectionId)> = self
            .connections
            .iter()
            .filter(|entry| entry.value().is_closed())
            .map(|entry| (entry.key().clone(), entry.value().id()))
            .collect();

        let removed = stale
            .into_iter()
            .filter(|(user_id, id)| {
                let hit = self
                    .connections
                    .remove_if(user_id, |_, conn| conn.id() == *id)
                    .is_some();
                if hit {
                    debug!(user_id = %user_id, "Removed stale connection");
                }
                hit
            })
            .count();

        if removed > 0 {
            info!(count = removed, "Cleaned up stale connections");
        }

        removed
    }

    /// Close every registered connection.
    ///
    /// Entries are removed by their dispatch loops as they exit.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for entry in self.connections.iter() {
            entry.value().close();
            closed += 1;
        }
        if closed > 0 {
            info!(count = closed, "Closed all live connections");
        }
        closed
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connections.len())
            .finish()
    }
}
