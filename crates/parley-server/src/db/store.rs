//! libSQL implementation of the relay's durable store.

use std::sync::Arc;

use async_trait::async_trait;
use parley_relay::{DurableStore, Message, NewUser, StoreError, User};
use tracing::{debug, instrument};

use super::{Database, DatabaseError};

/// Durable store backed by the `users` and `messages` tables.
#[derive(Clone)]
pub struct LibSqlStore {
    db: Arc<Database>,
}

impl LibSqlStore {
    /// Create a store over a migrated database.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DurableStore for LibSqlStore {
    #[instrument(skip(self, user), fields(username = %user.username))]
    async fn insert_user(&self, user: NewUser) -> Result<i64, StoreError> {
        let conn = self.db.connection().await.map_err(store_err)?;

        conn.as_ref()
            .execute(
                "INSERT INTO users (username, email, password_hash) VALUES (?, ?, ?)",
                (
                    user.username.as_str(),
                    user.email.as_str(),
                    user.password_hash.as_str(),
                ),
            )
            .await
            .map_err(write_err)?;

        let user_id = conn.as_ref().last_insert_rowid();
        debug!(user_id, "User inserted");
        Ok(user_id)
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        let conn = self.db.connection().await.map_err(store_err)?;

        let mut rows = conn
            .as_ref()
            .query(
                "SELECT user_id, username, email FROM users WHERE user_id = ?",
                [id],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(User {
                id: row.get(0).map_err(query_err)?,
                username: row.get(1).map_err(query_err)?,
                email: row.get(2).map_err(query_err)?,
            })),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, message), fields(from = message.sender_id, to = message.recipient_id))]
    async fn insert_message(&self, message: &Message) -> Result<i64, StoreError> {
        let conn = self.db.connection().await.map_err(store_err)?;

        conn.as_ref()
            .execute(
                "INSERT INTO messages (sender_id, receiver_id, text) VALUES (?, ?, ?)",
                (
                    message.sender_id,
                    message.recipient_id,
                    message.text.as_str(),
                ),
            )
            .await
            .map_err(write_err)?;

        Ok(conn.as_ref().last_insert_rowid())
    }

    async fn health_check(&self) -> Result<bool, StoreError> {
        self.db.health_check().await.map_err(store_err)
    }
}

fn store_err(e: DatabaseError) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn query_err(e: libsql::Error) -> StoreError {
    store_err(DatabaseError::QueryFailed(e.to_string()))
}

/// Map a failed write, surfacing uniqueness violations as conflicts.
fn write_err(e: libsql::Error) -> StoreError {
    let msg = e.to_string();
    match msg.find("UNIQUE constraint failed: ") {
        Some(at) => {
            let column = msg[at + "UNIQUE constraint failed: ".len()..]
                .split_whitespace()
                .next()
                .unwrap_or("unknown");
            StoreError::Conflict(format!("{} already exists", column))
        }
        None => store_err(DatabaseError::Internal(e)),
    }
}
