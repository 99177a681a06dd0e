//! Durable store collaborator.
//!
//! The relay persists every relayed message through this trait; the server
//! also uses it for account CRUD. Implementations live outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Message;

/// Error type for durable store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness or other constraint rejected the write.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The backing store failed.
    #[error("Store error: {0}")]
    Backend(String),
}

/// A user account as returned to clients.
///
/// Credential material is deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
}

/// A user account ready to be inserted.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    /// Encoded password hash (PHC string)
    pub password_hash: String,
}

/// Authoritative storage for users and messages.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert a user and return its assigned id.
    ///
    /// Fails with [`StoreError::Conflict`] when the username or email is taken.
    async fn insert_user(&self, user: NewUser) -> Result<i64, StoreError>;

    /// Fetch a user by id.
    async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError>;

    /// Append a message and return its assigned id.
    async fn insert_message(&self, message: &Message) -> Result<i64, StoreError>;

    /// Check that the store is reachable.
    async fn health_check(&self) -> Result<bool, StoreError> {
        Ok(true)
    }
}
