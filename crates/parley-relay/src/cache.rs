//! Session cache collaborator.
//!
//! The cache is advisory: nothing on the relay or request paths may fail
//! because of it. Every result is funnelled through [`advisory`], which
//! logs the failure and carries on.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Advisory error class for session cache failures.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Session cache unavailable: {0}")]
    Unavailable(String),

    #[error("Session cache entry is corrupt: {0}")]
    Corrupt(String),
}

/// Key/value cache with expiry plus a capped recent-message log.
#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Store `value` under `key` for at most `ttl`.
    async fn set_with_expiry(&self, key: &str, value: String, ttl: Duration)
        -> Result<(), CacheError>;

    /// Get a live value. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Prepend an entry to the recent-message log.
    ///
    /// The log is capped: once it holds its capacity, the oldest entries
    /// are trimmed so it never grows past the cap.
    async fn push_recent(&self, entry: String) -> Result<(), CacheError>;

    /// Up to `limit` recent entries, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<String>, CacheError>;
}

/// Cache key marking a user's session as active.
pub fn session_key(user_id: impl std::fmt::Display) -> String {
    format!("user:{}:session", user_id)
}

/// Consume a cache result under the advisory policy.
///
/// Failures are logged with `context` and turned into `None`; they are never
/// retried and never propagated.
pub fn advisory<T>(result: Result<T, CacheError>, context: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, context = context, "Session cache failure ignored");
            None
        }
    }
}
