//! Account and message operations behind the HTTP routes.
//!
//! ## Security Model
//!
//! - Passwords are hashed using Argon2id with a unique random salt
//! - Plaintext passwords and hashes never leave this module in a response
//!
//! ## Caching
//!
//! `user:{id}:session` holds the serialized [`User`] record for the session
//! TTL. Reads are cache-aside: a hit answers without touching the store, a
//! miss reads the store and repopulates the entry. Every cache call is
//! advisory.

use std::sync::Arc;
use std::time::Duration;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
    Argon2,
};
use parley_relay::{
    advisory, session_key, DurableStore, Message, NewUser, SessionCache, StoreError, User,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors raised by account and message operations.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Conflict(String),

    #[error("User {0} not found")]
    NotFound(i64),

    #[error("Failed to hash password: {0}")]
    Hashing(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for AccountError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => AccountError::Conflict(msg),
            other => AccountError::Store(other),
        }
    }
}

/// Request to create a new account.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateUser {
    pub username: String,
    pub email: String,
    /// Plaintext password (will be hashed)
    pub password: String,
}

/// Account and message operations over the relay's collaborators.
#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn SessionCache>,
    session_ttl: Duration,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn SessionCache>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            session_ttl,
        }
    }

    /// Register a new account and warm its session entry.
    #[instrument(skip(self, request), fields(username = %request.username))]
    pub async fn create_user(&self, request: CreateUser) -> Result<User, AccountError> {
        validate(&request)?;

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(request.password.as_bytes(), &salt)
            .map_err(|e| AccountError::Hashing(e.to_string()))?
            .to_string();

        let username = request.username.trim().to_string();
        let email = request.email.trim().to_string();
        let id = self
            .store
            .insert_user(NewUser {
                username: username.clone(),
                email: email.clone(),
                password_hash,
            })
            .await?;

        let user = User {
            id,
            username,
            email,
        };
        self.cache_user(&user).await;

        info!(user_id = id, "User created");
        Ok(user)
    }

    /// Fetch an account, answering from the session cache when possible.
    #[instrument(skip(self))]
    pub async fn get_user(&self, id: i64) -> Result<User, AccountError> {
        let key = session_key(id);
        if let Some(Some(cached)) = advisory(self.cache.get(&key).await, "read user session") {
            match serde_json::from_str::<User>(&cached) {
                Ok(user) => {
                    debug!(user_id = id, "Session cache hit");
                    return Ok(user);
                }
                Err(e) => warn!(user_id = id, error = %e, "Ignoring corrupt session entry"),
            }
        }

        let user = self
            .store
            .get_user(id)
            .await?
            .ok_or(AccountError::NotFound(id))?;

        self.cache_user(&user).await;
        Ok(user)
    }

    /// Persist a message and record it in the recent-message log.
    ///
    /// Returns the stored message id. Live delivery is the relay's job.
    #[instrument(skip(self, message), fields(from = message.sender_id, to = message.recipient_id))]
    pub async fn send_message(&self, message: &Message) -> Result<i64, AccountError> {
        let id = self.store.insert_message(message).await?;

        match message.encode() {
            Ok(entry) => {
                advisory(self.cache.push_recent(entry).await, "record recent message");
            }
            Err(e) => debug!(error = %e, "Skipping recent-message record"),
        }

        debug!(message_id = id, "Message stored");
        Ok(id)
    }

    /// Whether the durable store answers.
    pub async fn store_healthy(&self) -> bool {
        match self.store.health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(error = %e, "Store health check failed");
                false
            }
        }
    }

    async fn cache_user(&self, user: &User) {
        match serde_json::to_string(user) {
            Ok(value) => {
                advisory(
                    self.cache
                        .set_with_expiry(&session_key(user.id), value, self.session_ttl)
                        .await,
                    "write user session",
                );
            }
            Err(e) => debug!(user_id = user.id, error = %e, "Skipping session cache write"),
        }
    }
}

fn validate(request: &CreateUser) -> Result<(), AccountError> {
    if request.username.trim().is_empty() {
        return Err(AccountError::InvalidInput(
            "Username cannot be empty".to_string(),
        ));
    }
    if request.password.is_empty() {
        return Err(AccountError::InvalidInput(
            "Password cannot be empty".to_string(),
        ));
    }
    let email = request.email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(AccountError::InvalidInput(format!(
            "Invalid email address: {:?}",
            email
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemorySessionCache;
    use async_trait::async_trait;
    use parley_relay::CacheError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory store that counts reads.
    #[derive(Default)]
    struct CountingStore {
        users: Mutex<Vec<(User, String)>>,
        messages: Mutex<Vec<Message>>,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl DurableStore for CountingStore {
        async fn insert_user(&self, user: NewUser) -> Result<i64, StoreError> {
            let mut users = self.users.lock().unwrap();
            if users
                .iter()
                .any(|(u, _)| u.username == user.username || u.email == user.email)
            {
                return Err(StoreError::Conflict("users.username already exists".into()));
            }
            let id = users.len() as i64 + 1;
            users.push((
                User {
                    id,
                    username: user.username,
                    email: user.email,
                },
                user.password_hash,
            ));
            Ok(id)
        }

        async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let users = self.users.lock().unwrap();
            Ok(users.iter().find(|(u, _)| u.id == id).map(|(u, _)| u.clone()))
        }

        async fn insert_message(&self, message: &Message) -> Result<i64, StoreError> {
            let mut messages = self.messages.lock().unwrap();
            messages.push(message.clone());
            Ok(messages.len() as i64)
        }
    }

    struct DownCache;

    #[async_trait]
    impl SessionCache for DownCache {
        async fn set_with_expiry(
            &self,
            _key: &str,
            _value: String,
            _ttl: Duration,
        ) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }

        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }

        async fn push_recent(&self, _entry: String) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }

        async fn recent(&self, _limit: usize) -> Result<Vec<String>, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
    }

    fn request(username: &str, email: &str) -> CreateUser {
        CreateUser {
            username: username.to_string(),
            email: email.to_string(),
            password: "secret123".to_string(),
        }
    }

    fn service_with(
        store: Arc<CountingStore>,
        cache: Arc<dyn SessionCache>,
    ) -> AccountService {
        AccountService::new(store, cache, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_create_user_hashes_password() {
        let store = Arc::new(CountingStore::default());
        let service = service_with(store.clone(), Arc::new(MemorySessionCache::new(16, 16)));

        let user = service
            .create_user(request("alice", "alice@example.com"))
            .await
            .unwrap();
        assert_eq!(user.username, "alice");

        let users = store.users.lock().unwrap();
        let (_, hash) = &users[0];
        assert!(hash.starts_with("$argon2id$"));
        assert!(!hash.contains("secret123"));
    }

    #[tokio::test]
    async fn test_warm_cache_fetch_skips_store() {
        let store = Arc::new(CountingStore::default());
        let service = service_with(store.clone(), Arc::new(MemorySessionCache::new(16, 16)));

        let created = service
            .create_user(request("alice", "alice@example.com"))
            .await
            .unwrap();
        let fetched = service.get_user(created.id).await.unwrap();

        assert_eq!(fetched, created);
        assert_eq!(store.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_miss_reads_store_then_populates() {
        let store = Arc::new(CountingStore::default());
        let cache = Arc::new(MemorySessionCache::new(16, 16));
        let writer = service_with(store.clone(), Arc::new(DownCache));
        let created = writer
            .create_user(request("bob", "bob@example.com"))
            .await
            .unwrap();

        let service = service_with(store.clone(), cache.clone());
        service.get_user(created.id).await.unwrap();
        service.get_user(created.id).await.unwrap();

        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        assert!(cache.get(&session_key(created.id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_user_is_not_found() {
        let service = service_with(
            Arc::new(CountingStore::default()),
            Arc::new(MemorySessionCache::new(16, 16)),
        );
        assert!(matches!(
            service.get_user(9).await,
            Err(AccountError::NotFound(9))
        ));
    }

    #[tokio::test]
    async fn test_cache_outage_is_advisory() {
        let service = service_with(Arc::new(CountingStore::default()), Arc::new(DownCache));

        let created = service
            .create_user(request("carol", "carol@example.com"))
            .await
            .unwrap();
        assert_eq!(service.get_user(created.id).await.unwrap(), created);
        assert!(service
            .send_message(&Message::new(created.id, 2, "hi"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_user_is_conflict() {
        let service = service_with(
            Arc::new(CountingStore::default()),
            Arc::new(MemorySessionCache::new(16, 16)),
        );
        service
            .create_user(request("dave", "dave@example.com"))
            .await
            .unwrap();

        assert!(matches!(
            service.create_user(request("dave", "dave2@example.com")).await,
            Err(AccountError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_validation() {
        let service = service_with(
            Arc::new(CountingStore::default()),
            Arc::new(MemorySessionCache::new(16, 16)),
        );

        for bad in [
            request("", "x@example.com"),
            request("erin", "not-an-email"),
            request("erin", "@example.com"),
            CreateUser {
                password: String::new(),
                ..request("erin", "erin@example.com")
            },
        ] {
            assert!(matches!(
                service.create_user(bad).await,
                Err(AccountError::InvalidInput(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_send_message_records_recent_entry() {
        let cache = Arc::new(MemorySessionCache::new(16, 16));
        let store = Arc::new(CountingStore::default());
        let service = service_with(store.clone(), cache.clone());

        let id = service
            .send_message(&Message::new(1, 2, "hello"))
            .await
            .unwrap();

        assert_eq!(id, 1);
        let recent = cache.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(
            Message::decode(&recent[0]).unwrap(),
            Message::new(1, 2, "hello")
        );
    }
}
