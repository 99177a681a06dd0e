//! In-process session cache.
//!
//! Keys live in an LRU bounded by `PARLEY_CACHE_CAPACITY`; each entry
//! carries its own deadline and reads as absent once expired. The
//! recent-message log is a deque capped at `PARLEY_RECENT_CAPACITY`,
//! newest entry at the front.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parley_relay::{CacheError, SessionCache};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// Session cache held in process memory.
pub struct MemorySessionCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    recent: Mutex<VecDeque<String>>,
    recent_capacity: usize,
}

impl MemorySessionCache {
    /// Create a cache holding at most `capacity` keys and `recent_capacity`
    /// recent-message entries.
    pub fn new(capacity: usize, recent_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            recent: Mutex::new(VecDeque::with_capacity(recent_capacity.min(1024))),
            recent_capacity,
        }
    }

    /// Number of keys currently held, expired or not.
    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn set_with_expiry(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().await.put(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                trace!(key, "Cache entry expired");
                entries.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn push_recent(&self, entry: String) -> Result<(), CacheError> {
        let mut recent = self.recent.lock().await;
        recent.push_front(entry);
        recent.truncate(self.recent_capacity);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<String>, CacheError> {
        let recent = self.recent.lock().await;
        Ok(recent.iter().take(limit).cloned().collect())
    }
}
