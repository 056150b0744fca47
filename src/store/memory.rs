//! In-memory cache backend.
//!
//! [`InMemoryCache`] provides a thread-safe [`CacheBackend`] implementation
//! using `DashMap<String, (Vec<u8>, Option<Instant>)>`. It is a dumb KV store
//! with no domain logic.
//!
//! TTLs are enforced lazily: an expired entry is dropped the next time it is
//! touched. Deadlines use the tokio clock, so tests running with a paused
//! runtime can expire entries with `tokio::time::advance`.
//!
//! # Examples
//!
//! ```
//! use build_ps::store::memory::InMemoryCache;
//! use build_ps::store::sitecache::{SiteCacheConfig, SiteCacheRepository};
//!
//! let repo = SiteCacheRepository::new(InMemoryCache::new(), SiteCacheConfig::default());
//! ```

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::store::backend::{CacheBackend, CacheError};

/// Thread-safe in-memory cache using [`DashMap`].
///
/// Only shares state between repositories in the same process; use a
/// networked cache to share a process table between hosts.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    data: DashMap<String, (Vec<u8>, Option<Instant>)>,
}

impl InMemoryCache {
    /// Creates an empty cache.
    ///
    /// # Examples
    ///
    /// ```
    /// use build_ps::store::memory::InMemoryCache;
    ///
    /// let cache = InMemoryCache::new();
    /// assert!(cache.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries, including expired entries not
    /// yet dropped.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Removes `key` if its deadline has passed.
    fn evict_if_expired(&self, key: &str) {
        self.data
            .remove_if(key, |_, (_, deadline)| is_past(*deadline));
    }
}

fn is_past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| d <= Instant::now())
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.evict_if_expired(key);
        Ok(self.data.get(key).map(|entry| entry.value().0.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.data.insert(key.to_string(), (value.to_vec(), deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self
            .data
            .remove(key)
            .is_some_and(|(_, (_, deadline))| !is_past(deadline)))
    }

    async fn contains(&self, key: &str) -> Result<bool, CacheError> {
        self.evict_if_expired(key);
        Ok(self.data.contains_key(key))
    }
}
