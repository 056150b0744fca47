//! Redis cache backend.
//!
//! [`RedisCache`] implements [`CacheBackend`] on plain Redis strings:
//!
//! | Operation | Command |
//! |-----------|---------|
//! | `get` | `GET` |
//! | `set` | `SET` (`SET .. PX` with a TTL) |
//! | `delete` | `DEL` |
//! | `contains` | `EXISTS` |
//!
//! All keys are namespaced as `{prefix}:{key}` so that several process tables
//! can share one Redis database.
//!
//! # Usage
//!
//! ```rust,no_run
//! use build_ps::store::redis::RedisCache;
//! use build_ps::store::sitecache::{SiteCacheConfig, SiteCacheRepository};
//!
//! # async fn example() {
//! let cache = RedisCache::new("redis://127.0.0.1:6379").await.unwrap();
//! let repo = SiteCacheRepository::new(cache, SiteCacheConfig::default());
//! # }
//! ```

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::AsyncCommands;
use async_trait::async_trait;

use crate::store::backend::{CacheBackend, CacheError};

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "build-ps";

/// Redis-backed cache.
///
/// Holds a [`MultiplexedConnection`]; clones share the same TCP connection.
#[derive(Debug, Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisCache {
    /// Connects to Redis at `url` (`redis://[:<password>@]<host>:<port>[/<db>]`).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] if the client cannot be created or the
    /// connection cannot be established.
    pub async fn new(url: &str) -> Result<Self, CacheError> {
        let client = ::redis::Client::open(url).map_err(|e| CacheError::Backend {
            message: format!("failed to create Redis client: {e}"),
            source: Some(Box::new(e)),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Backend {
                message: format!("failed to connect to Redis: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self::with_connection(conn))
    }

    /// Wraps an existing multiplexed connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    /// Sets the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

fn map_redis_error(err: ::redis::RedisError, key: &str) -> CacheError {
    CacheError::Backend {
        message: format!("Redis error for key {key}: {err}"),
        source: Some(Box::new(err)),
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.conn
            .clone()
            .get(self.full_key(key))
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(self.full_key(key)).arg(value);
        if let Some(ttl) = ttl {
            // PX rejects 0
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            cmd.arg("PX").arg(millis);
        }
        cmd.query_async::<()>(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let removed: i64 = self
            .conn
            .clone()
            .del(self.full_key(key))
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(removed > 0)
    }

    async fn contains(&self, key: &str) -> Result<bool, CacheError> {
        self.conn
            .clone()
            .exists(self.full_key(key))
            .await
            .map_err(|e| map_redis_error(e, key))
    }
}

#[cfg(all(test, feature = "redis-tests"))]
mod integration_tests {
    use super::*;

    /// Creates a cache with a unique key prefix for isolation.
    async fn test_cache() -> RedisCache {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisCache::new(&url)
            .await
            .expect("Redis connection failed -- is Redis running?")
            .with_prefix(format!("test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn redis_get_missing_key_returns_none() {
        let cache = test_cache().await;
        assert_eq!(cache.get("table").await.unwrap(), None);
        assert!(!cache.contains("table").await.unwrap());
    }

    #[tokio::test]
    async fn redis_set_then_get() {
        let cache = test_cache().await;
        cache.set("table", b"{}", None).await.unwrap();
        assert_eq!(cache.get("table").await.unwrap(), Some(b"{}".to_vec()));
        assert!(cache.contains("table").await.unwrap());
    }

    #[tokio::test]
    async fn redis_delete_reports_existence() {
        let cache = test_cache().await;
        cache.set("lock", b"token", None).await.unwrap();
        assert!(cache.delete("lock").await.unwrap());
        assert!(!cache.delete("lock").await.unwrap());
    }

    #[tokio::test]
    async fn redis_set_with_ttl_expires() {
        let cache = test_cache().await;
        cache
            .set("purged", b"", Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(cache.contains("purged").await.unwrap());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!cache.contains("purged").await.unwrap());
    }

    #[tokio::test]
    async fn redis_prefixes_isolate_caches() {
        let a = test_cache().await;
        let b = test_cache().await;
        a.set("table", b"a", None).await.unwrap();
        assert_eq!(b.get("table").await.unwrap(), None);
    }
}
