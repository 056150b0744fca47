//! Low-level cache backend trait and supporting types.
//!
//! The [`CacheBackend`] trait is the contract the shared-blob repository is
//! built on. It exposes only 4 operations: [`get`](CacheBackend::get),
//! [`set`](CacheBackend::set), [`delete`](CacheBackend::delete) and
//! [`contains`](CacheBackend::contains), each on an opaque value with an
//! optional TTL.
//!
//! There is intentionally no key listing and no compare-and-swap. Everything
//! the process table needs beyond that (locking, supersession, expiry) is
//! built on top in [`SiteCacheRepository`](crate::store::sitecache::SiteCacheRepository).
//! Backends are dumb KV stores and never interpret the bytes they hold.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from raw cache operations.
///
/// # Examples
///
/// ```
/// use build_ps::store::backend::CacheError;
///
/// let err = CacheError::backend("connection refused");
/// assert_eq!(err.to_string(), "cache backend error: connection refused");
/// ```
#[derive(Debug, Error)]
pub enum CacheError {
    /// An I/O or backend-specific error occurred (e.g., network failure).
    #[error("cache backend error: {message}")]
    Backend {
        /// Human-readable description of the error.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CacheError {
    /// Creates a backend error without an underlying source.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }
}

/// Key-value cache with per-key TTL.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; a single backend is shared by every
/// request handler in the process.
///
/// # Atomicity
///
/// Each call is atomic on its own. Nothing is atomic across calls or keys.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Returns the value stored under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// With `ttl` set, the key disappears once the TTL elapses. Without it
    /// the key lives until deleted.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Deletes `key`. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Returns `true` if `key` is present and not expired.
    async fn contains(&self, key: &str) -> Result<bool, CacheError>;
}

#[async_trait]
impl<T: CacheBackend + ?Sized> CacheBackend for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        (**self).delete(key).await
    }

    async fn contains(&self, key: &str) -> Result<bool, CacheError> {
        (**self).contains(key).await
    }
}
