//! Cooperative lock over a single cache key.
//!
//! Caches reachable through [`CacheBackend`] have no native locking and no
//! compare-and-swap, so exclusive access is negotiated through a key holding
//! a random token:
//!
//! 1. If the key is set, sleep [`LOCK_POLL_INTERVAL`] and retry.
//! 2. Otherwise write a freshly generated token to the key.
//! 3. Read the key back. Only if it still holds our token is the lock ours;
//!    another acquirer may have written between steps 1 and 2.
//!
//! At least one attempt is made, so a zero timeout still takes a free lock.
//! Acquisition gives up with [`ProcessError::LockTimeout`] once an attempt
//! fails after the timeout has elapsed.
//!
//! Release deletes the key without checking the token. A holder that stalls
//! past the key's TTL can therefore release a lock that another acquirer has
//! since taken.

use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::constants::LOCK_POLL_INTERVAL;
use crate::error::ProcessError;
use crate::store::backend::CacheBackend;

/// A held cooperative lock.
///
/// Call [`release`](CacheLock::release) when done. A guard dropped without
/// release leaves the key in place until its TTL runs out.
#[derive(Debug)]
#[must_use = "the lock is held until `release` is called"]
pub struct CacheLock<'a, B: CacheBackend + ?Sized> {
    cache: &'a B,
    key: String,
    token: String,
    released: bool,
}

impl<'a, B: CacheBackend + ?Sized> CacheLock<'a, B> {
    /// Acquires the lock stored under `key`.
    ///
    /// The key is written with `ttl` so that a crashed holder cannot block
    /// other acquirers forever.
    ///
    /// # Errors
    ///
    /// - [`ProcessError::LockTimeout`] if the key stays held for `timeout`.
    /// - [`ProcessError::Cache`] on cache failures.
    pub async fn acquire(
        cache: &'a B,
        key: &str,
        timeout: Duration,
        ttl: Option<Duration>,
    ) -> Result<Self, ProcessError> {
        let start = Instant::now();
        let token = Uuid::new_v4().to_string();

        loop {
            if !cache.contains(key).await? {
                cache.set(key, token.as_bytes(), ttl).await?;

                if cache.get(key).await?.as_deref() == Some(token.as_bytes()) {
                    tracing::trace!(key, token = %token, "lock acquired");
                    return Ok(Self {
                        cache,
                        key: key.to_string(),
                        token,
                        released: false,
                    });
                }
                tracing::debug!(key, "lock taken by another acquirer");
            }

            let waited = start.elapsed();
            if waited >= timeout {
                tracing::warn!(key, ?waited, "lock acquisition timed out");
                return Err(ProcessError::LockTimeout {
                    key: key.to_string(),
                    waited,
                });
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    /// The token written to the lock key.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Releases the lock by deleting its key.
    pub async fn release(mut self) -> Result<(), ProcessError> {
        self.released = true;
        self.cache.delete(&self.key).await?;
        tracing::trace!(key = %self.key, "lock released");
        Ok(())
    }
}

impl<B: CacheBackend + ?Sized> Drop for CacheLock<'_, B> {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                key = %self.key,
                "lock guard dropped without release; key stays set until its TTL expires"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::CacheError;
    use crate::store::memory::InMemoryCache;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const FOREIGN: &[u8] = b"foreign";

    /// A cache where a rival acquirer writes its own token right after our
    /// first write, then gives the key up after `release_after` polls.
    #[derive(Debug)]
    struct RacedCache {
        inner: InMemoryCache,
        raced: AtomicBool,
        polls: AtomicUsize,
        release_after: Option<usize>,
    }

    impl RacedCache {
        fn new(release_after: Option<usize>) -> Self {
            Self {
                inner: InMemoryCache::new(),
                raced: AtomicBool::new(false),
                polls: AtomicUsize::new(0),
                release_after,
            }
        }
    }

    #[async_trait]
    impl CacheBackend for RacedCache {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
            self.inner.set(key, value, ttl).await?;
            if !self.raced.swap(true, Ordering::SeqCst) {
                self.inner.set(key, FOREIGN, None).await?;
            }
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<bool, CacheError> {
            self.inner.delete(key).await
        }

        async fn contains(&self, key: &str) -> Result<bool, CacheError> {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.release_after.is_some_and(|n| polls > n)
                && self.inner.get(key).await?.as_deref() == Some(FOREIGN)
            {
                self.inner.delete(key).await?;
            }
            self.inner.contains(key).await
        }
    }

    #[tokio::test]
    async fn acquire_sets_key_to_token() {
        let cache = InMemoryCache::new();
        let lock = CacheLock::acquire(&cache, "lock", Duration::from_secs(1), None)
            .await
            .unwrap();

        assert_eq!(
            cache.get("lock").await.unwrap(),
            Some(lock.token().as_bytes().to_vec())
        );

        lock.release().await.unwrap();
        assert!(!cache.contains("lock").await.unwrap());
    }

    #[tokio::test]
    async fn tokens_are_unique_per_acquisition() {
        let cache = InMemoryCache::new();
        let first = CacheLock::acquire(&cache, "lock", Duration::from_secs(1), None)
            .await
            .unwrap();
        let first_token = first.token().to_string();
        first.release().await.unwrap();

        let second = CacheLock::acquire(&cache, "lock", Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_ne!(second.token(), first_token);
        second.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn held_key_times_out() {
        let cache = InMemoryCache::new();
        cache.set("lock", b"mykey", None).await.unwrap();

        let result = CacheLock::acquire(&cache, "lock", Duration::from_secs(10), None).await;

        match result {
            Err(ProcessError::LockTimeout { key, waited }) => {
                assert_eq!(key, "lock");
                assert!(waited >= Duration::from_secs(10));
            },
            other => panic!("expected LockTimeout, got: {other:?}"),
        }
        // the foreign holder is untouched
        assert_eq!(cache.get("lock").await.unwrap(), Some(b"mykey".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_holder_to_release() {
        let cache = std::sync::Arc::new(InMemoryCache::new());
        cache.set("lock", b"mykey", None).await.unwrap();

        let releaser = {
            let cache = cache.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(350)).await;
                cache.delete("lock").await.unwrap();
            })
        };

        let lock = CacheLock::acquire(&*cache, "lock", Duration::from_secs(10), None)
            .await
            .unwrap();
        assert_ne!(lock.token(), "mykey");
        lock.release().await.unwrap();
        releaser.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_key_does_not_block() {
        let cache = InMemoryCache::new();
        cache
            .set("lock", b"crashed-holder", Some(Duration::from_secs(2)))
            .await
            .unwrap();

        let lock = CacheLock::acquire(&cache, "lock", Duration::from_secs(10), None)
            .await
            .unwrap();
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn release_does_not_check_token() {
        let cache = InMemoryCache::new();
        let lock = CacheLock::acquire(&cache, "lock", Duration::from_secs(1), None)
            .await
            .unwrap();

        // Someone else overwrote the key; releasing still deletes it.
        cache.set("lock", b"other", None).await.unwrap();
        lock.release().await.unwrap();

        assert!(!cache.contains("lock").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_write_race_waits_for_the_winner() {
        let cache = RacedCache::new(Some(5));
        let start = Instant::now();

        let lock = CacheLock::acquire(&cache, "lock", Duration::from_secs(10), None)
            .await
            .unwrap();

        assert_ne!(lock.token().as_bytes(), FOREIGN);
        assert_eq!(
            cache.get("lock").await.unwrap(),
            Some(lock.token().as_bytes().to_vec())
        );
        // the winner held the key for polls 2 to 5
        assert!(cache.polls.load(Ordering::SeqCst) >= 6);
        assert!(start.elapsed() >= LOCK_POLL_INTERVAL * 4);
        lock.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lost_write_race_times_out_if_the_winner_keeps_the_key() {
        let cache = RacedCache::new(None);

        let result = CacheLock::acquire(&cache, "lock", Duration::from_secs(2), None).await;

        assert!(
            matches!(result, Err(ProcessError::LockTimeout { .. })),
            "expected LockTimeout, got: {result:?}"
        );
        assert_eq!(cache.get("lock").await.unwrap(), Some(FOREIGN.to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_takes_a_free_lock() {
        let cache = InMemoryCache::new();

        let lock = CacheLock::acquire(&cache, "lock", Duration::ZERO, None)
            .await
            .unwrap();

        assert_eq!(
            cache.get("lock").await.unwrap(),
            Some(lock.token().as_bytes().to_vec())
        );
        lock.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_on_held_key_fails_without_waiting() {
        let cache = InMemoryCache::new();
        cache.set("lock", b"mykey", None).await.unwrap();
        let start = Instant::now();

        let result = CacheLock::acquire(&cache, "lock", Duration::ZERO, None).await;

        assert!(
            matches!(result, Err(ProcessError::LockTimeout { .. })),
            "expected LockTimeout, got: {result:?}"
        );
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
