//! Process repository stored as one blob in a shared cache.
//!
//! [`SiteCacheRepository`] keeps the whole process table under a single
//! cache key as a JSON object mapping [`BuildProcess::table_key`] to the
//! record. Because the cache offers no transactions, every mutation is a
//! read-modify-write of that blob, serialized by a [`CacheLock`].
//!
//! # Keys
//!
//! | Key | Content | TTL |
//! |-----|---------|-----|
//! | `table` | serialized process table | process expiration |
//! | `lock` | token of the current lock holder | lock timeout |
//! | `purged` | empty marker set after an expiry scan | purge interval |
//!
//! # Expiry
//!
//! Records older than the configured expiration are dropped the next time the
//! table is listed. The scan is skipped while the `purged` marker is set, so
//! at most one scan runs per purge interval.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::Settings;
use crate::constants::{LOCK_KEY, PURGED_KEY, TABLE_KEY};
use crate::domain::BuildProcess;
use crate::error::ProcessError;
use crate::store::backend::CacheBackend;
use crate::store::lock::CacheLock;
use crate::store::{ListProcessesOptions, ProcessRepository};

/// The serialized process table, keyed by [`BuildProcess::table_key`].
type ProcessTable = BTreeMap<String, BuildProcess>;

/// Timing configuration for [`SiteCacheRepository`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteCacheConfig {
    /// Age after which a process is purged.
    pub expiration: Duration,
    /// Minimum time between two expiry scans.
    pub purge_interval: Duration,
    /// How long to wait for the table lock.
    pub lock_timeout: Duration,
}

impl Default for SiteCacheConfig {
    fn default() -> Self {
        Self {
            expiration: Duration::from_secs(3600),
            purge_interval: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(10),
        }
    }
}

impl SiteCacheConfig {
    /// Takes the timing values from `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            expiration: settings.process_expiration(),
            purge_interval: settings.purge_interval(),
            lock_timeout: settings.lock_timeout(),
        }
    }
}

/// Process repository on top of any [`CacheBackend`].
///
/// Multiple repositories, possibly on different hosts, may share one cache.
/// They coordinate through the cooperative lock only; nothing else guards the
/// table.
///
/// # Examples
///
/// ```
/// use build_ps::store::memory::InMemoryCache;
/// use build_ps::store::sitecache::{SiteCacheConfig, SiteCacheRepository};
/// use build_ps::{BuildProcess, ListProcessesOptions, ProcessRepository};
/// use chrono::Utc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let repo = SiteCacheRepository::new(InMemoryCache::new(), SiteCacheConfig::default());
///
/// let process = BuildProcess::new("babette", "1031", "jenkins", "sys-apps/foo-1", "compile", Utc::now());
/// repo.add_process(&process).await.unwrap();
///
/// let listed = repo.get_processes(&ListProcessesOptions::default()).await.unwrap();
/// assert_eq!(listed, vec![process]);
/// # }
/// ```
#[derive(Debug)]
pub struct SiteCacheRepository<B: CacheBackend> {
    cache: B,
    config: SiteCacheConfig,
}

impl<B: CacheBackend> SiteCacheRepository<B> {
    /// Creates a repository storing its table in `cache`.
    pub fn new(cache: B, config: SiteCacheConfig) -> Self {
        Self { cache, config }
    }

    /// Returns the underlying cache.
    pub fn cache(&self) -> &B {
        &self.cache
    }

    /// Returns the timing configuration.
    pub fn config(&self) -> &SiteCacheConfig {
        &self.config
    }

    // ---- Table access (private) ----

    async fn read_table(&self) -> Result<ProcessTable, ProcessError> {
        match self.cache.get(TABLE_KEY).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(ProcessTable::new()),
        }
    }

    async fn write_table(&self, table: &ProcessTable) -> Result<(), ProcessError> {
        let bytes = serde_json::to_vec(table)?;
        self.cache
            .set(TABLE_KEY, &bytes, Some(self.config.expiration))
            .await?;
        Ok(())
    }

    async fn lock(&self) -> Result<CacheLock<'_, B>, ProcessError> {
        CacheLock::acquire(
            &self.cache,
            LOCK_KEY,
            self.config.lock_timeout,
            Some(self.config.lock_timeout),
        )
        .await
    }

    fn is_alive(&self, process: &BuildProcess, now: DateTime<Utc>) -> bool {
        match (now - process.start_time).to_std() {
            Ok(age) => age < self.config.expiration,
            // started in the future
            Err(_) => true,
        }
    }

    // ---- Operations run under the lock ----

    async fn add_locked(&self, process: &BuildProcess) -> Result<(), ProcessError> {
        let mut table = self.read_table().await?;
        let before = table.len();
        table.retain(|_, stored| !stored.is_superseded_by(process));
        if table.len() != before {
            tracing::debug!(
                machine = %process.machine,
                package = %process.package,
                superseded = before - table.len(),
                "dropping superseded processes"
            );
        }

        let key = process.table_key();
        if table.contains_key(&key) {
            return Err(ProcessError::RecordAlreadyExists(Box::new(process.clone())));
        }

        table.insert(key, process.clone());
        self.write_table(&table).await
    }

    async fn store_locked(&self, process: BuildProcess) -> Result<(), ProcessError> {
        let mut table = self.read_table().await?;
        table.insert(process.table_key(), process);
        self.write_table(&table).await
    }

    async fn purge_locked(&self) -> Result<ProcessTable, ProcessError> {
        let now = Utc::now();
        let (live, expired): (ProcessTable, ProcessTable) = self
            .read_table()
            .await?
            .into_iter()
            .partition(|(_, process)| self.is_alive(process, now));

        if !expired.is_empty() {
            tracing::debug!(expired = expired.len(), "purging expired processes");
            self.write_table(&live).await?;
        }
        self.cache
            .set(PURGED_KEY, b"", Some(self.config.purge_interval))
            .await?;
        Ok(live)
    }

    async fn clear_locked(&self) -> Result<(), ProcessError> {
        self.cache.delete(TABLE_KEY).await?;
        self.cache.delete(PURGED_KEY).await?;
        Ok(())
    }

    /// Returns the table with expired processes removed, scanning at most
    /// once per purge interval.
    async fn live_table(&self) -> Result<ProcessTable, ProcessError> {
        if self.cache.contains(PURGED_KEY).await? {
            return self.read_table().await;
        }

        let lock = self.lock().await?;
        let result = self.purge_locked().await;
        lock.release().await?;
        result
    }
}

#[async_trait]
impl<B: CacheBackend> ProcessRepository for SiteCacheRepository<B> {
    async fn add_process(&self, process: &BuildProcess) -> Result<(), ProcessError> {
        let lock = self.lock().await?;
        let result = self.add_locked(process).await;
        lock.release().await?;
        result
    }

    async fn update_process(&self, process: &BuildProcess) -> Result<(), ProcessError> {
        let table = self.read_table().await?;
        let Some(stored) = table.get(&process.table_key()) else {
            return Err(ProcessError::RecordNotFound(Box::new(process.clone())));
        };
        stored.ensure_updateable(process)?;
        let updated = stored.updated_from(process);

        let lock = self.lock().await?;
        let result = self.store_locked(updated).await;
        lock.release().await?;
        result
    }

    async fn get_processes(
        &self,
        options: &ListProcessesOptions,
    ) -> Result<Vec<BuildProcess>, ProcessError> {
        let mut processes: Vec<BuildProcess> = self
            .live_table()
            .await?
            .into_values()
            .filter(|process| options.matches(process))
            .collect();
        processes.sort_by_key(|process| process.start_time);
        Ok(processes)
    }

    async fn clear(&self) -> Result<(), ProcessError> {
        let lock = self.lock().await?;
        let result = self.clear_locked().await;
        lock.release().await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryCache;
    use chrono::TimeZone;

    fn repo() -> SiteCacheRepository<InMemoryCache> {
        SiteCacheRepository::new(InMemoryCache::new(), SiteCacheConfig::default())
    }

    fn process(build_id: &str, phase: &str) -> BuildProcess {
        BuildProcess::new(
            "babette",
            build_id,
            "jenkins",
            "sys-apps/systemd-254.5-r1",
            phase,
            Utc::now(),
        )
    }

    #[test]
    fn config_from_settings() {
        let settings = Settings {
            process_expiration_ms: 5_000,
            purge_interval_ms: 500,
            lock_timeout_ms: 50,
            ..Settings::default()
        };
        let config = SiteCacheConfig::from_settings(&settings);
        assert_eq!(config.expiration, Duration::from_secs(5));
        assert_eq!(config.purge_interval, Duration::from_millis(500));
        assert_eq!(config.lock_timeout, Duration::from_millis(50));
        assert_eq!(
            SiteCacheConfig::from_settings(&Settings::default()),
            SiteCacheConfig::default()
        );
    }

    #[test]
    fn future_start_time_is_alive() {
        let repo = repo();
        let mut p = process("1031", "compile");
        p.start_time = Utc::now() + chrono::Duration::hours(1);
        assert!(repo.is_alive(&p, Utc::now()));

        p.start_time = Utc.with_ymd_and_hms(2023, 11, 11, 12, 20, 52).unwrap();
        assert!(!repo.is_alive(&p, Utc::now()));
    }

    #[tokio::test]
    async fn table_is_stored_as_json_object() {
        let repo = repo();
        let p = process("1031", "compile");
        repo.add_process(&p).await.unwrap();

        let bytes = repo.cache().get(TABLE_KEY).await.unwrap().unwrap();
        let table: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(table[p.table_key()]["phase"], "compile");
        assert_eq!(table[p.table_key()]["build_host"], "jenkins");
    }

    #[tokio::test]
    async fn operations_release_the_lock() {
        let repo = repo();
        let p = process("1031", "compile");

        repo.add_process(&p).await.unwrap();
        assert!(!repo.cache().contains(LOCK_KEY).await.unwrap());

        // failed add still releases
        assert!(repo.add_process(&p).await.is_err());
        assert!(!repo.cache().contains(LOCK_KEY).await.unwrap());

        repo.update_process(&process("1031", "postinst")).await.unwrap();
        repo.get_processes(&ListProcessesOptions::default())
            .await
            .unwrap();
        repo.clear().await.unwrap();
        assert!(!repo.cache().contains(LOCK_KEY).await.unwrap());
    }

    #[tokio::test]
    async fn listing_sets_purged_marker() {
        let repo = repo();
        assert!(!repo.cache().contains(PURGED_KEY).await.unwrap());

        repo.get_processes(&ListProcessesOptions::default())
            .await
            .unwrap();
        assert!(repo.cache().contains(PURGED_KEY).await.unwrap());

        repo.clear().await.unwrap();
        assert!(!repo.cache().contains(PURGED_KEY).await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_table_is_a_serialization_error() {
        let repo = repo();
        repo.cache().set(TABLE_KEY, b"not json", None).await.unwrap();

        let result = repo.add_process(&process("1031", "compile")).await;
        assert!(matches!(result, Err(ProcessError::Serialization(_))));
    }
}
