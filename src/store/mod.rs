//! Process repository trait, backends, and the facade built on them.
//!
//! # Architecture
//!
//! 1. **[`ProcessRepository`]** -- The contract every backend implements,
//!    used as `Arc<dyn ProcessRepository>` ([`Repo`]).
//!
//! 2. **Backends**
//!    - [`SqliteRepository`](sqlite::SqliteRepository) -- transactional
//!      table, no expiry.
//!    - [`SiteCacheRepository<B>`](sitecache::SiteCacheRepository) -- the
//!      whole table as one blob in a shared cache, guarded by a cooperative
//!      lock, with time-based expiry.
//!
//! 3. **[`CacheBackend`]** -- Dumb KV trait the shared-blob backend runs on
//!    ([`InMemoryCache`](memory::InMemoryCache), and
//!    [`RedisCache`](redis::RedisCache) behind the `redis` feature).
//!
//! Use [`open`] to build the repository selected by [`Settings`], and
//! [`add_or_update_process`] to record a process without caring whether it
//! was seen before.

pub mod backend;
pub mod lock;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod sitecache;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

pub use backend::{CacheBackend, CacheError};

use crate::config::{CacheKind, Settings, StorageBackendKind};
use crate::domain::BuildProcess;
use crate::error::ProcessError;
use crate::store::sitecache::{SiteCacheConfig, SiteCacheRepository};
use crate::store::sqlite::SqliteRepository;

/// Filters for [`ProcessRepository::get_processes`].
///
/// The default lists unfinished processes on every machine.
///
/// # Examples
///
/// ```
/// use build_ps::ListProcessesOptions;
///
/// let options = ListProcessesOptions {
///     include_final: true,
///     machine: Some("babette".to_string()),
/// };
/// assert!(options.include_final);
/// assert!(!ListProcessesOptions::default().include_final);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListProcessesOptions {
    /// Include processes in a final phase.
    pub include_final: bool,
    /// Only list processes of this machine.
    pub machine: Option<String>,
}

impl ListProcessesOptions {
    /// Returns `true` if `process` passes the filters.
    pub fn matches(&self, process: &BuildProcess) -> bool {
        (self.include_final || !process.is_finished())
            && self
                .machine
                .as_deref()
                .is_none_or(|machine| machine == process.machine)
    }
}

/// Storage contract for build processes.
///
/// Every implementation signals the same conditions through
/// [`ProcessError`]:
///
/// | Operation | Condition | Error |
/// |-----------|-----------|-------|
/// | `add_process` | identity key already stored | `RecordAlreadyExists` |
/// | `update_process` | no record for the logical key | `RecordNotFound` |
/// | `update_process` | foreign host finalizing | `UpdateNotAllowed` |
/// | any (cache backends) | table lock not acquired | `LockTimeout` |
///
/// A failed mutation leaves the table unchanged.
#[async_trait]
pub trait ProcessRepository: Send + Sync {
    /// Stores a new process.
    ///
    /// Processes of other builds of the same package on the same machine are
    /// removed first, as part of the same atomic step.
    async fn add_process(&self, process: &BuildProcess) -> Result<(), ProcessError>;

    /// Moves a stored process to the `phase` and `build_host` of `process`.
    ///
    /// The stored record is found by machine, build id and package. Its
    /// start time is kept.
    async fn update_process(&self, process: &BuildProcess) -> Result<(), ProcessError>;

    /// Lists processes matching `options`, oldest first.
    async fn get_processes(
        &self,
        options: &ListProcessesOptions,
    ) -> Result<Vec<BuildProcess>, ProcessError>;

    /// Removes every process.
    async fn clear(&self) -> Result<(), ProcessError>;
}

/// A shared, type-erased repository.
pub type Repo = Arc<dyn ProcessRepository>;

/// Opens the repository selected by `settings`.
///
/// # Errors
///
/// - [`ProcessError::Database`] if the SQLite database cannot be opened.
/// - [`ProcessError::Cache`] if the cache cannot be reached.
/// - [`ProcessError::Config`] if the configured cache is not compiled in.
///
/// # Examples
///
/// ```
/// use build_ps::{open, Settings, StorageBackendKind};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let settings = Settings {
///     storage_backend: StorageBackendKind::Sitecache,
///     ..Settings::default()
/// };
/// let repo = open(&settings).await.unwrap();
/// assert!(repo.get_processes(&Default::default()).await.unwrap().is_empty());
/// # }
/// ```
pub async fn open(settings: &Settings) -> Result<Repo, ProcessError> {
    match settings.storage_backend {
        StorageBackendKind::Sqlite => {
            let repo = SqliteRepository::connect(&settings.sqlite_database).await?;
            Ok(Arc::new(repo))
        },
        StorageBackendKind::Sitecache => open_sitecache(settings).await,
    }
}

async fn open_sitecache(settings: &Settings) -> Result<Repo, ProcessError> {
    let config = SiteCacheConfig::from_settings(settings);
    tracing::debug!(cache = ?settings.cache, ?config, "opening cache-backed process repository");

    match settings.cache {
        CacheKind::Memory => Ok(Arc::new(SiteCacheRepository::new(
            memory::InMemoryCache::new(),
            config,
        ))),
        #[cfg(feature = "redis")]
        CacheKind::Redis => {
            let cache = redis::RedisCache::new(&settings.cache_url)
                .await?
                .with_prefix(settings.cache_prefix.clone());
            Ok(Arc::new(SiteCacheRepository::new(cache, config)))
        },
        #[cfg(not(feature = "redis"))]
        CacheKind::Redis => Err(crate::config::ConfigError::UnsupportedCache(CacheKind::Redis).into()),
    }
}

/// Records `process`, updating it if known and adding it otherwise.
///
/// An update rejected because another build host owns the process is
/// dropped: the call still succeeds and the rejection is only logged.
///
/// # Errors
///
/// Any error from the repository other than `RecordNotFound` (on update)
/// and `UpdateNotAllowed`.
pub async fn add_or_update_process(
    repo: &dyn ProcessRepository,
    process: &BuildProcess,
) -> Result<(), ProcessError> {
    match repo.update_process(process).await {
        Ok(()) => Ok(()),
        Err(ProcessError::RecordNotFound(_)) => repo.add_process(process).await,
        Err(ProcessError::UpdateNotAllowed { process: rejected, owner }) => {
            tracing::debug!(
                key = %rejected.table_key(),
                phase = %rejected.phase,
                build_host = %rejected.build_host,
                owner = %owner,
                "discarding update from non-owning build host"
            );
            Ok(())
        },
        Err(e) => Err(e),
    }
}
