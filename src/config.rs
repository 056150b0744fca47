//! Repository configuration.
//!
//! Configuration can be loaded from:
//! 1. TOML file (a `[ps]` table)
//! 2. Environment variables (with `BUILD_PS_` prefix)
//!
//! Environment variables override TOML configuration.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [ps]
//! storage_backend = "sitecache"
//! cache = "redis"
//! cache_url = "redis://cache.internal:6379/2"
//! process_expiration_ms = 3600000
//! purge_interval_ms = 60000
//! lock_timeout_ms = 10000
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which storage technology backs the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// Transactional SQLite table.
    Sqlite,
    /// Single shared blob in a cache.
    Sitecache,
}

impl FromStr for StorageBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "sitecache" => Ok(Self::Sitecache),
            other => Err(ConfigError::Parse(format!("unknown storage backend: {other}"))),
        }
    }
}

/// Which cache the `sitecache` backend stores its table in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    /// Process-local cache. Only shared between repositories in one process.
    Memory,
    /// Redis server at [`Settings::cache_url`].
    Redis,
}

impl FromStr for CacheKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::Parse(format!("unknown cache: {other}"))),
        }
    }
}

/// Settings for opening a process repository.
///
/// # Defaults
///
/// | Setting                 | Default                    |
/// |-------------------------|----------------------------|
/// | `storage_backend`       | `sqlite`                   |
/// | `sqlite_database`       | `build-ps.sqlite`          |
/// | `cache`                 | `memory`                   |
/// | `cache_url`             | `redis://127.0.0.1:6379`   |
/// | `cache_prefix`          | `build-ps`                 |
/// | `process_expiration_ms` | 3,600,000 (1 hour)         |
/// | `purge_interval_ms`     | 60,000 (1 minute)          |
/// | `lock_timeout_ms`       | 10,000 (10 seconds)        |
///
/// # Examples
///
/// ```
/// use build_ps::{Settings, StorageBackendKind};
///
/// let settings = Settings::from_toml(
///     r#"
///     [ps]
///     storage_backend = "sitecache"
///     lock_timeout_ms = 2500
///     "#,
/// )
/// .unwrap();
/// assert_eq!(settings.storage_backend, StorageBackendKind::Sitecache);
/// assert_eq!(settings.lock_timeout().as_millis(), 2500);
/// assert_eq!(settings.process_expiration_ms, 3_600_000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Backend selection.
    pub storage_backend: StorageBackendKind,

    /// SQLite database path, or `:memory:`.
    pub sqlite_database: String,

    /// Cache used by the `sitecache` backend.
    pub cache: CacheKind,

    /// Connection URL for networked caches.
    pub cache_url: String,

    /// Key prefix for networked caches.
    pub cache_prefix: String,

    /// Age after which a cached process is purged.
    pub process_expiration_ms: u64,

    /// Minimum time between two expiry scans.
    pub purge_interval_ms: u64,

    /// How long to wait for the table lock before giving up.
    pub lock_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_backend: StorageBackendKind::Sqlite,
            sqlite_database: "build-ps.sqlite".to_string(),
            cache: CacheKind::Memory,
            cache_url: "redis://127.0.0.1:6379".to_string(),
            cache_prefix: "build-ps".to_string(),
            process_expiration_ms: 3_600_000, // 1 hour
            purge_interval_ms: 60_000,        // 1 minute
            lock_timeout_ms: 10_000,          // 10 seconds
        }
    }
}

impl Settings {
    /// Load configuration from an optional file and the environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. TOML configuration file, if `path` is given
    /// 3. Default values
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::from_env()),
        }
    }

    /// Defaults overridden by the environment.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env_overrides(|name| std::env::var(name).ok());
        settings
    }

    /// Load configuration from a specific file path, then apply the
    /// environment on top.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        let mut settings = Self::from_toml(&contents)?;
        settings.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(settings)
    }

    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct FullConfig {
            #[serde(default)]
            ps: Settings,
        }

        let full: FullConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(full.ps)
    }

    /// Apply `BUILD_PS_*` overrides looked up through `var`.
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn apply_env_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("BUILD_PS_STORAGE_BACKEND") {
            set_parsed(&mut self.storage_backend, "BUILD_PS_STORAGE_BACKEND", &v);
        }
        if let Some(v) = var("BUILD_PS_SQLITE_DATABASE") {
            self.sqlite_database = v;
        }
        if let Some(v) = var("BUILD_PS_CACHE") {
            set_parsed(&mut self.cache, "BUILD_PS_CACHE", &v);
        }
        if let Some(v) = var("BUILD_PS_CACHE_URL") {
            self.cache_url = v;
        }
        if let Some(v) = var("BUILD_PS_CACHE_PREFIX") {
            self.cache_prefix = v;
        }
        if let Some(v) = var("BUILD_PS_PROCESS_EXPIRATION_MS") {
            set_parsed(&mut self.process_expiration_ms, "BUILD_PS_PROCESS_EXPIRATION_MS", &v);
        }
        if let Some(v) = var("BUILD_PS_PURGE_INTERVAL_MS") {
            set_parsed(&mut self.purge_interval_ms, "BUILD_PS_PURGE_INTERVAL_MS", &v);
        }
        if let Some(v) = var("BUILD_PS_LOCK_TIMEOUT_MS") {
            set_parsed(&mut self.lock_timeout_ms, "BUILD_PS_LOCK_TIMEOUT_MS", &v);
        }
    }

    /// Age after which a cached process is purged.
    pub fn process_expiration(&self) -> Duration {
        Duration::from_millis(self.process_expiration_ms)
    }

    /// Minimum time between two expiry scans.
    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }

    /// How long to wait for the table lock.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

fn set_parsed<T: FromStr>(slot: &mut T, name: &str, value: &str) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!(variable = name, value, "ignoring invalid environment value"),
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {error}")]
    Io {
        /// Path of the file.
        path: String,
        /// Underlying I/O error message.
        error: String,
    },

    /// The configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Parse(String),

    /// The configured cache is not compiled into this build.
    #[error("cache {0:?} is not available in this build")]
    UnsupportedCache(CacheKind),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.storage_backend, StorageBackendKind::Sqlite);
        assert_eq!(settings.cache, CacheKind::Memory);
        assert_eq!(settings.lock_timeout(), Duration::from_secs(10));
        assert_eq!(settings.process_expiration(), Duration::from_secs(3600));
        assert_eq!(settings.purge_interval(), Duration::from_secs(60));
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.sqlite_database, "build-ps.sqlite");
    }

    #[test]
    fn toml_overrides_defaults() {
        let settings = Settings::from_toml(
            r#"
            [ps]
            storage_backend = "sitecache"
            cache = "redis"
            cache_url = "redis://cache:6379/1"
            process_expiration_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(settings.storage_backend, StorageBackendKind::Sitecache);
        assert_eq!(settings.cache, CacheKind::Redis);
        assert_eq!(settings.cache_url, "redis://cache:6379/1");
        assert_eq!(settings.process_expiration(), Duration::from_secs(5));
        assert_eq!(settings.lock_timeout_ms, 10_000);
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let result = Settings::from_toml("[ps]\nstorage_backend = \"floppy\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut settings = Settings::from_toml("[ps]\nlock_timeout_ms = 100").unwrap();
        settings.apply_env_overrides(env(&[
            ("BUILD_PS_STORAGE_BACKEND", "SiteCache"),
            ("BUILD_PS_LOCK_TIMEOUT_MS", "250"),
            ("BUILD_PS_SQLITE_DATABASE", "/var/lib/ps.db"),
        ]));
        assert_eq!(settings.storage_backend, StorageBackendKind::Sitecache);
        assert_eq!(settings.lock_timeout_ms, 250);
        assert_eq!(settings.sqlite_database, "/var/lib/ps.db");
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = Settings::default();
        settings.apply_env_overrides(env(&[
            ("BUILD_PS_LOCK_TIMEOUT_MS", "soon"),
            ("BUILD_PS_CACHE", "floppy"),
        ]));
        assert_eq!(settings.lock_timeout_ms, 10_000);
        assert_eq!(settings.cache, CacheKind::Memory);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = Settings::from_file("/nonexistent/build-ps.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
