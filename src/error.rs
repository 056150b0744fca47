//! Error types for process table operations.
//!
//! [`ProcessError`] carries the four conditions every backend must signal
//! identically (already exists, not found, update not allowed, lock timeout)
//! plus the backend-specific failures that are passed through unchanged.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::domain::BuildProcess;
use crate::store::backend::CacheError;

/// Errors that can occur during process table operations.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use build_ps::ProcessError;
///
/// let err = ProcessError::LockTimeout {
///     key: "lock".to_string(),
///     waited: Duration::from_secs(10),
/// };
/// assert!(err.is_transient());
/// assert!(err.to_string().contains("lock"));
/// ```
#[derive(Debug, Error)]
pub enum ProcessError {
    /// A record with the same identity key is already stored.
    #[error("process already exists: {}", .0.table_key())]
    RecordAlreadyExists(Box<BuildProcess>),

    /// No record matches the logical-process key.
    #[error("process not found: {}", .0.table_key())]
    RecordNotFound(Box<BuildProcess>),

    /// A build host that does not own the process tried to finalize it.
    #[error(
        "build host {} may not move {} to final phase {:?} (owned by {owner})",
        .process.build_host,
        .process.table_key(),
        .process.phase
    )]
    UpdateNotAllowed {
        /// The rejected update.
        process: Box<BuildProcess>,
        /// The build host that currently owns the process.
        owner: String,
    },

    /// Exclusive access to the process table could not be acquired in time.
    #[error("timed out after {waited:?} waiting for lock {key:?}")]
    LockTimeout {
        /// The lock key that stayed held.
        key: String,
        /// How long the acquirer waited.
        waited: Duration,
    },

    /// Cache backend failure.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Relational backend failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The stored process table could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The repository could not be configured.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ProcessError {
    /// Returns `true` if retrying the operation may succeed.
    ///
    /// Only lock timeouts are transient: the lock holder timed out, not the
    /// table, so no data consistency was violated.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}
