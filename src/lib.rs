//! Process table for in-flight package builds.
//!
//! Every build step running on a fleet of build machines is tracked as a
//! [`BuildProcess`] record. Records are stored through one repository
//! contract ([`ProcessRepository`]) regardless of which storage technology
//! backs them.
//!
//! # Overview
//!
//! A record is added when a build step starts, updated as the step moves
//! through its phases, and disappears when a newer build of the same package
//! on the same machine supersedes it (or, for cache-backed tables, when it
//! expires). Only the build host that currently owns a record may move it
//! into a final phase.
//!
//! # Module Organization
//!
//! - [`domain`] - The [`BuildProcess`] value type and its invariants
//! - [`error`] - [`ProcessError`], the conditions every backend signals
//! - [`store`] - The repository trait, facade and backends
//! - [`config`] - [`Settings`] loaded from TOML and the environment
//! - [`payload`] - Wire payloads for query/mutation collaborators
//! - [`signals`] - Pipeline event handlers that record synthetic processes
//! - [`constants`] - Phase names and cache keys

pub mod config;
pub mod constants;
pub mod domain;
pub mod error;
pub mod payload;
pub mod signals;
pub mod store;

// Re-exports for ergonomic access
pub use config::{CacheKind, ConfigError, Settings, StorageBackendKind};
pub use domain::BuildProcess;
pub use error::ProcessError;
pub use store::{add_or_update_process, open, ListProcessesOptions, ProcessRepository, Repo};
