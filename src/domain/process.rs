//! Build process record -- the unit of storage.
//!
//! A [`BuildProcess`] describes one phase of one package build on one
//! machine. It is immutable from the store's point of view: updates produce
//! a new value via [`BuildProcess::updated_from`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::FINAL_PROCESS_PHASES;
use crate::error::ProcessError;

/// One in-flight (or recently finished) build process.
///
/// # Keys
///
/// | Key | Fields | Used for |
/// |-----|--------|----------|
/// | identity | machine, build_id, build_host, package | uniqueness |
/// | logical process | machine, build_id, package | update lookup, ownership |
/// | supersession | machine, package | replacing stale builds |
///
/// # Examples
///
/// ```
/// use build_ps::BuildProcess;
/// use chrono::{TimeZone, Utc};
///
/// let process = BuildProcess::new(
///     "babette",
///     "1031",
///     "jenkins",
///     "sys-apps/systemd-254.5-r1",
///     "compile",
///     Utc.with_ymd_and_hms(2023, 11, 11, 12, 20, 52).unwrap(),
/// );
/// assert!(!process.is_finished());
/// assert_eq!(process.table_key(), "babette:1031:sys-apps/systemd-254.5-r1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildProcess {
    /// Logical machine (build profile) the package is built for.
    pub machine: String,

    /// Identifier of the build run.
    pub build_id: String,

    /// Host currently responsible for this process.
    pub build_host: String,

    /// Package identifier, usually the CPV (`category/name-version`).
    pub package: String,

    /// Current lifecycle phase (e.g. `"compile"`, `"postinst"`, `"clean"`).
    pub phase: String,

    /// When this process started.
    pub start_time: DateTime<Utc>,
}

impl BuildProcess {
    /// Creates a new build process record.
    pub fn new(
        machine: impl Into<String>,
        build_id: impl Into<String>,
        build_host: impl Into<String>,
        package: impl Into<String>,
        phase: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            machine: machine.into(),
            build_id: build_id.into(),
            build_host: build_host.into(),
            package: package.into(),
            phase: phase.into(),
            start_time,
        }
    }

    /// Returns `true` if the process is in one of the final phases.
    pub fn is_finished(&self) -> bool {
        is_final_phase(&self.phase)
    }

    /// Returns `true` if `other` is the same logical process.
    ///
    /// Two processes are the same if machine, build_id and package match.
    /// The build host is deliberately not compared: a process may move
    /// between hosts during its lifetime.
    pub fn is_same_as(&self, other: &BuildProcess) -> bool {
        self.machine == other.machine
            && self.build_id == other.build_id
            && self.package == other.package
    }

    /// Returns `true` if `newer` replaces this process.
    ///
    /// That is the case when both refer to the same package on the same
    /// machine but belong to different builds. The older record is the
    /// leftover of an interrupted build.
    pub fn is_superseded_by(&self, newer: &BuildProcess) -> bool {
        self.machine == newer.machine
            && self.package == newer.package
            && self.build_id != newer.build_id
    }

    /// Checks that `incoming` may be applied on top of this (stored) process.
    ///
    /// Only the host that owns the process may move it into a final phase.
    /// Non-final updates are always allowed.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::UpdateNotAllowed`] if `incoming` is final and
    /// comes from a different build host.
    ///
    /// # Examples
    ///
    /// ```
    /// use build_ps::{BuildProcess, ProcessError};
    /// use chrono::Utc;
    ///
    /// let stored = BuildProcess::new("babette", "1031", "jenkins", "pipeline", "pull", Utc::now());
    ///
    /// let mut finalize = stored.clone();
    /// finalize.build_host = "gbp".to_string();
    /// finalize.phase = "clean".to_string();
    /// assert!(matches!(
    ///     stored.ensure_updateable(&finalize),
    ///     Err(ProcessError::UpdateNotAllowed { .. })
    /// ));
    ///
    /// finalize.build_host = "jenkins".to_string();
    /// assert!(stored.ensure_updateable(&finalize).is_ok());
    /// ```
    pub fn ensure_updateable(&self, incoming: &BuildProcess) -> Result<(), ProcessError> {
        if incoming.is_finished() && incoming.build_host != self.build_host {
            return Err(ProcessError::UpdateNotAllowed {
                process: Box::new(incoming.clone()),
                owner: self.build_host.clone(),
            });
        }
        Ok(())
    }

    /// Returns this process with `phase` and `build_host` taken from
    /// `incoming`. The stored `start_time` is kept.
    pub fn updated_from(&self, incoming: &BuildProcess) -> BuildProcess {
        BuildProcess {
            phase: incoming.phase.clone(),
            build_host: incoming.build_host.clone(),
            ..self.clone()
        }
    }

    /// Returns the key of this process in a serialized process table.
    ///
    /// The format is `{machine}:{build_id}:{package}`.
    pub fn table_key(&self) -> String {
        format!("{}:{}:{}", self.machine, self.build_id, self.package)
    }
}

/// Returns `true` if `phase` is one of [`FINAL_PROCESS_PHASES`].
pub fn is_final_phase(phase: &str) -> bool {
    FINAL_PROCESS_PHASES.contains(&phase)
}
