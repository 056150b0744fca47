//! Wire payloads for query and mutation collaborators.
//!
//! Collaborators submit and read processes as camelCase JSON objects. A
//! build id travels as `id`, and `startTime` may be omitted on submission.
//!
//! ```json
//! {
//!   "machine": "babette",
//!   "id": "1031",
//!   "buildHost": "jenkins",
//!   "package": "sys-apps/systemd-254.5-r1",
//!   "phase": "compile",
//!   "startTime": "2023-11-11T12:20:52Z"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::BuildProcess;
use crate::error::ProcessError;
use crate::store::{add_or_update_process, ListProcessesOptions, ProcessRepository};

/// A build process as exchanged with collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessPayload {
    /// Machine the package is built for.
    #[serde(default)]
    pub machine: String,
    /// Build id.
    #[serde(default)]
    pub id: String,
    /// Host running the build.
    #[serde(default)]
    pub build_host: String,
    /// Package being built.
    #[serde(default)]
    pub package: String,
    /// Current phase.
    #[serde(default)]
    pub phase: String,
    /// When the process started. Defaults to the submission time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

impl ProcessPayload {
    /// Returns `true` if every field needed to identify the process is set.
    ///
    /// `buildHost` may be empty.
    pub fn is_complete(&self) -> bool {
        !(self.machine.is_empty()
            || self.id.is_empty()
            || self.package.is_empty()
            || self.phase.is_empty())
    }

    /// Converts into a [`BuildProcess`], using `now` if no start time was
    /// given.
    pub fn into_process(self, now: DateTime<Utc>) -> BuildProcess {
        BuildProcess {
            machine: self.machine,
            build_id: self.id,
            build_host: self.build_host,
            package: self.package,
            phase: self.phase,
            start_time: self.start_time.unwrap_or(now),
        }
    }
}

impl From<&BuildProcess> for ProcessPayload {
    fn from(process: &BuildProcess) -> Self {
        Self {
            machine: process.machine.clone(),
            id: process.build_id.clone(),
            build_host: process.build_host.clone(),
            package: process.package.clone(),
            phase: process.phase.clone(),
            start_time: Some(process.start_time),
        }
    }
}

/// Records a submitted process.
///
/// Incomplete payloads are ignored. Complete ones go through
/// [`add_or_update_process`], so an attempt by a non-owning host to finish a
/// process is silently dropped.
pub async fn submit_payload(
    repo: &dyn ProcessRepository,
    payload: ProcessPayload,
) -> Result<(), ProcessError> {
    if !payload.is_complete() {
        tracing::debug!(?payload, "ignoring incomplete process payload");
        return Ok(());
    }

    let process = payload.into_process(Utc::now());
    add_or_update_process(repo, &process).await
}

/// Lists processes as payloads, oldest first.
pub async fn list_payloads(
    repo: &dyn ProcessRepository,
    include_final: bool,
    machine: Option<String>,
) -> Result<Vec<ProcessPayload>, ProcessError> {
    let options = ListProcessesOptions {
        include_final,
        machine,
    };
    Ok(repo
        .get_processes(&options)
        .await?
        .iter()
        .map(ProcessPayload::from)
        .collect())
}
