//! Pipeline event handlers.
//!
//! Pulling a finished build into the publishing pipeline is not an ebuild
//! phase, but it still shows up in the process table as a synthetic
//! `pipeline` package: `pull` when the pull starts and `clean` once it is
//! done.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::PIPELINE_PACKAGE;
use crate::domain::BuildProcess;
use crate::error::ProcessError;
use crate::store::ProcessRepository;

/// Identifies a build by machine and build id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildRef {
    /// Machine the build belongs to.
    pub machine: String,
    /// Build id.
    pub build_id: String,
}

impl BuildRef {
    /// Creates a build reference.
    pub fn new(machine: impl Into<String>, build_id: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            build_id: build_id.into(),
        }
    }
}

/// Events emitted around pulling a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum PipelineEvent {
    /// A pull is about to start.
    PrePull {
        /// The build being pulled.
        build: BuildRef,
    },
    /// A pull has finished.
    PostPull {
        /// The build that was pulled.
        build: BuildRef,
    },
}

impl PipelineEvent {
    /// The build the event refers to.
    pub fn build(&self) -> &BuildRef {
        match self {
            Self::PrePull { build } | Self::PostPull { build } => build,
        }
    }

    /// The phase recorded for this event.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::PrePull { .. } => "pull",
            Self::PostPull { .. } => "clean",
        }
    }
}

/// Builds the synthetic pipeline process for `build`.
///
/// # Examples
///
/// ```
/// use build_ps::signals::{create_build_process, BuildRef};
/// use chrono::Utc;
///
/// let process = create_build_process(&BuildRef::new("babette", "10"), "wopr", "pull", Utc::now());
/// assert_eq!(process.package, "pipeline");
/// assert_eq!(process.build_id, "10");
/// ```
pub fn create_build_process(
    build: &BuildRef,
    build_host: &str,
    phase: &str,
    start_time: DateTime<Utc>,
) -> BuildProcess {
    BuildProcess::new(
        build.machine.as_str(),
        build.build_id.as_str(),
        build_host,
        PIPELINE_PACKAGE,
        phase,
        start_time,
    )
}

/// Records the process for `event`, reported by `build_host` at `now`.
pub async fn handle_event(
    repo: &dyn ProcessRepository,
    event: &PipelineEvent,
    build_host: &str,
    now: DateTime<Utc>,
) -> Result<(), ProcessError> {
    let process = create_build_process(event.build(), build_host, event.phase(), now);
    tracing::debug!(
        machine = %process.machine,
        build_id = %process.build_id,
        phase = %process.phase,
        "recording pipeline event"
    );
    repo.add_process(&process).await
}

/// Returns this host's name, used as the build host of locally reported
/// processes.
pub fn local_build_host() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteRepository;
    use crate::store::ListProcessesOptions;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    const NODE: &str = "wopr";

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 12, 10, 13, 53, 46).unwrap()
    }

    fn build() -> BuildRef {
        BuildRef::new("babette", "10")
    }

    async fn all_processes(repo: &SqliteRepository) -> Vec<BuildProcess> {
        repo.get_processes(&ListProcessesOptions {
            include_final: true,
            machine: None,
        })
        .await
        .unwrap()
    }

    #[test]
    fn create_build_process_uses_pipeline_package() {
        let process = create_build_process(&build(), NODE, "test", start_time());
        assert_eq!(
            process,
            BuildProcess::new("babette", "10", NODE, "pipeline", "test", start_time())
        );
    }

    #[tokio::test]
    async fn prepull_records_pull_phase() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let event = PipelineEvent::PrePull { build: build() };

        handle_event(&repo, &event, NODE, start_time()).await.unwrap();

        assert_eq!(
            all_processes(&repo).await,
            vec![create_build_process(&build(), NODE, "pull", start_time())]
        );
    }

    #[tokio::test]
    async fn postpull_records_clean_phase() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let event = PipelineEvent::PostPull { build: build() };

        handle_event(&repo, &event, NODE, start_time()).await.unwrap();

        assert_eq!(
            all_processes(&repo).await,
            vec![create_build_process(&build(), NODE, "clean", start_time())]
        );
    }

    #[test]
    fn event_wire_format() {
        let event: PipelineEvent =
            serde_json::from_str(r#"{"event":"prepull","build":{"machine":"babette","build_id":"10"}}"#)
                .unwrap();
        assert_eq!(event, PipelineEvent::PrePull { build: build() });
        assert_eq!(event.phase(), "pull");
    }

    #[test]
    fn local_build_host_is_not_empty() {
        assert!(!local_build_host().is_empty());
    }
}
