//! build-ps: inspect and report in-flight package builds

use std::path::PathBuf;

use anyhow::{Context, Result};
use build_ps::payload::ProcessPayload;
use build_ps::store::sqlite::SqliteRepository;
use build_ps::{add_or_update_process, BuildProcess, ListProcessesOptions, Repo, Settings};
use clap::{Parser, Subcommand};

/// Process table for in-flight package builds
#[derive(Parser)]
#[command(name = "build-ps")]
#[command(about = "Show and report build processes", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file with a [ps] table
    #[arg(long, global = true, env = "BUILD_PS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add or update a process for this host
    AddProcess {
        /// Machine the package is built for
        machine: String,

        /// Build id
        number: String,

        /// Package being built
        package: String,

        /// Current phase
        phase: String,

        /// Write to the SQLite database at this path instead of the
        /// configured repository
        #[arg(long)]
        local: Option<PathBuf>,
    },

    /// List processes, one JSON object per line
    Ps {
        /// Include finished processes
        #[arg(long)]
        all: bool,

        /// Only list processes of this machine
        #[arg(long)]
        machine: Option<String>,
    },

    /// Remove every process
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    #[cfg(feature = "logging")]
    init_logging();

    let cli = Cli::parse();
    let settings =
        Settings::load(cli.config.as_deref()).context("failed to load configuration")?;

    execute_command(cli.command, &settings).await
}

async fn execute_command(command: Commands, settings: &Settings) -> Result<()> {
    match command {
        Commands::AddProcess {
            machine,
            number,
            package,
            phase,
            local,
        } => {
            let repo = match local {
                Some(path) => local_repo(&path).await?,
                None => open_repo(settings).await?,
            };
            let process = BuildProcess::new(
                machine,
                number,
                build_ps::signals::local_build_host(),
                package,
                phase,
                chrono::Utc::now(),
            );
            add_or_update_process(repo.as_ref(), &process)
                .await
                .with_context(|| format!("failed to record process {}", process.table_key()))?;
        },
        Commands::Ps { all, machine } => {
            let repo = open_repo(settings).await?;
            let options = ListProcessesOptions {
                include_final: all,
                machine,
            };
            let processes = repo
                .get_processes(&options)
                .await
                .context("failed to list processes")?;
            for process in &processes {
                println!("{}", serde_json::to_string(&ProcessPayload::from(process))?);
            }
        },
        Commands::Clear => {
            open_repo(settings)
                .await?
                .clear()
                .await
                .context("failed to clear processes")?;
        },
    }

    Ok(())
}

async fn open_repo(settings: &Settings) -> Result<Repo> {
    build_ps::open(settings)
        .await
        .with_context(|| format!("failed to open {:?} repository", settings.storage_backend))
}

async fn local_repo(path: &std::path::Path) -> Result<Repo> {
    let database = path.to_string_lossy();
    let repo = SqliteRepository::connect(&database)
        .await
        .with_context(|| format!("failed to open local database {}", path.display()))?;
    Ok(std::sync::Arc::new(repo))
}

/// Log to stderr, keeping stdout for command output
#[cfg(feature = "logging")]
fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
