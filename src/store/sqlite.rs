//! SQLite-backed process repository.
//!
//! Every mutation runs in its own `BEGIN IMMEDIATE` transaction, so
//! supersession and insert (or lookup and update) are applied together or
//! not at all, and concurrent writers queue on the busy timeout instead of
//! failing on a read-to-write lock upgrade. Records never expire here;
//! finished processes stay until [`ProcessRepository::clear`].

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::constants::FINAL_PROCESS_PHASES;
use crate::domain::BuildProcess;
use crate::error::ProcessError;
use crate::store::{ListProcessesOptions, ProcessRepository};

/// Database name that selects a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Takes the write lock up front; a deferred transaction that reads first
/// gets `SQLITE_BUSY` when another writer got there in between.
const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

/// SQLite-backed process repository.
#[derive(Debug, Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Opens (and if needed creates) the database at `database`.
    ///
    /// [`IN_MEMORY`] opens a database that lives as long as the repository.
    /// Anything else is a file path; the file is created if missing.
    pub async fn connect(database: &str) -> Result<Self, ProcessError> {
        info!(database, "opening SQLite process repository");

        let pool = if database == IN_MEMORY {
            // Each connection to :memory: is its own database, so keep
            // exactly one open for the life of the pool.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await?
        } else {
            let options = SqliteConnectOptions::new()
                .filename(database)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        let repo = Self { pool };
        repo.initialize_schema().await?;
        Ok(repo)
    }

    /// Opens a private in-memory repository.
    pub async fn in_memory() -> Result<Self, ProcessError> {
        Self::connect(IN_MEMORY).await
    }

    async fn initialize_schema(&self) -> Result<(), ProcessError> {
        debug!("initializing process table schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ebuild_process (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                machine TEXT NOT NULL,
                build_id TEXT NOT NULL,
                build_host TEXT NOT NULL,
                package TEXT NOT NULL,
                phase TEXT NOT NULL,
                start_time TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_process_identity \
             ON ebuild_process(machine, build_id, build_host, package)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_process_machine ON ebuild_process(machine)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_process_phase ON ebuild_process(phase)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Formats `time` as fixed-width RFC 3339 UTC, so that text order is time
/// order.
fn format_start_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn row_to_process(row: &SqliteRow) -> Result<BuildProcess, sqlx::Error> {
    Ok(BuildProcess {
        machine: row.try_get("machine")?,
        build_id: row.try_get("build_id")?,
        build_host: row.try_get("build_host")?,
        package: row.try_get("package")?,
        phase: row.try_get("phase")?,
        start_time: row.try_get("start_time")?,
    })
}

fn map_insert_error(err: sqlx::Error, process: &BuildProcess) -> ProcessError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ProcessError::RecordAlreadyExists(Box::new(process.clone()))
        },
        other => ProcessError::Database(other),
    }
}

#[async_trait]
impl ProcessRepository for SqliteRepository {
    async fn add_process(&self, process: &BuildProcess) -> Result<(), ProcessError> {
        let mut tx = self.pool.begin_with(BEGIN_WRITE).await?;

        let superseded = sqlx::query(
            "DELETE FROM ebuild_process WHERE machine = ? AND package = ? AND build_id != ?",
        )
        .bind(&process.machine)
        .bind(&process.package)
        .bind(&process.build_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if superseded > 0 {
            debug!(
                machine = %process.machine,
                package = %process.package,
                superseded,
                "dropping superseded processes"
            );
        }

        sqlx::query(
            r#"
            INSERT INTO ebuild_process (machine, build_id, build_host, package, phase, start_time)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&process.machine)
        .bind(&process.build_id)
        .bind(&process.build_host)
        .bind(&process.package)
        .bind(&process.phase)
        .bind(format_start_time(&process.start_time))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_insert_error(e, process))?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_process(&self, process: &BuildProcess) -> Result<(), ProcessError> {
        let mut tx = self.pool.begin_with(BEGIN_WRITE).await?;

        // The identity includes the host, so several hosts may hold a row
        // for the same build. The caller's own row wins.
        let row = sqlx::query(
            r#"
            SELECT id, machine, build_id, build_host, package, phase, start_time
            FROM ebuild_process
            WHERE machine = ? AND build_id = ? AND package = ?
            ORDER BY (build_host = ?) DESC, id
            LIMIT 1
            "#,
        )
        .bind(&process.machine)
        .bind(&process.build_id)
        .bind(&process.package)
        .bind(&process.build_host)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(ProcessError::RecordNotFound(Box::new(process.clone())));
        };
        let id: i64 = row.try_get("id")?;
        let stored = row_to_process(&row)?;
        stored.ensure_updateable(process)?;

        sqlx::query("UPDATE ebuild_process SET phase = ?, build_host = ? WHERE id = ?")
            .bind(&process.phase)
            .bind(&process.build_host)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_processes(
        &self,
        options: &ListProcessesOptions,
    ) -> Result<Vec<BuildProcess>, ProcessError> {
        let mut sql = String::from(
            "SELECT machine, build_id, build_host, package, phase, start_time FROM ebuild_process",
        );
        let mut conditions = Vec::new();
        if !options.include_final {
            let placeholders = vec!["?"; FINAL_PROCESS_PHASES.len()].join(", ");
            conditions.push(format!("phase NOT IN ({placeholders})"));
        }
        if options.machine.is_some() {
            conditions.push("machine = ?".to_string());
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY start_time");

        let mut query = sqlx::query(&sql);
        if !options.include_final {
            for phase in FINAL_PROCESS_PHASES {
                query = query.bind(phase);
            }
        }
        if let Some(machine) = &options.machine {
            query = query.bind(machine);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(row_to_process)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn clear(&self) -> Result<(), ProcessError> {
        let deleted = sqlx::query("DELETE FROM ebuild_process")
            .execute(&self.pool)
            .await?
            .rows_affected();
        debug!(deleted, "cleared process table");
        Ok(())
    }
}
