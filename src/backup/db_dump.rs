// dbvault/src/backup/db_dump.rs
use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::process::Command;
use tracing::{info, warn};

use crate::catalog::{BackupStrategy, DatabaseInfo};
use crate::errors::{BackupError, RestoreError};
use crate::utils::find_executable;
use crate::utils::setting::redact_url;

/// Dumps and restores the application database.
#[async_trait]
pub trait DatabaseBackup: Send + Sync {
    async fn backup_full(&self, output: &Path) -> Result<DatabaseInfo, BackupError>;

    async fn backup_schema(&self, output: &Path) -> Result<DatabaseInfo, BackupError>;

    async fn backup_data(&self, output: &Path) -> Result<DatabaseInfo, BackupError>;

    /// Loads a dump of the given kind into `target_database` (the source
    /// database when `None`). Full and schema dumps replace the database;
    /// data dumps load into the existing tables.
    async fn restore(
        &self,
        dump: &Path,
        kind: BackupStrategy,
        target_database: Option<&str>,
    ) -> Result<(), RestoreError>;
}

/// Dump file name for a strategy, e.g. `database_schema.dump`.
pub fn dump_file_name(strategy: BackupStrategy) -> String {
    format!("database_{}.dump", strategy.as_str())
}

/// Kind of dump a file holds, from its name.
pub fn dump_kind(file_name: &str) -> Option<BackupStrategy> {
    [BackupStrategy::Full, BackupStrategy::Schema, BackupStrategy::Data]
        .into_iter()
        .find(|strategy| dump_file_name(*strategy) == file_name)
}

/// Runs the dump matching `strategy`. Strategies without a dump are rejected.
pub async fn dump_for_strategy(
    database: &dyn DatabaseBackup,
    strategy: BackupStrategy,
    output: &Path,
) -> Result<DatabaseInfo, BackupError> {
    match strategy {
        BackupStrategy::Full => database.backup_full(output).await,
        BackupStrategy::Schema => database.backup_schema(output).await,
        BackupStrategy::Data => database.backup_data(output).await,
        other => Err(BackupError::UnsupportedStrategy(other.to_string())),
    }
}

/// `pg_dump`/`pg_restore` based implementation.
#[derive(Debug, Clone)]
pub struct PgDumpManager {
    pub(crate) database_url: String,
    pub(crate) pg_bin_dir: Option<PathBuf>,
}

impl PgDumpManager {
    pub fn new(database_url: impl Into<String>, pg_bin_dir: Option<PathBuf>) -> Self {
        Self {
            database_url: database_url.into(),
            pg_bin_dir,
        }
    }

    pub(crate) fn executable(&self, name: &str) -> Result<PathBuf, BackupError> {
        find_executable(name, self.pg_bin_dir.as_deref()).map_err(|e| BackupError::Command {
            tool: name.to_string(),
            status: "not found".to_string(),
            stderr: e.to_string(),
        })
    }

    async fn dump(&self, strategy: BackupStrategy, output: &Path) -> Result<DatabaseInfo, BackupError> {
        let pg_dump_path = self.executable("pg_dump")?;
        info!(
            "Dumping {} of {} to {} using pg_dump...",
            strategy,
            redact_url(&self.database_url),
            output.display()
        );

        let mut command = Command::new(&pg_dump_path);
        command
            .arg("--format=custom")
            .arg("--no-owner")
            .arg("--no-privileges");
        match strategy {
            BackupStrategy::Schema => {
                command.arg("--schema-only");
            }
            BackupStrategy::Data => {
                command.arg("--data-only");
            }
            _ => {}
        }
        command
            .arg("-f")
            .arg(output)
            .arg(&self.database_url)
            .kill_on_drop(true);

        let started = Instant::now();
        let dump_output = command.output().await?;
        let duration_seconds = started.elapsed().as_secs_f64();

        if !dump_output.status.success() {
            return Err(BackupError::Command {
                tool: "pg_dump".to_string(),
                status: dump_output.status.to_string(),
                stderr: String::from_utf8_lossy(&dump_output.stderr).trim().to_string(),
            });
        }

        let dump_size_bytes = tokio::fs::metadata(output).await?.len();
        let (table_count, database_size_bytes) = self.collect_metrics().await;

        info!(
            "✓ pg_dump ({}) finished in {:.2}s, {} bytes",
            strategy, duration_seconds, dump_size_bytes
        );
        Ok(DatabaseInfo {
            dump_type: strategy.as_str().to_string(),
            duration_seconds,
            dump_size_bytes,
            table_count,
            database_size_bytes,
        })
    }

    /// Table count and on-disk size. Failures only cost the metrics.
    async fn collect_metrics(&self) -> (Option<i64>, Option<i64>) {
        let mut conn = match PgConnection::connect(&self.database_url).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Could not connect to collect database metrics: {}", e);
                return (None, None);
            }
        };

        let table_count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM information_schema.tables
             WHERE table_type = 'BASE TABLE'
               AND table_schema NOT IN ('pg_catalog', 'information_schema')",
        )
        .fetch_one(&mut conn)
        .await
        .map_err(|e| warn!("Failed to count tables: {}", e))
        .ok();

        let database_size = sqlx::query_scalar::<_, i64>(
            "SELECT pg_database_size(current_database())",
        )
        .fetch_one(&mut conn)
        .await
        .map_err(|e| warn!("Failed to read database size: {}", e))
        .ok();

        let _ = conn.close().await;
        (table_count, database_size)
    }
}

#[async_trait]
impl DatabaseBackup for PgDumpManager {
    async fn backup_full(&self, output: &Path) -> Result<DatabaseInfo, BackupError> {
        self.dump(BackupStrategy::Full, output).await
    }

    async fn backup_schema(&self, output: &Path) -> Result<DatabaseInfo, BackupError> {
        self.dump(BackupStrategy::Schema, output).await
    }

    async fn backup_data(&self, output: &Path) -> Result<DatabaseInfo, BackupError> {
        self.dump(BackupStrategy::Data, output).await
    }

    async fn restore(
        &self,
        dump: &Path,
        kind: BackupStrategy,
        target_database: Option<&str>,
    ) -> Result<(), RestoreError> {
        self.restore_dump(dump, kind, target_database).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_file_names() {
        assert_eq!(dump_file_name(BackupStrategy::Full), "database_full.dump");
        assert_eq!(dump_file_name(BackupStrategy::Schema), "database_schema.dump");
        assert_eq!(dump_kind("database_data.dump"), Some(BackupStrategy::Data));
        assert_eq!(dump_kind("database_full.dump"), Some(BackupStrategy::Full));
        assert_eq!(dump_kind("database_incremental.dump"), None);
        assert_eq!(dump_kind("uploads.tar.gz"), None);
    }

    #[tokio::test]
    async fn test_incremental_has_no_dump() {
        let manager = PgDumpManager::new("postgres://localhost/app", None);
        let result = dump_for_strategy(
            &manager,
            BackupStrategy::Incremental,
            Path::new("/tmp/never.dump"),
        )
        .await;
        assert!(matches!(result, Err(BackupError::UnsupportedStrategy(s)) if s == "incremental"));
    }

    #[tokio::test]
    async fn test_missing_pg_dump_is_a_command_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = PgDumpManager::new("postgres://localhost/app", Some(dir.path().to_path_buf()));
        let err = manager.executable("definitely-not-a-pg-tool").unwrap_err();
        assert!(matches!(err, BackupError::Command { ref status, .. } if status == "not found"));
    }
}
