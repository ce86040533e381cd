// dbvault/src/restore/db_restore.rs
use sqlx::{Connection, PgConnection};
use std::path::Path;
use tokio::process::Command;
use tracing::info;
use url::Url;

use crate::backup::db_dump::PgDumpManager;
use crate::catalog::BackupStrategy;
use crate::errors::RestoreError;

impl PgDumpManager {
    /// Loads a custom-format dump into the target database.
    ///
    /// Full and schema dumps drop and recreate the target first. Data dumps
    /// never drop anything: they load in one transaction into a target whose
    /// tables must already exist.
    pub(crate) async fn restore_dump(
        &self,
        dump: &Path,
        kind: BackupStrategy,
        target_database: Option<&str>,
    ) -> Result<(), RestoreError> {
        if !dump.is_file() {
            return Err(RestoreError::Component(format!(
                "Dump file for database restore not found: {}",
                dump.display()
            )));
        }

        let target_name = match target_database.filter(|t| !t.trim().is_empty()) {
            Some(name) => name.to_string(),
            None => get_db_name_from_url(&self.database_url)?,
        };
        validate_database_name(&target_name)?;
        let target_url = database_url_for(&self.database_url, &target_name)?;

        if recreates_target(kind) {
            recreate_database(&self.database_url, &target_name).await?;
        } else {
            ensure_schema_present(&target_url, &target_name).await?;
        }

        let pg_restore_path = self
            .executable("pg_restore")
            .map_err(|e| RestoreError::Component(e.to_string()))?;

        info!(
            "Restoring {} dump {} into database '{}' using pg_restore...",
            kind,
            dump.display(),
            target_name
        );
        let output = Command::new(pg_restore_path)
            .args(pg_restore_args(kind))
            .arg("-d")
            .arg(&target_url)
            .arg(dump)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(RestoreError::Component(format!(
                "pg_restore into '{}' failed with status {}: {}",
                target_name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!("✓ Database '{}' restored", target_name);
        Ok(())
    }
}

/// Data-only dumps carry no DDL, so dropping the target would lose the tables
/// they load into.
fn recreates_target(kind: BackupStrategy) -> bool {
    kind != BackupStrategy::Data
}

fn pg_restore_args(kind: BackupStrategy) -> Vec<&'static str> {
    let mut args = vec!["--no-owner", "--no-privileges", "--exit-on-error"];
    if kind == BackupStrategy::Data {
        args.extend(["--data-only", "--single-transaction"]);
    }
    args
}

/// Fails unless the target database exists and has user tables.
async fn ensure_schema_present(target_url: &str, db_name: &str) -> Result<(), RestoreError> {
    let mut conn = PgConnection::connect(target_url).await.map_err(|e| {
        RestoreError::Component(format!(
            "Data-only restore needs an existing database '{}': {}",
            db_name, e
        ))
    })?;
    let table_count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM information_schema.tables
         WHERE table_type = 'BASE TABLE'
           AND table_schema NOT IN ('pg_catalog', 'information_schema')",
    )
    .fetch_one(&mut conn)
    .await
    .map_err(|e| {
        RestoreError::Component(format!("Failed to inspect tables of '{}': {}", db_name, e))
    })?;
    let _ = conn.close().await;

    if table_count == 0 {
        return Err(RestoreError::Component(format!(
            "Database '{}' has no tables; restore a schema or full backup before a data-only one",
            db_name
        )));
    }
    Ok(())
}

/// Drops `db_name` if it exists and creates it again, owned by the URL's user.
async fn recreate_database(source_url: &str, db_name: &str) -> Result<(), RestoreError> {
    if db_name.eq_ignore_ascii_case("postgres") {
        return Err(RestoreError::Component(
            "Refusing to drop the 'postgres' maintenance database".to_string(),
        ));
    }

    let admin_url = database_url_for(source_url, "postgres")?;
    let mut admin = PgConnection::connect(&admin_url)
        .await
        .map_err(|e| RestoreError::Component(format!("Failed to connect to 'postgres' database on target server: {}", e)))?;

    let component = |action: &str, e: sqlx::Error| {
        RestoreError::Component(format!("Failed to {} database '{}': {}", action, db_name, e))
    };

    sqlx::query(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()",
    )
    .bind(db_name)
    .execute(&mut admin)
    .await
    .map_err(|e| component("terminate connections to", e))?;

    let quoted = quote_identifier(db_name);
    sqlx::query(&format!("DROP DATABASE IF EXISTS {}", quoted))
        .execute(&mut admin)
        .await
        .map_err(|e| component("drop", e))?;

    let owner = Url::parse(source_url)
        .map(|u| u.username().to_string())
        .unwrap_or_default();
    let mut create_sql = format!("CREATE DATABASE {}", quoted);
    if !owner.is_empty() {
        create_sql.push_str(&format!(" OWNER {}", quote_identifier(&owner)));
    }
    sqlx::query(&create_sql)
        .execute(&mut admin)
        .await
        .map_err(|e| component("create", e))?;

    let _ = admin.close().await;
    info!("✓ Database '{}' dropped and recreated", db_name);
    Ok(())
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn validate_database_name(name: &str) -> Result<(), RestoreError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(RestoreError::Component(format!(
            "Invalid target database name: {}",
            name
        )))
    }
}

/// Extracts the database name from a PostgreSQL connection URL.
pub fn get_db_name_from_url(db_url: &str) -> Result<String, RestoreError> {
    let parsed_url = Url::parse(db_url)
        .map_err(|e| RestoreError::Component(format!("Invalid database URL format: {}", e)))?;
    let path = parsed_url.path().trim_start_matches('/');
    if path.is_empty() {
        Err(RestoreError::Component(
            "Database name not found in URL path".to_string(),
        ))
    } else {
        Ok(path.to_string())
    }
}

/// Same server and credentials, different database.
fn database_url_for(db_url: &str, db_name: &str) -> Result<String, RestoreError> {
    let mut parsed = Url::parse(db_url)
        .map_err(|e| RestoreError::Component(format!("Invalid database URL format: {}", e)))?;
    parsed.set_path(&format!("/{}", db_name));
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_name_from_url() -> anyhow::Result<()> {
        assert_eq!(
            get_db_name_from_url("postgres://app:pw@db:5432/shop?sslmode=require")?,
            "shop"
        );
        assert!(get_db_name_from_url("postgres://app:pw@db:5432").is_err());
        Ok(())
    }

    #[test]
    fn test_database_url_for_keeps_credentials_and_query() -> anyhow::Result<()> {
        let url = database_url_for("postgres://app:pw@db:5432/shop?sslmode=require", "shop_restored")?;
        assert_eq!(url, "postgres://app:pw@db:5432/shop_restored?sslmode=require");
        Ok(())
    }

    #[test]
    fn test_database_name_validation() {
        assert!(validate_database_name("shop_restored-2").is_ok());
        assert!(validate_database_name("shop; DROP TABLE x").is_err());
        assert!(validate_database_name("").is_err());
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test]
    async fn test_missing_dump_file_is_component_failure() {
        let manager = PgDumpManager::new("postgres://app@localhost/shop", None);
        let result = manager
            .restore_dump(
                Path::new("/nonexistent/database_full.dump"),
                BackupStrategy::Full,
                None,
            )
            .await;
        assert!(matches!(result, Err(RestoreError::Component(_))));
    }

    #[test]
    fn test_only_data_dumps_keep_the_target() {
        assert!(recreates_target(BackupStrategy::Full));
        assert!(recreates_target(BackupStrategy::Schema));
        assert!(!recreates_target(BackupStrategy::Data));
    }

    #[test]
    fn test_pg_restore_args_per_kind() {
        let full = pg_restore_args(BackupStrategy::Full);
        assert!(full.contains(&"--exit-on-error"));
        assert!(!full.contains(&"--data-only"));

        let data = pg_restore_args(BackupStrategy::Data);
        assert!(data.contains(&"--data-only"));
        assert!(data.contains(&"--single-transaction"));
    }

    #[tokio::test]
    async fn test_data_restore_never_drops_an_unreachable_target() {
        // Nothing listens on port 1, so the schema check fails before pg_restore
        // and no DROP DATABASE is ever attempted.
        let dir = tempfile::TempDir::new().unwrap();
        let dump = dir.path().join("database_data.dump");
        std::fs::write(&dump, b"PGDMP").unwrap();
        let manager = PgDumpManager::new("postgres://app:pw@127.0.0.1:1/shop", None);

        let err = manager
            .restore_dump(&dump, BackupStrategy::Data, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Data-only restore needs an existing database 'shop'"));
    }
}
