// dbvault/src/backup/testing.rs
//! Fixtures shared by the backup and restore orchestrator tests.

use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use super::archive::FileArchiveManager;
use super::db_dump::DatabaseBackup;
use super::encryption::EncryptionManager;
use super::logic::BackupContext;
use crate::catalog::{BackupStrategy, DatabaseInfo, MetadataStore};
use crate::config::ContentPaths;
use crate::errors::{BackupError, RestoreError};
use crate::storage::LocalStorage;

/// Stands in for `pg_dump`/`pg_restore`, with a table list that behaves like
/// the real restore: full and schema dumps replace it, data dumps keep it.
pub(crate) struct FakeDatabase {
    fail_dump: bool,
    fail_restore: bool,
    tables: Mutex<Vec<String>>,
    /// Contents, kind and target of every restored dump.
    pub restored: Mutex<Vec<(String, BackupStrategy, Option<String>)>>,
}

impl Default for FakeDatabase {
    fn default() -> Self {
        Self {
            fail_dump: false,
            fail_restore: false,
            tables: Mutex::new(vec!["customers".to_string(), "orders".to_string()]),
            restored: Mutex::new(Vec::new()),
        }
    }
}

impl FakeDatabase {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn tables(&self) -> Vec<String> {
        self.tables.lock().unwrap().clone()
    }

    pub fn failing_dump() -> Self {
        Self {
            fail_dump: true,
            ..Self::default()
        }
    }

    pub fn failing_restore() -> Self {
        Self {
            fail_restore: true,
            ..Self::default()
        }
    }

    fn write_dump(&self, kind: &str, output: &Path) -> Result<DatabaseInfo, BackupError> {
        if self.fail_dump {
            return Err(BackupError::Command {
                tool: "pg_dump".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "connection refused".to_string(),
            });
        }
        let body = format!("PGDMP {} dump", kind);
        fs::write(output, &body)?;
        Ok(DatabaseInfo {
            dump_type: kind.to_string(),
            duration_seconds: 0.01,
            dump_size_bytes: body.len() as u64,
            table_count: Some(3),
            database_size_bytes: Some(8192),
        })
    }
}

#[async_trait]
impl DatabaseBackup for FakeDatabase {
    async fn backup_full(&self, output: &Path) -> Result<DatabaseInfo, BackupError> {
        self.write_dump("full", output)
    }

    async fn backup_schema(&self, output: &Path) -> Result<DatabaseInfo, BackupError> {
        self.write_dump("schema", output)
    }

    async fn backup_data(&self, output: &Path) -> Result<DatabaseInfo, BackupError> {
        self.write_dump("data", output)
    }

    async fn restore(
        &self,
        dump: &Path,
        kind: BackupStrategy,
        target_database: Option<&str>,
    ) -> Result<(), RestoreError> {
        if self.fail_restore {
            return Err(RestoreError::Component(
                "pg_restore exited with exit status: 1".to_string(),
            ));
        }
        let contents = fs::read_to_string(dump)?;
        if kind != BackupStrategy::Data {
            *self.tables.lock().unwrap() = vec!["restored".to_string()];
        }
        self.restored
            .lock()
            .unwrap()
            .push((contents, kind, target_database.map(str::to_string)));
        Ok(())
    }
}

pub(crate) struct Fixture {
    pub dir: TempDir,
    pub storage: LocalStorage,
    pub database: Arc<FakeDatabase>,
    pub context: BackupContext,
}

/// Application tree with uploads, config and logs, a local store and a
/// catalog, all under one temp dir.
pub(crate) fn fixture(database: FakeDatabase) -> anyhow::Result<Fixture> {
    let dir = TempDir::new()?;
    let app = dir.path().join("app");

    let media = app.join("media");
    fs::create_dir_all(media.join("avatars"))?;
    fs::write(media.join("avatars/alice.png"), vec![42u8; 2048])?;
    fs::write(media.join("report.pdf"), b"%PDF-1.7 quarterly")?;
    fs::write(media.join("upload.tmp"), b"partial")?;

    let settings = app.join("settings.toml");
    fs::write(&settings, "debug = false\n")?;

    let logs = app.join("logs");
    fs::create_dir_all(&logs)?;
    fs::write(logs.join("app.log"), "started\n".repeat(50))?;

    let storage = LocalStorage::new(dir.path().join("store"))?;
    let database = Arc::new(database);
    let context = BackupContext {
        storage: Arc::new(storage.clone()),
        database: Some(Arc::clone(&database) as Arc<dyn DatabaseBackup>),
        encryption: EncryptionManager::new(dir.path().join("keys/backup.key")),
        archiver: FileArchiveManager::default(),
        catalog: MetadataStore::new(dir.path().join("catalog/metadata.json")),
        notifier: None,
        environment: "test".to_string(),
        version: "1.0.0".to_string(),
        source_revision: "abc123".to_string(),
        paths: ContentPaths {
            uploads: vec![media],
            logs: vec![logs],
            config: vec![settings],
            restore_root: dir.path().join("restored"),
            work_dir: Some(dir.path().join("work")),
        },
    };

    Ok(Fixture {
        dir,
        storage,
        database,
        context,
    })
}
