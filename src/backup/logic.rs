// dbvault/src/backup/logic.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use super::archive::FileArchiveManager;
use super::db_dump::{DatabaseBackup, PgDumpManager, dump_file_name, dump_for_strategy};
use super::encryption::EncryptionManager;
use super::notify::Notifier;
use crate::catalog::{BackupMetadata, BackupStrategy, MetadataStore, artifact_name, remote_key};
use crate::config::{AppConfig, BackupConfig, ContentPaths};
use crate::errors::{BackupError, StorageError};
use crate::retention::RetentionManager;
use crate::storage::StorageBackend;
use crate::utils::sha256_file;

const UPLOAD_ATTEMPTS: u32 = 3;

pub const UPLOADS_ARCHIVE: &str = "uploads.tar.gz";
pub const CONFIG_ARCHIVE: &str = "config.tar.gz";
pub const LOGS_ARCHIVE: &str = "logs.tar.gz";

/// Everything a backup or restore run talks to, built once in `main`.
pub struct BackupContext {
    pub storage: Arc<dyn StorageBackend>,
    /// `None` when no database URL is configured; file-only restores still work.
    pub database: Option<Arc<dyn DatabaseBackup>>,
    pub encryption: EncryptionManager,
    pub archiver: FileArchiveManager,
    pub catalog: MetadataStore,
    pub notifier: Option<Notifier>,
    pub environment: String,
    pub version: String,
    pub source_revision: String,
    pub paths: ContentPaths,
}

impl BackupContext {
    pub fn new(
        app_config: &AppConfig,
        backup_config: &BackupConfig,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        let database = app_config.database_url.as_ref().map(|url| {
            Arc::new(PgDumpManager::new(url.clone(), app_config.pg_bin_dir.clone()))
                as Arc<dyn DatabaseBackup>
        });
        Self {
            storage,
            database,
            encryption: EncryptionManager::new(&app_config.encryption_key_file),
            archiver: FileArchiveManager::new(backup_config.compress),
            catalog: MetadataStore::new(&app_config.catalog_path),
            notifier: backup_config.notification_webhook.as_deref().map(Notifier::new),
            environment: app_config.environment.clone(),
            version: app_config.version.clone(),
            source_revision: app_config.resolve_source_revision(),
            paths: app_config.paths.clone(),
        }
    }

    /// Scratch directory for one run, removed when dropped.
    pub(crate) fn scratch_dir(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("dbvault-");
        match &self.paths.work_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
    }
}

/// Runs one backup: dump, archive, assemble, encrypt, upload, catalog.
pub struct BackupOrchestrator<'a> {
    context: &'a BackupContext,
    config: &'a BackupConfig,
    work_dir: TempDir,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(context: &'a BackupContext, config: &'a BackupConfig) -> Result<Self, BackupError> {
        let work_dir = context.scratch_dir()?;
        debug!("Backup working directory: {}", work_dir.path().display());
        Ok(Self {
            context,
            config,
            work_dir,
        })
    }

    /// Runs the pipeline and returns the persisted record.
    ///
    /// The first failing step is fatal: the record is saved as `failed` with
    /// the error message and the error is returned.
    pub async fn run(&self) -> Result<BackupMetadata, BackupError> {
        let started = Instant::now();
        let mut metadata = BackupMetadata::new(
            self.config.strategy,
            &self.context.environment,
            &self.context.version,
            &self.context.source_revision,
            self.context.storage.name(),
        );

        if self.config.dry_run {
            self.log_plan(&metadata);
            return Ok(metadata);
        }

        info!(
            "Starting {} backup {} to {}",
            metadata.strategy, metadata.backup_id, metadata.destination
        );
        metadata.mark_running()?;

        if let Err(e) = self.execute(&mut metadata).await {
            error!("Backup {} failed: {}", metadata.backup_id, e);
            metadata.duration_seconds = started.elapsed().as_secs_f64();
            metadata.mark_failed(&e.to_string())?;
            if let Err(save_err) = self.context.catalog.save(&metadata) {
                error!(
                    "Failed to record failed backup {} in catalog: {}",
                    metadata.backup_id, save_err
                );
            }
            return Err(e);
        }

        metadata.duration_seconds = started.elapsed().as_secs_f64();
        metadata.mark_completed()?;
        self.context.catalog.save(&metadata)?;
        info!(
            "✓ Backup {} completed in {:.2}s ({} bytes stored)",
            metadata.backup_id, metadata.duration_seconds, metadata.compressed_size_bytes
        );

        if let Some(notifier) = &self.context.notifier {
            notifier.notify(&metadata).await;
        }
        self.apply_retention().await;

        Ok(metadata)
    }

    async fn execute(&self, metadata: &mut BackupMetadata) -> Result<(), BackupError> {
        let strategy = metadata.strategy;
        if !strategy.dumps_database() {
            return Err(BackupError::UnsupportedStrategy(strategy.to_string()));
        }

        let staging = self.work_dir.path().join("artifacts");
        fs::create_dir_all(&staging)?;

        let database = self.context.database.as_ref().ok_or_else(|| {
            BackupError::Config("DATABASE_URL is not set; a database dump is required".to_string())
        })?;
        let dump_name = dump_file_name(strategy);
        let info = dump_for_strategy(database.as_ref(), strategy, &staging.join(&dump_name)).await?;
        metadata.database_info = Some(info);
        metadata.files.push(dump_name);

        if strategy == BackupStrategy::Full {
            for (name, sources) in self.file_components() {
                if sources.is_empty() {
                    warn!("No paths configured for {}, skipping", name);
                    continue;
                }
                let archiver = self.context.archiver;
                let sources = sources.to_vec();
                let excludes = self.config.exclude_patterns.clone();
                let output = staging.join(name);
                let info = run_blocking(move || {
                    archiver
                        .archive(&sources, &excludes, &output)
                        .map_err(|e| BackupError::Archive(format!("{:#}", e)))
                })
                .await?;
                debug!("{}: {} -> {} bytes", name, info.original_size, info.compressed_size);
                metadata.files.push(name.to_string());
            }
        }

        let final_path = self.assemble(metadata, &staging).await?;
        let final_name = file_name(&final_path)?;
        let key = remote_key(&metadata.timestamp, &final_name);

        self.upload_with_retry(&final_path, &key).await?;
        if self.config.verify {
            let stored = self.context.storage.size(&key).await?;
            if stored != metadata.compressed_size_bytes {
                return Err(BackupError::Storage(StorageError::Remote {
                    message: format!(
                        "Stored object {} has {} bytes, expected {}",
                        key, stored, metadata.compressed_size_bytes
                    ),
                    retryable: false,
                }));
            }
            info!("✓ Verified stored size of {}", key);
        }
        Ok(())
    }

    /// Archives selected by the include flags. Only full backups carry files.
    fn file_components(&self) -> Vec<(&'static str, &[PathBuf])> {
        let paths = &self.context.paths;
        let mut components = Vec::new();
        if self.config.include_uploads {
            components.push((UPLOADS_ARCHIVE, paths.uploads.as_slice()));
        }
        if self.config.include_config {
            components.push((CONFIG_ARCHIVE, paths.config.as_slice()));
        }
        if self.config.include_logs {
            components.push((LOGS_ARCHIVE, paths.logs.as_slice()));
        }
        components
    }

    /// Combines the staged artifacts into the single uploaded file and
    /// records sizes, checksum and key id on `metadata`.
    async fn assemble(&self, metadata: &mut BackupMetadata, staging: &Path) -> Result<PathBuf, BackupError> {
        let sources: Vec<PathBuf> = metadata.files.iter().map(|f| staging.join(f)).collect();
        let combined = self
            .work_dir
            .path()
            .join(artifact_name(&metadata.backup_id, false));

        // Loading the key here caches it in the clone handed to the worker.
        let key_id = if self.config.encrypt {
            Some(self.context.encryption.key_id()?)
        } else {
            None
        };
        let encryption = key_id.as_ref().map(|_| self.context.encryption.clone());
        let archiver = self.context.archiver;

        let (original_size, final_path, checksum) = run_blocking(move || {
            let info = archiver
                .archive(&sources, &[], &combined)
                .map_err(|e| BackupError::Archive(format!("{:#}", e)))?;
            match encryption {
                Some(encryption) => {
                    let (encrypted, checksum) = encryption.encrypt(&combined)?;
                    fs::remove_file(&combined)?;
                    Ok((info.original_size, encrypted, checksum))
                }
                None => {
                    let checksum = sha256_file(&combined)?;
                    Ok((info.original_size, combined, checksum))
                }
            }
        })
        .await?;

        metadata.size_bytes = original_size;
        metadata.checksum = checksum;
        metadata.encryption_key_id = key_id;
        metadata.compressed_size_bytes = fs::metadata(&final_path)?.len();
        metadata.files = vec![file_name(&final_path)?];
        info!(
            "✓ Assembled {} ({} -> {} bytes, sha256 {})",
            metadata.files[0], metadata.size_bytes, metadata.compressed_size_bytes, metadata.checksum
        );
        Ok(final_path)
    }

    async fn upload_with_retry(&self, local_path: &Path, key: &str) -> Result<(), StorageError> {
        let storage = &self.context.storage;
        let mut attempt = 1;
        loop {
            match storage.upload(local_path, key).await {
                Ok(()) => {
                    info!("✓ Uploaded {} to {} as {}", local_path.display(), storage.name(), key);
                    return Ok(());
                }
                Err(e) if e.retryable() && attempt < UPLOAD_ATTEMPTS => {
                    warn!(
                        "Upload attempt {}/{} for {} failed: {}",
                        attempt, UPLOAD_ATTEMPTS, key, e
                    );
                    tokio::time::sleep(Duration::from_secs(2 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn apply_retention(&self) {
        if self.config.retention_days.is_none() && self.config.max_backups.is_none() {
            return;
        }
        let records = match self.context.catalog.load_all() {
            Ok(records) => records,
            Err(e) => {
                error!("Retention skipped, catalog unreadable: {}", e);
                return;
            }
        };
        let manager = RetentionManager::new(
            Arc::clone(&self.context.storage),
            self.context.catalog.clone(),
            false,
        );
        if let Err(e) = manager
            .cleanup(records, self.config.retention_days, self.config.max_backups)
            .await
        {
            error!("Retention cleanup failed: {}", e);
        }
    }

    fn log_plan(&self, metadata: &BackupMetadata) {
        info!(
            "[dry-run] {} backup {} for '{}' to {}",
            metadata.strategy, metadata.backup_id, metadata.environment, metadata.destination
        );
        if !metadata.strategy.dumps_database() {
            warn!("[dry-run] Strategy '{}' is not supported and would fail", metadata.strategy);
            return;
        }
        info!("[dry-run] Would dump database to {}", dump_file_name(metadata.strategy));
        if metadata.strategy == BackupStrategy::Full {
            for (name, sources) in self.file_components() {
                info!("[dry-run] Would archive {:?} into {}", sources, name);
            }
        }
        let artifact = artifact_name(&metadata.backup_id, self.config.encrypt);
        info!(
            "[dry-run] Would upload {} as {}",
            artifact,
            remote_key(&metadata.timestamp, &artifact)
        );
        if self.config.retention_days.is_some() || self.config.max_backups.is_some() {
            info!(
                "[dry-run] Would apply retention (days: {:?}, max backups: {:?})",
                self.config.retention_days, self.config.max_backups
            );
        }
    }
}

/// Runs tar, gzip and cipher work on the blocking pool so the runtime stays
/// responsive to Ctrl-C.
async fn run_blocking<T, F>(task: F) -> Result<T, BackupError>
where
    F: FnOnce() -> Result<T, BackupError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| BackupError::Archive(format!("Archive worker failed: {}", e)))?
}

fn file_name(path: &Path) -> Result<String, BackupError> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| BackupError::Archive(format!("No file name in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::testing::{FakeDatabase, fixture};
    use crate::catalog::{BackupStatus, date_prefix};
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tempfile::TempDir;

    fn full_config() -> BackupConfig {
        BackupConfig {
            strategy: BackupStrategy::Full,
            include_uploads: true,
            include_config: true,
            include_logs: true,
            ..BackupConfig::default()
        }
    }

    /// Names inside the assembled tarball.
    fn artifact_entries(context: &BackupContext, artifact: &Path) -> anyhow::Result<BTreeSet<String>> {
        let out = TempDir::new()?;
        context.archiver.extract(artifact, out.path())?;
        Ok(fs::read_dir(out.path())?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().to_string()))
            .collect::<Result<_, _>>()?)
    }

    #[tokio::test]
    async fn test_full_local_encrypted_backup() -> anyhow::Result<()> {
        let fx = fixture(FakeDatabase::healthy())?;
        let config = BackupConfig {
            encrypt: true,
            verify: true,
            ..full_config()
        };

        let metadata = BackupOrchestrator::new(&fx.context, &config)?.run().await?;
        assert_eq!(metadata.status, BackupStatus::Completed);
        assert_eq!(metadata.destination, "local");
        assert_eq!(metadata.encryption_key_id, Some(fx.context.encryption.key_id()?));
        assert_eq!(metadata.files, vec![format!("backup_{}.tar.gz.enc", metadata.backup_id)]);
        assert!(metadata.database_info.is_some());

        let saved = fx.context.catalog.find(&metadata.backup_id)?.unwrap();
        assert_eq!(saved.status, BackupStatus::Completed);
        assert_eq!(saved.checksum, metadata.checksum);
        assert_eq!(saved.files, metadata.files);
        assert_eq!(saved.timestamp, metadata.timestamp);

        assert_eq!(fx.context.catalog.load_all()?.len(), 1);

        let key = metadata.remote_key().unwrap();
        assert_eq!(fx.storage.list(&date_prefix(&metadata.timestamp)).await?, vec![key.clone()]);
        let stored = fx.storage.root().join(&key);
        assert_eq!(sha256_file(&stored)?, metadata.checksum);
        assert_eq!(fs::metadata(&stored)?.len(), metadata.compressed_size_bytes);

        let scratch = fx.dir.path().join("check.tar.gz.enc");
        fs::copy(&stored, &scratch)?;
        let plain = fx.context.encryption.decrypt(&scratch)?;
        let names = artifact_entries(&fx.context, &plain)?;
        let expected: BTreeSet<String> = [
            "database_full.dump",
            UPLOADS_ARCHIVE,
            CONFIG_ARCHIVE,
            LOGS_ARCHIVE,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(names, expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_checksum_matches_uploaded_bytes() -> anyhow::Result<()> {
        let fx = fixture(FakeDatabase::healthy())?;
        let config = BackupConfig::default();

        let metadata = BackupOrchestrator::new(&fx.context, &config)?.run().await?;
        assert_eq!(metadata.encryption_key_id, None);
        let key = metadata.remote_key().unwrap();
        assert!(key.ends_with(&format!("backup_{}.tar.gz", metadata.backup_id)));

        let downloaded = fx.dir.path().join("downloaded.tar.gz");
        fx.storage.download(&key, &downloaded).await?;
        assert_eq!(sha256_file(&downloaded)?, metadata.checksum);
        Ok(())
    }

    #[tokio::test]
    async fn test_schema_strategy_skips_file_archives() -> anyhow::Result<()> {
        let fx = fixture(FakeDatabase::healthy())?;
        let config = BackupConfig {
            strategy: BackupStrategy::Schema,
            ..full_config()
        };

        let metadata = BackupOrchestrator::new(&fx.context, &config)?.run().await?;
        assert_eq!(metadata.database_info.as_ref().unwrap().dump_type, "schema");

        let stored = fx.storage.root().join(metadata.remote_key().unwrap());
        let names = artifact_entries(&fx.context, &stored)?;
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["database_schema.dump"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_dump_is_recorded() -> anyhow::Result<()> {
        let fx = fixture(FakeDatabase::failing_dump())?;
        let config = full_config();

        let result = BackupOrchestrator::new(&fx.context, &config)?.run().await;
        assert!(matches!(result, Err(BackupError::Command { .. })));

        let records = fx.context.catalog.load_all()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BackupStatus::Failed);
        assert!(records[0].error_message.as_deref().unwrap().contains("pg_dump"));
        assert!(fx.storage.list("").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_incremental_is_recorded_as_failed() -> anyhow::Result<()> {
        let fx = fixture(FakeDatabase::healthy())?;
        let config = BackupConfig {
            strategy: BackupStrategy::Incremental,
            ..BackupConfig::default()
        };

        let result = BackupOrchestrator::new(&fx.context, &config)?.run().await;
        assert!(matches!(result, Err(BackupError::UnsupportedStrategy(_))));
        let records = fx.context.catalog.load_all()?;
        assert_eq!(records[0].status, BackupStatus::Failed);
        assert_eq!(records[0].strategy, BackupStrategy::Incremental);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_upload_paths_fail_the_run() -> anyhow::Result<()> {
        let mut fx = fixture(FakeDatabase::healthy())?;
        fx.context.paths.uploads = vec![fx.dir.path().join("gone")];
        let config = full_config();

        let result = BackupOrchestrator::new(&fx.context, &config)?.run().await;
        assert!(matches!(result, Err(BackupError::Archive(_))));
        assert_eq!(fx.context.catalog.load_all()?[0].status, BackupStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() -> anyhow::Result<()> {
        let fx = fixture(FakeDatabase::healthy())?;
        let config = BackupConfig {
            dry_run: true,
            ..full_config()
        };

        let metadata = BackupOrchestrator::new(&fx.context, &config)?.run().await?;
        assert_eq!(metadata.status, BackupStatus::Pending);
        assert!(fx.context.catalog.load_all()?.is_empty());
        assert!(fx.storage.list("").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_retention_runs_after_success() -> anyhow::Result<()> {
        let fx = fixture(FakeDatabase::healthy())?;
        let config = BackupConfig::default();
        for _ in 0..3 {
            BackupOrchestrator::new(&fx.context, &config)?.run().await?;
        }

        let limited = BackupConfig {
            max_backups: Some(2),
            ..BackupConfig::default()
        };
        let newest = BackupOrchestrator::new(&fx.context, &limited)?.run().await?;

        let records = fx.context.catalog.load_all()?;
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.backup_id == newest.backup_id));
        assert_eq!(fx.storage.list("").await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_work_dir_is_removed() -> anyhow::Result<()> {
        let fx = fixture(FakeDatabase::healthy())?;
        let config = BackupConfig::default();
        let work_root = fx.context.paths.work_dir.clone().unwrap();
        {
            let orchestrator = BackupOrchestrator::new(&fx.context, &config)?;
            orchestrator.run().await?;
            assert_eq!(fs::read_dir(&work_root)?.count(), 1);
        }
        assert_eq!(fs::read_dir(&work_root)?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_archive_work_leaves_the_runtime_thread() -> anyhow::Result<()> {
        let caller = std::thread::current().id();
        let worker = run_blocking(|| Ok(std::thread::current().id())).await?;
        assert_ne!(caller, worker);

        let panicked = run_blocking(|| -> Result<(), BackupError> { panic!("tar writer blew up") }).await;
        assert!(matches!(panicked, Err(BackupError::Archive(m)) if m.contains("Archive worker failed")));
        Ok(())
    }

    #[tokio::test]
    async fn test_work_dir_is_removed_on_failure() -> anyhow::Result<()> {
        let fx = fixture(FakeDatabase::failing_dump())?;
        let config = full_config();
        let work_root = fx.context.paths.work_dir.clone().unwrap();
        {
            let orchestrator = BackupOrchestrator::new(&fx.context, &config)?;
            assert!(orchestrator.run().await.is_err());
            assert_eq!(fs::read_dir(&work_root)?.count(), 1);
        }
        assert_eq!(fs::read_dir(&work_root)?.count(), 0);
        Ok(())
    }

    /// Accepts one webhook request, answers 200 and returns the raw request.
    async fn capture_one_request(listener: TcpListener) -> anyhow::Result<String> {
        let (mut socket, _) = listener.accept().await?;
        let mut request = Vec::new();
        let mut buffer = [0u8; 4096];
        while !String::from_utf8_lossy(&request).contains("\"status\":\"completed\"") {
            let read = socket.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            request.extend_from_slice(&buffer[..read]);
        }
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .await?;
        Ok(String::from_utf8_lossy(&request).to_string())
    }

    #[tokio::test]
    async fn test_webhook_is_only_sent_for_successful_runs() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}/hooks/backup", listener.local_addr()?);

        let mut failing = fixture(FakeDatabase::failing_dump())?;
        failing.context.notifier = Some(Notifier::new(url.clone()));
        assert!(
            BackupOrchestrator::new(&failing.context, &full_config())?
                .run()
                .await
                .is_err()
        );
        let nothing = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(nothing.is_err(), "failed run must not notify");

        let mut healthy = fixture(FakeDatabase::healthy())?;
        healthy.context.notifier = Some(Notifier::new(url));
        let server = tokio::spawn(capture_one_request(listener));
        let config = BackupConfig::default();
        let metadata = BackupOrchestrator::new(&healthy.context, &config)?.run().await?;

        let request = server.await??;
        assert!(request.starts_with("POST /hooks/backup"));
        assert!(request.contains(&metadata.backup_id));
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_webhook_keeps_run_completed() -> anyhow::Result<()> {
        let mut fx = fixture(FakeDatabase::healthy())?;
        fx.context.notifier = Some(Notifier::new("http://127.0.0.1:9/hook"));
        let config = BackupConfig::default();

        let metadata = BackupOrchestrator::new(&fx.context, &config)?.run().await?;
        assert_eq!(metadata.status, BackupStatus::Completed);
        let saved = fx.context.catalog.find(&metadata.backup_id)?.unwrap();
        assert_eq!(saved.status, BackupStatus::Completed);
        Ok(())
    }
}
