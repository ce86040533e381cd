// dbvault/src/restore/logic.rs
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use super::verification::verify_checksum;
use crate::backup::db_dump::dump_kind;
use crate::backup::{BackupContext, CONFIG_ARCHIVE, LOGS_ARCHIVE, UPLOADS_ARCHIVE};
use crate::catalog::{BackupMetadata, BackupStatus};
use crate::config::BackupConfig;
use crate::errors::RestoreError;

/// What a restore run put back, and what it could not.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RestoreReport {
    pub backup_id: String,
    pub restored: Vec<String>,
    /// Component name and the reason it failed.
    pub failed: Vec<(String, String)>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct RestoreOrchestrator<'a> {
    context: &'a BackupContext,
    config: &'a BackupConfig,
    work_dir: TempDir,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(context: &'a BackupContext, config: &'a BackupConfig) -> Result<Self, RestoreError> {
        let work_dir = context.scratch_dir()?;
        debug!("Restore working directory: {}", work_dir.path().display());
        Ok(Self {
            context,
            config,
            work_dir,
        })
    }

    /// Downloads, verifies, decrypts and unpacks a backup, then restores each
    /// component it contains.
    ///
    /// Everything up to extraction is fatal. Individual component failures are
    /// logged and collected in the report.
    pub async fn restore(&self, backup_id: &str) -> Result<RestoreReport, RestoreError> {
        let record = self.restorable_record(backup_id)?;
        let mut report = RestoreReport {
            backup_id: record.backup_id.clone(),
            ..RestoreReport::default()
        };

        if self.config.dry_run {
            info!(
                "[dry-run] Would restore backup {} ({}, {}) from {} into {}",
                record.backup_id,
                record.strategy,
                record.timestamp,
                record.destination,
                self.context.paths.restore_root.display()
            );
            return Ok(report);
        }

        info!("Restoring backup {} from {}", record.backup_id, record.destination);
        let downloaded = self.download(&record).await?;

        if self.config.verify {
            verify_checksum(&downloaded, &record.checksum)?;
            info!("✓ Checksum verified for backup {}", record.backup_id);
        }

        let archive = match &record.encryption_key_id {
            Some(key_id) => self
                .context
                .encryption
                .decrypt_for(&downloaded, key_id)
                .map_err(RestoreError::Decrypt)?,
            None => downloaded,
        };

        let extracted = self.work_dir.path().join("extracted");
        self.context
            .archiver
            .extract(&archive, &extracted)
            .map_err(|e| RestoreError::Extract(format!("{:#}", e)))?;

        for artifact in artifacts_in(&extracted)? {
            let name = artifact
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            match self.restore_component(&name, &artifact).await {
                Ok(true) => report.restored.push(name),
                Ok(false) => warn!("Skipping unknown artifact {} in backup {}", name, record.backup_id),
                Err(e) => {
                    warn!("Failed to restore {}: {}", name, e);
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        if report.is_complete() {
            info!(
                "✓ Backup {} restored ({})",
                record.backup_id,
                report.restored.join(", ")
            );
        } else {
            error!(
                "Backup {} partially restored: {} component(s) failed",
                record.backup_id,
                report.failed.len()
            );
        }
        Ok(report)
    }

    /// Looks up a record that can be downloaded and unpacked.
    pub(super) fn restorable_record(&self, backup_id: &str) -> Result<BackupMetadata, RestoreError> {
        let record = self
            .context
            .catalog
            .find(backup_id)?
            .ok_or_else(|| RestoreError::NotFound(backup_id.to_string()))?;
        if record.status != BackupStatus::Completed || record.remote_key().is_none() {
            return Err(RestoreError::NotRestorable {
                backup_id: record.backup_id,
                status: record.status.to_string(),
            });
        }
        Ok(record)
    }

    pub(super) async fn download(&self, record: &BackupMetadata) -> Result<PathBuf, RestoreError> {
        let (Some(key), Some(artifact)) = (record.remote_key(), record.final_artifact()) else {
            return Err(RestoreError::NotRestorable {
                backup_id: record.backup_id.clone(),
                status: record.status.to_string(),
            });
        };
        let local = self.work_dir.path().join("download").join(artifact);
        self.context
            .storage
            .download(&key, &local)
            .await
            .map_err(RestoreError::Download)?;
        Ok(local)
    }

    /// Returns `Ok(false)` for artifacts this tool does not know how to restore.
    async fn restore_component(&self, name: &str, artifact: &Path) -> Result<bool, RestoreError> {
        if let Some(kind) = dump_kind(name) {
            let database = self.context.database.as_ref().ok_or_else(|| {
                RestoreError::Component("DATABASE_URL is not set, cannot restore the database".to_string())
            })?;
            database
                .restore(artifact, kind, self.config.restore_target.as_deref())
                .await?;
            return Ok(true);
        }

        if [UPLOADS_ARCHIVE, CONFIG_ARCHIVE, LOGS_ARCHIVE].contains(&name) {
            let restore_root = &self.context.paths.restore_root;
            self.context
                .archiver
                .extract(artifact, restore_root)
                .map_err(|e| RestoreError::Component(format!("{:#}", e)))?;
            info!("✓ Restored {} into {}", name, restore_root.display());
            return Ok(true);
        }

        Ok(false)
    }
}

/// Top-level files of an unpacked backup, in name order.
fn artifacts_in(dir: &Path) -> Result<Vec<PathBuf>, RestoreError> {
    let mut artifacts = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            artifacts.push(entry.path());
        }
    }
    artifacts.sort();
    Ok(artifacts)
}
