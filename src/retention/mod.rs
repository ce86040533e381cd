// dbvault/src/retention/mod.rs
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::catalog::{BackupMetadata, MetadataStore};
use crate::errors::{CatalogError, StorageError};
use crate::storage::StorageBackend;

/// Picks the records to remove: everything older than `older_than_days`,
/// plus everything past the newest `max_backups`. Deduplicated by id,
/// newest first.
pub fn select_for_removal(
    records: &[BackupMetadata],
    now: DateTime<Utc>,
    older_than_days: Option<u32>,
    max_backups: Option<usize>,
) -> Vec<BackupMetadata> {
    let mut sorted: Vec<&BackupMetadata> = records.iter().collect();
    sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut selected: HashSet<String> = HashSet::new();

    if let Some(days) = older_than_days {
        let cutoff = now - Duration::days(i64::from(days));
        for record in sorted.iter().filter(|r| r.timestamp < cutoff) {
            selected.insert(record.backup_id.clone());
        }
    }

    if let Some(max) = max_backups {
        for record in sorted.iter().skip(max) {
            selected.insert(record.backup_id.clone());
        }
    }

    sorted
        .into_iter()
        .filter(|r| selected.contains(&r.backup_id))
        .cloned()
        .collect()
}

/// Applies the age/count policy to the catalog and the active backend.
pub struct RetentionManager {
    storage: Arc<dyn StorageBackend>,
    catalog: MetadataStore,
    dry_run: bool,
}

impl RetentionManager {
    pub fn new(storage: Arc<dyn StorageBackend>, catalog: MetadataStore, dry_run: bool) -> Self {
        Self {
            storage,
            catalog,
            dry_run,
        }
    }

    /// Removes the selected backups and returns them.
    ///
    /// Only records stored on the active backend are considered. Each removal
    /// deletes the remote object first and is best-effort: a failed delete is
    /// logged and the record still leaves the catalog. The catalog is rewritten
    /// once at the end.
    pub async fn cleanup(
        &self,
        all_records: Vec<BackupMetadata>,
        older_than_days: Option<u32>,
        max_backups: Option<usize>,
    ) -> Result<Vec<BackupMetadata>, CatalogError> {
        if older_than_days.is_none() && max_backups.is_none() {
            info!("No retention limits given, nothing to clean up");
            return Ok(Vec::new());
        }

        let backend = self.storage.name();
        let (managed, foreign): (Vec<_>, Vec<_>) = all_records
            .into_iter()
            .partition(|r| r.destination == backend);
        if !foreign.is_empty() {
            info!(
                "Leaving {} record(s) stored outside the '{}' backend untouched",
                foreign.len(),
                backend
            );
        }

        let to_remove = select_for_removal(&managed, Utc::now(), older_than_days, max_backups);
        if to_remove.is_empty() {
            info!("✓ Retention policy satisfied, nothing to remove");
            return Ok(Vec::new());
        }

        if self.dry_run {
            for record in &to_remove {
                info!(
                    "[dry-run] Would remove backup {} from {}",
                    record.backup_id, record.timestamp
                );
            }
            return Ok(to_remove);
        }

        for record in &to_remove {
            self.remove_remote(record).await;
        }

        let removed_ids: HashSet<&str> = to_remove.iter().map(|r| r.backup_id.as_str()).collect();
        let remaining: Vec<BackupMetadata> = managed
            .into_iter()
            .chain(foreign)
            .filter(|r| !removed_ids.contains(r.backup_id.as_str()))
            .collect();
        self.catalog.replace_all(&remaining)?;

        info!(
            "✓ Removed {} backup(s); {} remain in the catalog",
            to_remove.len(),
            remaining.len()
        );
        Ok(to_remove)
    }

    async fn remove_remote(&self, record: &BackupMetadata) {
        let Some(key) = record.remote_key() else {
            info!(
                "Backup {} ({}) has no uploaded artifact, dropping catalog entry only",
                record.backup_id, record.status
            );
            return;
        };
        match self.storage.delete(&key).await {
            Ok(()) => info!("✓ Deleted {} for backup {}", key, record.backup_id),
            Err(StorageError::NotFound(_)) => {
                warn!("Object {} for backup {} was already gone", key, record.backup_id)
            }
            Err(e) => error!(
                "Failed to delete {} for backup {}: {}",
                key, record.backup_id, e
            ),
        }
    }
}
