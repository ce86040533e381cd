// dbvault/src/catalog/store.rs
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::debug;

use super::BackupMetadata;
use crate::errors::CatalogError;

/// JSON catalog of every backup run, stored as one array document.
///
/// Not safe for concurrent writers in separate processes: two overlapping
/// runs can each read the document, modify it and overwrite the other's
/// change.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Loads all records. A missing document is an empty catalog.
    pub fn load_all(&self) -> Result<Vec<BackupMetadata>, CatalogError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CatalogError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    pub fn find(&self, backup_id: &str) -> Result<Option<BackupMetadata>, CatalogError> {
        Ok(self
            .load_all()?
            .into_iter()
            .find(|record| record.backup_id == backup_id))
    }

    /// Inserts the record, replacing any existing one with the same id.
    pub fn save(&self, record: &BackupMetadata) -> Result<(), CatalogError> {
        let mut records = self.load_all()?;
        match records
            .iter_mut()
            .find(|existing| existing.backup_id == record.backup_id)
        {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        self.replace_all(&records)
    }

    /// Rewrites the whole document.
    pub fn replace_all(&self, records: &[BackupMetadata]) -> Result<(), CatalogError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| CatalogError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let json = serde_json::to_string_pretty(records)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|source| CatalogError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|source| CatalogError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!(
            "Catalog {} now holds {} record(s)",
            self.path.display(),
            records.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackupStrategy, DatabaseInfo};
    use tempfile::TempDir;

    fn record() -> BackupMetadata {
        BackupMetadata::new(BackupStrategy::Full, "test", "1.0.0", "abc123", "local")
    }

    #[test]
    fn test_missing_catalog_is_empty() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = MetadataStore::new(dir.path().join("metadata.json"));
        assert!(store.load_all()?.is_empty());
        assert!(store.find("nope")?.is_none());
        Ok(())
    }

    #[test]
    fn test_save_upserts_by_id() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = MetadataStore::new(dir.path().join("metadata.json"));

        let mut first = record();
        let second = record();
        store.save(&first)?;
        store.save(&second)?;

        first.mark_running()?;
        first.mark_failed("disk full")?;
        store.save(&first)?;

        let all = store.load_all()?;
        assert_eq!(all.len(), 2);
        let found = store.find(&first.backup_id)?.unwrap();
        assert_eq!(found.error_message.as_deref(), Some("disk full"));
        Ok(())
    }

    #[test]
    fn test_record_round_trips_exactly() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = MetadataStore::new(dir.path().join("nested/metadata.json"));

        let mut meta = record();
        meta.encryption_key_id = Some("0123456789abcdef".to_string());
        meta.database_info = Some(DatabaseInfo {
            dump_type: "full".to_string(),
            duration_seconds: 1.25,
            dump_size_bytes: 2048,
            table_count: Some(12),
            database_size_bytes: Some(8_000_000),
        });
        meta.files = vec!["database_full.dump".to_string()];
        store.save(&meta)?;

        let loaded = store.find(&meta.backup_id)?.unwrap();
        assert_eq!(loaded, meta);
        assert_eq!(
            loaded.timestamp.timestamp_nanos_opt(),
            meta.timestamp.timestamp_nanos_opt()
        );
        Ok(())
    }

    #[test]
    fn test_malformed_catalog_is_an_error() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("metadata.json");
        fs::write(&path, "{ not json")?;
        let store = MetadataStore::new(path);
        assert!(matches!(store.load_all(), Err(CatalogError::Json(_))));
        Ok(())
    }
}
