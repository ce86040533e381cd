// dbvault/src/storage/local.rs
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{StorageBackend, ensure_parent};
use crate::errors::{StorageError, StorageResult};

/// Backend rooted at a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StorageError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a key onto the root, refusing anything that escapes it.
    fn resolve(&self, remote_key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(remote_key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if remote_key.is_empty() || escapes {
            return Err(StorageError::Config(format!(
                "Invalid storage key: {}",
                remote_key
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> StorageResult<()> {
        let target = self.resolve(remote_key)?;
        ensure_parent(&target).await?;
        let bytes = tokio::fs::copy(local_path, &target)
            .await
            .map_err(|e| StorageError::io(local_path, e))?;
        info!(
            "✓ Stored {} bytes at {}",
            bytes,
            target.display()
        );
        Ok(())
    }

    async fn download(&self, remote_key: &str, local_path: &Path) -> StorageResult<()> {
        let source = self.resolve(remote_key)?;
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(StorageError::NotFound(remote_key.to_string()));
        }
        ensure_parent(local_path).await?;
        tokio::fs::copy(&source, local_path)
            .await
            .map_err(|e| StorageError::io(&source, e))?;
        debug!("Copied {} to {}", source.display(), local_path.display());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| StorageError::Io {
                path: self.root.clone(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, remote_key: &str) -> StorageResult<()> {
        let target = self.resolve(remote_key)?;
        tokio::fs::remove_file(&target)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StorageError::NotFound(remote_key.to_string()),
                _ => StorageError::io(&target, e),
            })?;
        debug!("Deleted {}", target.display());
        Ok(())
    }

    async fn size(&self, remote_key: &str) -> StorageResult<u64> {
        let target = self.resolve(remote_key)?;
        match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(StorageError::NotFound(remote_key.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(remote_key.to_string()))
            }
            Err(e) => Err(StorageError::io(&target, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_list_size_download_delete() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let storage = LocalStorage::new(dir.path().join("store"))?;
        let source = dir.path().join("artifact.tar.gz");
        std::fs::write(&source, b"archive-bytes")?;

        storage.upload(&source, "2024/05/01/backup_a.tar.gz").await?;
        storage.upload(&source, "2024/05/02/backup_b.tar.gz").await?;

        assert_eq!(
            storage.list("2024/05/01").await?,
            vec!["2024/05/01/backup_a.tar.gz".to_string()]
        );
        assert_eq!(storage.list("").await?.len(), 2);
        assert_eq!(storage.size("2024/05/02/backup_b.tar.gz").await?, 13);

        let restored = dir.path().join("out/restored.tar.gz");
        storage.download("2024/05/01/backup_a.tar.gz", &restored).await?;
        assert_eq!(std::fs::read(&restored)?, b"archive-bytes");

        storage.delete("2024/05/01/backup_a.tar.gz").await?;
        assert_eq!(storage.list("2024/05/01").await?, Vec::<String>::new());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_keys_return_not_found() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let storage = LocalStorage::new(dir.path())?;
        let target = dir.path().join("never.bin");

        let download = storage.download("2024/01/01/missing", &target).await;
        assert!(matches!(download, Err(StorageError::NotFound(_))));
        assert!(!target.exists());

        assert!(matches!(
            storage.delete("2024/01/01/missing").await,
            Err(StorageError::NotFound(_))
        ));
        let size = storage.size("2024/01/01/missing").await;
        assert!(matches!(size, Err(StorageError::NotFound(_))));
        assert!(!size.unwrap_err().retryable());
        Ok(())
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_root() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let storage = LocalStorage::new(dir.path().join("store"))?;
        assert!(matches!(
            storage.size("../outside").await,
            Err(StorageError::Config(_))
        ));
        assert!(matches!(
            storage.delete("/etc/passwd").await,
            Err(StorageError::Config(_))
        ));
        Ok(())
    }
}
