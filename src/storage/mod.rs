// dbvault/src/storage/mod.rs
pub(crate) mod gcs;
pub(crate) mod local;
pub(crate) mod s3;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::config::{AppConfig, Destination};
use crate::errors::{StorageError, StorageResult};

pub use gcs::GcsStorage;
pub use local::LocalStorage;
pub use s3::S3Storage;

/// Uniform blob operations over a `YYYY/MM/DD/<artifact>` key namespace.
///
/// Implementations never panic on missing keys: `download`, `delete` and
/// `size` return [`StorageError::NotFound`] instead.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend name recorded as a backup's destination.
    fn name(&self) -> &'static str;

    async fn upload(&self, local_path: &Path, remote_key: &str) -> StorageResult<()>;

    async fn download(&self, remote_key: &str, local_path: &Path) -> StorageResult<()>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    async fn delete(&self, remote_key: &str) -> StorageResult<()>;

    async fn size(&self, remote_key: &str) -> StorageResult<u64>;
}

/// Builds the backend selected by `destination` from the loaded configuration.
pub async fn build_storage(
    app_config: &AppConfig,
    destination: Destination,
) -> StorageResult<Arc<dyn StorageBackend>> {
    match destination {
        Destination::Local => {
            let root = app_config.local_storage_root();
            Ok(Arc::new(LocalStorage::new(root)?))
        }
        Destination::S3 => {
            let s3_config = app_config.s3_config.as_ref().ok_or_else(|| {
                StorageError::Config(
                    "s3_storage is not fully configured (bucket_name, region, access_key_id, secret_access_key, endpoint_url)".to_string(),
                )
            })?;
            Ok(Arc::new(S3Storage::new(s3_config).await))
        }
        Destination::Gcs => {
            let gcs_config = app_config.gcs_config.as_ref().ok_or_else(|| {
                StorageError::Config("gcs_storage.bucket_name must be set for gcs destination".to_string())
            })?;
            Ok(Arc::new(GcsStorage::new(gcs_config)?))
        }
    }
}

/// Creates the parent directory of a download target.
pub(crate) async fn ensure_parent(local_path: &Path) -> StorageResult<()> {
    if let Some(parent) = local_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
    }
    Ok(())
}
