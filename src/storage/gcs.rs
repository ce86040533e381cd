// dbvault/src/storage/gcs.rs
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::{ObjectStore, gcp::GoogleCloudStorageBuilder, path::Path as ObjectPath};
use std::path::Path;
use tracing::{debug, info};

use super::{StorageBackend, ensure_parent};
use crate::config::GcsConfig;
use crate::errors::{StorageError, StorageResult};

/// Google Cloud Storage bucket. Credentials come from the standard
/// `GOOGLE_*` environment variables.
pub struct GcsStorage {
    store: Box<dyn ObjectStore>,
    bucket: String,
}

impl GcsStorage {
    pub fn new(gcs_config: &GcsConfig) -> StorageResult<Self> {
        let mut builder =
            GoogleCloudStorageBuilder::from_env().with_bucket_name(gcs_config.bucket_name.clone());
        if let Some(path) = &gcs_config.service_account_path {
            builder = builder.with_service_account_path(path.to_string_lossy());
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::Config(format!("GCS client: {}", e)))?;
        Ok(Self {
            store: Box::new(store),
            bucket: gcs_config.bucket_name.clone(),
        })
    }

    fn classify(&self, err: object_store::Error, remote_key: &str) -> StorageError {
        match err {
            object_store::Error::NotFound { .. } => StorageError::NotFound(remote_key.to_string()),
            e @ (object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. }
            | object_store::Error::InvalidPath { .. }) => StorageError::Remote {
                message: format!("gs://{}/{}: {}", self.bucket, remote_key, e),
                retryable: false,
            },
            e => StorageError::Remote {
                message: format!("gs://{}/{}: {}", self.bucket, remote_key, e),
                retryable: true,
            },
        }
    }
}

#[async_trait]
impl StorageBackend for GcsStorage {
    fn name(&self) -> &'static str {
        "gcs"
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> StorageResult<()> {
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| StorageError::io(local_path, e))?;
        let put_result = self
            .store
            .put(&ObjectPath::from(remote_key), data.into())
            .await
            .map_err(|e| self.classify(e, remote_key))?;
        info!(
            "✓ Uploaded {} to gs://{}/{} ({:?})",
            local_path.display(),
            self.bucket,
            remote_key,
            put_result.e_tag
        );
        Ok(())
    }

    async fn download(&self, remote_key: &str, local_path: &Path) -> StorageResult<()> {
        let result = self
            .store
            .get(&ObjectPath::from(remote_key))
            .await
            .map_err(|e| self.classify(e, remote_key))?;
        let bytes = result
            .bytes()
            .await
            .map_err(|e| self.classify(e, remote_key))?;
        ensure_parent(local_path).await?;
        tokio::fs::write(local_path, &bytes)
            .await
            .map_err(|e| StorageError::io(local_path, e))?;
        debug!(
            "Downloaded {} bytes from gs://{}/{}",
            bytes.len(),
            self.bucket,
            remote_key
        );
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        // object_store prefixes match whole path segments; filter the rest here.
        let segment_prefix = match prefix.rfind('/') {
            Some(idx) => Some(ObjectPath::from(&prefix[..idx])),
            None => None,
        };
        let objects: Vec<_> = self
            .store
            .list(segment_prefix.as_ref())
            .try_collect()
            .await
            .map_err(|e| self.classify(e, prefix))?;

        let mut keys: Vec<String> = objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, remote_key: &str) -> StorageResult<()> {
        let location = ObjectPath::from(remote_key);
        self.store
            .head(&location)
            .await
            .map_err(|e| self.classify(e, remote_key))?;
        self.store
            .delete(&location)
            .await
            .map_err(|e| self.classify(e, remote_key))?;
        debug!("Deleted gs://{}/{}", self.bucket, remote_key);
        Ok(())
    }

    async fn size(&self, remote_key: &str) -> StorageResult<u64> {
        let meta = self
            .store
            .head(&ObjectPath::from(remote_key))
            .await
            .map_err(|e| self.classify(e, remote_key))?;
        Ok(meta.size as u64)
    }
}
