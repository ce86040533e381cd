// dbvault/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use s3::primitives::ByteStream;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{StorageBackend, ensure_parent};
use crate::config::S3Config;
use crate::errors::{StorageError, StorageResult};

/// S3-compatible object storage (AWS, DigitalOcean Spaces, MinIO).
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
    folder_prefix: Option<String>,
}

impl S3Storage {
    pub async fn new(s3_config: &S3Config) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&s3_config.endpoint_url)
            .region(Region::new(s3_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &s3_config.access_key_id,
                &s3_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static",
            ))
            .load()
            .await;

        Self {
            client: s3::Client::new(&sdk_config),
            bucket: s3_config.bucket_name.clone(),
            folder_prefix: s3_config
                .folder_prefix
                .as_ref()
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        }
    }

    fn object_key(&self, remote_key: &str) -> String {
        match &self.folder_prefix {
            Some(prefix) => format!("{}/{}", prefix, remote_key),
            None => remote_key.to_string(),
        }
    }

    fn strip_folder<'a>(&self, object_key: &'a str) -> &'a str {
        match &self.folder_prefix {
            Some(prefix) => object_key
                .strip_prefix(prefix.as_str())
                .map(|rest| rest.trim_start_matches('/'))
                .unwrap_or(object_key),
            None => object_key,
        }
    }

    async fn exists(&self, remote_key: &str) -> StorageResult<bool> {
        match self.head(remote_key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn head(&self, remote_key: &str) -> StorageResult<Option<i64>> {
        let key = self.object_key(remote_key);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(output) => Ok(output.content_length()),
            Err(SdkError::ServiceError(service)) if service.err().is_not_found() => {
                Err(StorageError::NotFound(remote_key.to_string()))
            }
            Err(e) => Err(classify(e, format!("HEAD s3://{}/{}", self.bucket, key))),
        }
    }
}

/// Maps an SDK failure onto a storage error, flagging transient ones.
fn classify<E, R>(err: SdkError<E, R>, context: String) -> StorageError
where
    E: std::error::Error + ProvideErrorMetadata + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let retryable = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(service) => matches!(
            service.err().code(),
            Some("SlowDown" | "InternalError" | "ServiceUnavailable" | "RequestTimeout")
        ),
        _ => false,
    };
    StorageError::Remote {
        message: format!("{}: {}", context, DisplayErrorContext(&err)),
        retryable,
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> StorageResult<()> {
        let key = self.object_key(remote_key);
        info!(
            "Uploading {} to s3://{}/{}",
            local_path.display(),
            self.bucket,
            key
        );

        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| StorageError::Io {
                path: local_path.to_path_buf(),
                source: std::io::Error::other(e),
            })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| classify(e, format!("PUT s3://{}/{}", self.bucket, key)))?;

        info!("✓ Uploaded to s3://{}/{}", self.bucket, key);
        Ok(())
    }

    async fn download(&self, remote_key: &str, local_path: &Path) -> StorageResult<()> {
        let key = self.object_key(remote_key);
        let mut object = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(object) => object,
            Err(SdkError::ServiceError(service)) if service.err().is_no_such_key() => {
                return Err(StorageError::NotFound(remote_key.to_string()));
            }
            Err(e) => return Err(classify(e, format!("GET s3://{}/{}", self.bucket, key))),
        };

        ensure_parent(local_path).await?;
        let mut output_file = File::create(local_path)
            .await
            .map_err(|e| StorageError::io(local_path, e))?;

        let mut total_bytes = 0usize;
        loop {
            let chunk = match object.body.try_next().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    drop(output_file);
                    let _ = tokio::fs::remove_file(local_path).await;
                    return Err(StorageError::Remote {
                        message: format!("Reading body of s3://{}/{}: {}", self.bucket, key, e),
                        retryable: true,
                    });
                }
            };
            output_file
                .write_all(&chunk)
                .await
                .map_err(|e| StorageError::io(local_path, e))?;
            total_bytes += chunk.len();
        }
        output_file
            .flush()
            .await
            .map_err(|e| StorageError::io(local_path, e))?;

        debug!(
            "Downloaded {} bytes from s3://{}/{} to {}",
            total_bytes,
            self.bucket,
            key,
            local_path.display()
        );
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let full_prefix = self.object_key(prefix);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| classify(e, format!("LIST s3://{}/{}", self.bucket, full_prefix)))?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(|key| self.strip_folder(key).to_string()),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, remote_key: &str) -> StorageResult<()> {
        // DeleteObject succeeds on missing keys, so check first.
        if !self.exists(remote_key).await? {
            return Err(StorageError::NotFound(remote_key.to_string()));
        }
        let key = self.object_key(remote_key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| classify(e, format!("DELETE s3://{}/{}", self.bucket, key)))?;
        debug!("Deleted s3://{}/{}", self.bucket, key);
        Ok(())
    }

    async fn size(&self, remote_key: &str) -> StorageResult<u64> {
        let length = self.head(remote_key).await?;
        Ok(length.and_then(|len| u64::try_from(len).ok()).unwrap_or(0))
    }
}
