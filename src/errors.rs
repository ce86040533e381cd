use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single storage backend operation.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Local I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote storage error: {message}")]
    Remote { message: String, retryable: bool },

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether retrying the same call has a chance of succeeding.
    pub fn retryable(&self) -> bool {
        match self {
            StorageError::Remote { retryable, .. } => *retryable,
            StorageError::NotFound(_) | StorageError::Io { .. } | StorageError::Config(_) => false,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return StorageError::NotFound(path.into().display().to_string());
        }
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Key file error at {path}: {message}")]
    KeyFile { path: PathBuf, message: String },

    #[error("Not an encrypted archive: {0}")]
    Format(String),

    #[error("Encryption key mismatch: archive uses key {expected}, loaded key is {actual}")]
    KeyMismatch { expected: String, actual: String },

    #[error("Decryption failed: invalid key or corrupted data")]
    Authentication,

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Catalog I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Catalog document is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fatal to the backup pipeline.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("{tool} exited with {status}: {stderr}")]
    Command {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Strategy '{0}' is not supported")]
    UnsupportedStrategy(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal to the restore pipeline's download/verify/decrypt/extract phase.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Backup {0} not found in catalog")]
    NotFound(String),

    #[error("Backup {backup_id} has status {status} and cannot be restored")]
    NotRestorable { backup_id: String, status: String },

    #[error("Download failed: {0}")]
    Download(#[source] StorageError),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Decryption failed: {0}")]
    Decrypt(#[source] EncryptionError),

    #[error("Extraction failed: {0}")]
    Extract(String),

    #[error("Component restore failed: {0}")]
    Component(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
