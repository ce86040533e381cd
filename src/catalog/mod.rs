// dbvault/src/catalog/mod.rs
pub(crate) mod store;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::BackupError;

pub use store::MetadataStore;

/// Scope of a backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackupStrategy {
    Full,
    Incremental,
    Differential,
    Schema,
    Data,
}

impl BackupStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStrategy::Full => "full",
            BackupStrategy::Incremental => "incremental",
            BackupStrategy::Differential => "differential",
            BackupStrategy::Schema => "schema",
            BackupStrategy::Data => "data",
        }
    }

    /// Whether this strategy runs a database dump at all.
    pub fn dumps_database(&self) -> bool {
        matches!(
            self,
            BackupStrategy::Full | BackupStrategy::Schema | BackupStrategy::Data
        )
    }
}

impl fmt::Display for BackupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BackupStatus {
    fn can_transition_to(self, next: BackupStatus) -> bool {
        matches!(
            (self, next),
            (BackupStatus::Pending, BackupStatus::Running)
                | (BackupStatus::Running, BackupStatus::Completed)
                | (BackupStatus::Pending, BackupStatus::Failed)
                | (BackupStatus::Running, BackupStatus::Failed)
        )
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Running => "running",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Metrics gathered while dumping the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    #[serde(rename = "type")]
    pub dump_type: String,
    pub duration_seconds: f64,
    pub dump_size_bytes: u64,
    pub table_count: Option<i64>,
    pub database_size_bytes: Option<i64>,
}

/// Catalog entry describing one backup run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_id: String,
    pub timestamp: DateTime<Utc>,
    pub strategy: BackupStrategy,
    pub environment: String,
    pub version: String,
    pub source_revision: String,
    pub size_bytes: u64,
    pub compressed_size_bytes: u64,
    pub checksum: String,
    pub encryption_key_id: Option<String>,
    pub destination: String,
    pub files: Vec<String>,
    pub database_info: Option<DatabaseInfo>,
    pub duration_seconds: f64,
    pub status: BackupStatus,
    pub error_message: Option<String>,
}

impl BackupMetadata {
    pub fn new(
        strategy: BackupStrategy,
        environment: &str,
        version: &str,
        source_revision: &str,
        destination: &str,
    ) -> Self {
        Self {
            backup_id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            strategy,
            environment: environment.to_string(),
            version: version.to_string(),
            source_revision: source_revision.to_string(),
            size_bytes: 0,
            compressed_size_bytes: 0,
            checksum: String::new(),
            encryption_key_id: None,
            destination: destination.to_string(),
            files: Vec::new(),
            database_info: None,
            duration_seconds: 0.0,
            status: BackupStatus::Pending,
            error_message: None,
        }
    }

    fn transition(&mut self, next: BackupStatus) -> Result<(), BackupError> {
        if !self.status.can_transition_to(next) {
            return Err(BackupError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<(), BackupError> {
        self.transition(BackupStatus::Running)
    }

    pub fn mark_completed(&mut self) -> Result<(), BackupError> {
        self.transition(BackupStatus::Completed)
    }

    /// Moves the record to `failed`. A failed record always has a message.
    pub fn mark_failed(&mut self, message: &str) -> Result<(), BackupError> {
        self.transition(BackupStatus::Failed)?;
        let message = message.trim();
        self.error_message = Some(if message.is_empty() {
            "unknown error".to_string()
        } else {
            message.to_string()
        });
        Ok(())
    }

    /// File name of the single uploaded artifact, once assembly has run.
    pub fn final_artifact(&self) -> Option<&str> {
        match (self.status, self.files.as_slice()) {
            (BackupStatus::Completed, [artifact]) => Some(artifact.as_str()),
            _ => None,
        }
    }

    /// Storage key of the uploaded artifact for completed records.
    pub fn remote_key(&self) -> Option<String> {
        self.final_artifact()
            .map(|artifact| remote_key(&self.timestamp, artifact))
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption_key_id.is_some()
    }
}

/// Date-namespaced key: `YYYY/MM/DD/<artifact>`.
pub fn remote_key(timestamp: &DateTime<Utc>, artifact: &str) -> String {
    format!("{}/{}", date_prefix(timestamp), artifact)
}

pub fn date_prefix(timestamp: &DateTime<Utc>) -> String {
    format!(
        "{:04}/{:02}/{:02}",
        timestamp.year(),
        timestamp.month(),
        timestamp.day()
    )
}

/// Name of the final combined artifact for a run.
pub fn artifact_name(backup_id: &str, encrypted: bool) -> String {
    if encrypted {
        format!("backup_{}.tar.gz.enc", backup_id)
    } else {
        format!("backup_{}.tar.gz", backup_id)
    }
}
