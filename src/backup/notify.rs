// dbvault/src/backup/notify.rs
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::catalog::BackupMetadata;

#[derive(Debug, Serialize, PartialEq)]
pub struct NotificationPayload {
    pub backup_id: String,
    pub timestamp: String,
    pub strategy: String,
    pub environment: String,
    pub size_mb: f64,
    pub duration_seconds: f64,
    pub destination: String,
    pub status: String,
}

impl From<&BackupMetadata> for NotificationPayload {
    fn from(meta: &BackupMetadata) -> Self {
        Self {
            backup_id: meta.backup_id.clone(),
            timestamp: meta.timestamp.to_rfc3339(),
            strategy: meta.strategy.to_string(),
            environment: meta.environment.clone(),
            size_mb: (meta.compressed_size_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
            duration_seconds: meta.duration_seconds,
            destination: meta.destination.clone(),
            status: meta.status.to_string(),
        }
    }
}

/// Posts a JSON summary of successful backups to a webhook.
pub struct Notifier {
    client: reqwest::Client,
    url: String,
}

impl Notifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }

    /// Never fails: delivery problems are logged and dropped.
    pub async fn notify(&self, meta: &BackupMetadata) {
        let payload = NotificationPayload::from(meta);
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!("✓ Notification sent for backup {}", meta.backup_id);
            }
            Ok(response) => {
                warn!(
                    "Notification webhook answered {} for backup {}",
                    response.status(),
                    meta.backup_id
                );
            }
            Err(e) => {
                warn!("Failed to send notification for backup {}: {}", meta.backup_id, e);
            }
        }
    }
}
