// dbvault/src/restore/verification.rs
use std::path::Path;

use tracing::{error, info};

use super::logic::RestoreOrchestrator;
use crate::errors::RestoreError;
use crate::utils::sha256_file;

/// Compares the SHA-256 of `path` against the catalogued checksum.
pub(crate) fn verify_checksum(path: &Path, expected: &str) -> Result<(), RestoreError> {
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(RestoreError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

impl RestoreOrchestrator<'_> {
    /// Downloads a backup and checks its checksum without restoring anything.
    ///
    /// Never fails: every problem is logged and reported as `false`.
    pub async fn validate(&self, backup_id: &str) -> bool {
        match self.check_integrity(backup_id).await {
            Ok(()) => {
                info!("✓ Backup {} is intact", backup_id);
                true
            }
            Err(RestoreError::ChecksumMismatch { expected, actual }) => {
                error!(
                    "Backup {} failed validation: checksum mismatch (expected {}, got {})",
                    backup_id, expected, actual
                );
                false
            }
            Err(e) => {
                error!("Backup {} failed validation: {}", backup_id, e);
                false
            }
        }
    }

    async fn check_integrity(&self, backup_id: &str) -> Result<(), RestoreError> {
        let record = self.restorable_record(backup_id)?;
        let downloaded = self.download(&record).await?;
        verify_checksum(&downloaded, &record.checksum)
    }
}
