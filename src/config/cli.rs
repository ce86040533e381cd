// dbvault/src/config/cli.rs
use clap::{ArgGroup, Parser};
use std::path::PathBuf;

use super::{AppConfig, BackupConfig, Destination};
use crate::catalog::BackupStrategy;

#[derive(Debug, Parser)]
#[command(
    name = "dbvault",
    version,
    about = "Backup, restore and retention for a PostgreSQL database and its files"
)]
#[command(group(
    ArgGroup::new("operation")
        .required(true)
        .args(["strategy", "restore", "list_backups", "validate", "cleanup"])
))]
pub struct Cli {
    /// Take a backup with the given strategy
    #[arg(long, value_enum)]
    pub strategy: Option<BackupStrategy>,

    /// Restore the backup named by --backup-id
    #[arg(long)]
    pub restore: bool,

    /// Print the backup catalog
    #[arg(long)]
    pub list_backups: bool,

    /// Verify the stored checksum of --backup-id
    #[arg(long)]
    pub validate: bool,

    /// Apply the retention policy
    #[arg(long)]
    pub cleanup: bool,

    #[arg(long, value_enum, default_value = "local")]
    pub destination: Destination,

    #[arg(long)]
    pub encrypt: bool,

    #[arg(long)]
    pub compress: bool,

    /// Verify the checksum before restoring
    #[arg(long)]
    pub verify: bool,

    #[arg(long)]
    pub backup_id: Option<String>,

    /// Database to restore into (defaults to the source database)
    #[arg(long)]
    pub restore_target: Option<String>,

    /// Remove backups older than N days (with --cleanup)
    #[arg(long, value_name = "N")]
    pub older_than: Option<u32>,

    /// Age limit applied after a successful backup
    #[arg(long, value_name = "N")]
    pub retention_days: Option<u32>,

    /// Keep at most N backups on the selected destination; backups stored on
    /// other destinations are not counted
    #[arg(long, value_name = "N")]
    pub max_backups: Option<usize>,

    #[arg(long)]
    pub include_uploads: bool,

    #[arg(long)]
    pub include_logs: bool,

    #[arg(long)]
    pub include_config: bool,

    /// Glob to exclude from file archives (repeatable)
    #[arg(long = "exclude-pattern", value_name = "GLOB")]
    pub exclude_patterns: Vec<String>,

    #[arg(long, value_name = "URL")]
    pub notification_webhook: Option<String>,

    #[arg(long)]
    pub dry_run: bool,

    #[arg(long, short)]
    pub verbose: bool,

    /// Skip the restore confirmation prompt
    #[arg(long)]
    pub force: bool,

    #[arg(long, default_value = "config.json", env = "DBVAULT_CONFIG")]
    pub config: PathBuf,
}

/// The single primary operation selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Backup(BackupStrategy),
    Restore,
    ListBackups,
    Validate,
    Cleanup,
}

impl Cli {
    pub fn operation(&self) -> Operation {
        if let Some(strategy) = self.strategy {
            Operation::Backup(strategy)
        } else if self.restore {
            Operation::Restore
        } else if self.validate {
            Operation::Validate
        } else if self.cleanup {
            Operation::Cleanup
        } else {
            Operation::ListBackups
        }
    }

    /// Merges flags over config.json values.
    pub fn backup_config(&self, app_config: &AppConfig) -> BackupConfig {
        let mut exclude_patterns = app_config.exclude_patterns.clone();
        exclude_patterns.extend(self.exclude_patterns.iter().cloned());

        BackupConfig {
            strategy: self.strategy.unwrap_or(BackupStrategy::Full),
            destination: self.destination,
            encrypt: self.encrypt,
            compress: self.compress,
            verify: self.verify,
            include_uploads: self.include_uploads,
            include_logs: self.include_logs,
            include_config: self.include_config,
            exclude_patterns,
            retention_days: self.retention_days,
            max_backups: self.max_backups,
            older_than: self.older_than,
            dry_run: self.dry_run,
            force: self.force,
            verbose: self.verbose,
            backup_id: self.backup_id.clone(),
            restore_target: self.restore_target.clone(),
            notification_webhook: self
                .notification_webhook
                .clone()
                .or_else(|| app_config.notification_webhook.clone()),
        }
    }
}
