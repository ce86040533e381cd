//! dbvault
//!
//! Backs up a PostgreSQL database and the application's files to local disk,
//! S3 or GCS, restores them, and applies retention.

mod backup;
mod catalog;
mod config;
mod errors;
mod restore;
mod retention;
mod storage;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use dotenv::dotenv;
use std::process::ExitCode;
use tracing::{error, info, warn};

use backup::{BackupContext, BackupOrchestrator};
use catalog::MetadataStore;
use config::{AppConfig, BackupConfig, Cli, Destination, Operation};
use restore::RestoreOrchestrator;
use retention::RetentionManager;
use storage::build_storage;
use utils::setting::{check_db_connection, redact_url};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();
    utils::logger::init_logger(cli.verbose);

    let (app_config, backup_config) = match prepare(&cli) {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    // Dropping the operation future on Ctrl-C removes its working directory.
    let outcome = tokio::select! {
        result = run_app(cli.operation(), &app_config, &backup_config) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    match outcome {
        Some(Ok(())) => {
            info!("✓ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Some(Err(e)) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
        None => {
            warn!("Interrupted, aborting");
            // Archive workers on the blocking pool would hold up runtime shutdown.
            std::process::exit(1);
        }
    }
}

/// Loads configuration and, for restores, asks for confirmation. Runs before
/// the Ctrl-C handler is installed so an interrupt at the prompt exits directly.
fn prepare(cli: &Cli) -> Result<(AppConfig, BackupConfig)> {
    let app_config = AppConfig::load_from_json(&cli.config).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            cli.config.display()
        )
    })?;
    let backup_config = cli.backup_config(&app_config);

    if cli.operation() == Operation::Restore && !backup_config.force && !backup_config.dry_run {
        let backup_id = required_backup_id(&backup_config)?;
        if !confirm_restore(backup_id, &backup_config)? {
            anyhow::bail!("Restore cancelled");
        }
    }
    Ok((app_config, backup_config))
}

async fn run_app(operation: Operation, app_config: &AppConfig, backup_config: &BackupConfig) -> Result<()> {
    match operation {
        Operation::Backup(_) => run_backup(app_config, backup_config).await,
        Operation::Restore => run_restore(app_config, backup_config).await,
        Operation::ListBackups => list_backups(app_config),
        Operation::Validate => run_validate(app_config, backup_config).await,
        Operation::Cleanup => run_cleanup(app_config, backup_config).await,
    }
}

async fn run_backup(app_config: &AppConfig, backup_config: &BackupConfig) -> Result<()> {
    let database_url = app_config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set (environment or config.json) to take a backup")?;
    if !backup_config.dry_run && !check_db_connection(database_url).await {
        anyhow::bail!("Cannot connect to {}", redact_url(database_url));
    }

    let storage = build_storage(app_config, backup_config.destination).await?;
    let context = BackupContext::new(app_config, backup_config, storage);
    let metadata = BackupOrchestrator::new(&context, backup_config)?
        .run()
        .await
        .context("Backup process failed")?;

    if !backup_config.dry_run {
        println!("Backup ID:   {}", metadata.backup_id);
        println!("Stored as:   {}", metadata.remote_key().unwrap_or_default());
        println!("Size:        {} bytes", metadata.compressed_size_bytes);
        println!("Checksum:    {}", metadata.checksum);
    }
    Ok(())
}

async fn run_restore(app_config: &AppConfig, backup_config: &BackupConfig) -> Result<()> {
    let backup_id = required_backup_id(backup_config)?;
    let destination = record_destination(app_config, backup_id, backup_config.destination)?;
    let storage = build_storage(app_config, destination).await?;
    let context = BackupContext::new(app_config, backup_config, storage);
    let report = RestoreOrchestrator::new(&context, backup_config)?
        .restore(backup_id)
        .await
        .context("Restore process failed")?;

    println!("Backup {}:", report.backup_id);
    for (component, reason) in &report.failed {
        println!("FAILED    {}: {}", component, reason);
    }
    for component in &report.restored {
        println!("restored  {}", component);
    }
    Ok(())
}

fn list_backups(app_config: &AppConfig) -> Result<()> {
    let mut records = MetadataStore::new(&app_config.catalog_path)
        .load_all()
        .context("Failed to read backup catalog")?;
    if records.is_empty() {
        println!("No backups recorded in {}", app_config.catalog_path.display());
        return Ok(());
    }
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    println!(
        "{:<32}  {:<20}  {:<12}  {:<9}  {:>12}  {:<5}  {}",
        "ID", "CREATED (UTC)", "STRATEGY", "STATUS", "SIZE", "ENC", "DESTINATION"
    );
    for record in &records {
        println!(
            "{:<32}  {:<20}  {:<12}  {:<9}  {:>12}  {:<5}  {}",
            record.backup_id,
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.strategy,
            record.status,
            record.compressed_size_bytes,
            if record.is_encrypted() { "yes" } else { "no" },
            record.destination
        );
        if let Some(message) = &record.error_message {
            println!("    error: {}", message);
        }
    }
    Ok(())
}

async fn run_validate(app_config: &AppConfig, backup_config: &BackupConfig) -> Result<()> {
    let backup_id = required_backup_id(backup_config)?;
    let destination = record_destination(app_config, backup_id, backup_config.destination)?;
    let storage = build_storage(app_config, destination).await?;
    let context = BackupContext::new(app_config, backup_config, storage);

    if !RestoreOrchestrator::new(&context, backup_config)?
        .validate(backup_id)
        .await
    {
        anyhow::bail!("Backup {} failed validation", backup_id);
    }
    println!("Backup {} is valid", backup_id);
    Ok(())
}

async fn run_cleanup(app_config: &AppConfig, backup_config: &BackupConfig) -> Result<()> {
    let older_than = backup_config.older_than.or(backup_config.retention_days);
    if older_than.is_none() && backup_config.max_backups.is_none() {
        anyhow::bail!("--cleanup needs --older-than, --retention-days or --max-backups");
    }

    let catalog = MetadataStore::new(&app_config.catalog_path);
    let records = catalog.load_all().context("Failed to read backup catalog")?;
    let storage = build_storage(app_config, backup_config.destination).await?;
    let removed = RetentionManager::new(storage, catalog, backup_config.dry_run)
        .cleanup(records, older_than, backup_config.max_backups)
        .await
        .context("Failed to update backup catalog")?;

    let verb = if backup_config.dry_run { "Would remove" } else { "Removed" };
    println!("{} {} backup(s)", verb, removed.len());
    for record in &removed {
        println!("  {}  {}", record.backup_id, record.timestamp.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
}

fn required_backup_id(backup_config: &BackupConfig) -> Result<&str> {
    backup_config
        .backup_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .context("--backup-id is required for this operation")
}

/// Backend a catalogued backup was written to, falling back to `--destination`.
fn record_destination(app_config: &AppConfig, backup_id: &str, fallback: Destination) -> Result<Destination> {
    let record = MetadataStore::new(&app_config.catalog_path)
        .find(backup_id)
        .context("Failed to read backup catalog")?;
    Ok(record
        .and_then(|r| Destination::from_str(&r.destination, true).ok())
        .unwrap_or(fallback))
}

/// Asks before overwriting the database and restore root.
fn confirm_restore(backup_id: &str, backup_config: &BackupConfig) -> Result<bool> {
    use std::io::{Write, stdin, stdout};

    let target = backup_config
        .restore_target
        .as_deref()
        .unwrap_or("the source database");
    println!(
        "Restoring backup {} will overwrite {} (full and schema backups DROP and recreate it).",
        backup_id, target
    );
    print!("Type 'yes' to continue: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().eq_ignore_ascii_case("yes"))
}
