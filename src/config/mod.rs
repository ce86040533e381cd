// dbvault/src/config/mod.rs
pub(crate) mod cli;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use crate::catalog::BackupStrategy;

pub use cli::{Cli, Operation};

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonGcsStorageConfig {
    pub bucket_name: Option<String>,
    pub service_account_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonLocalStorageConfig {
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonPathsConfig {
    #[serde(default)]
    pub uploads: Vec<PathBuf>,
    #[serde(default)]
    pub logs: Vec<PathBuf>,
    #[serde(default)]
    pub config: Vec<PathBuf>,
    pub restore_root: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database_url: Option<String>,
    pub environment: Option<String>,
    pub version: Option<String>,
    pub source_revision: Option<String>,
    pub pg_bin_dir: Option<PathBuf>,
    pub encryption_key_file: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
    pub notification_webhook: Option<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub paths: JsonPathsConfig,
    pub local_storage: Option<JsonLocalStorageConfig>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub gcs_storage: Option<JsonGcsStorageConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GcsConfig {
    pub bucket_name: String,
    pub service_account_path: Option<PathBuf>,
}

/// Which storage backend a run writes to or reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Destination {
    Local,
    S3,
    Gcs,
}

/// Directories that feed the file archives and receive restored files.
#[derive(Debug, Clone)]
pub struct ContentPaths {
    pub uploads: Vec<PathBuf>,
    pub logs: Vec<PathBuf>,
    pub config: Vec<PathBuf>,
    pub restore_root: PathBuf,
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub environment: String,
    pub version: String,
    pub source_revision: Option<String>,
    pub pg_bin_dir: Option<PathBuf>,
    pub encryption_key_file: PathBuf,
    pub catalog_path: PathBuf,
    pub notification_webhook: Option<String>,
    pub exclude_patterns: Vec<String>,
    pub paths: ContentPaths,
    pub local_root: Option<PathBuf>,
    pub s3_config: Option<S3Config>,
    pub gcs_config: Option<GcsConfig>,
}

/// Per-invocation options, assembled from the command line and config.json.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub strategy: BackupStrategy,
    pub destination: Destination,
    pub encrypt: bool,
    pub compress: bool,
    pub verify: bool,
    pub include_uploads: bool,
    pub include_logs: bool,
    pub include_config: bool,
    pub exclude_patterns: Vec<String>,
    pub retention_days: Option<u32>,
    pub max_backups: Option<usize>,
    pub older_than: Option<u32>,
    pub dry_run: bool,
    pub force: bool,
    pub verbose: bool,
    pub backup_id: Option<String>,
    pub restore_target: Option<String>,
    pub notification_webhook: Option<String>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            strategy: BackupStrategy::Full,
            destination: Destination::Local,
            encrypt: false,
            compress: true,
            verify: false,
            include_uploads: false,
            include_logs: false,
            include_config: false,
            exclude_patterns: Vec::new(),
            retention_days: None,
            max_backups: None,
            older_than: None,
            dry_run: false,
            force: false,
            verbose: false,
            backup_id: None,
            restore_target: None,
            notification_webhook: None,
        }
    }
}

const DEFAULT_LOCAL_ROOT: &str = "./backups";
const DEFAULT_KEY_FILE: &str = "./backup.key";
const DEFAULT_CATALOG: &str = "./catalog/metadata.json";

impl AppConfig {
    /// Loads config.json. A missing file yields defaults; a malformed one is an error.
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let raw_json_config = if config_path.exists() {
            let config_content = fs::read_to_string(config_path).with_context(|| {
                format!("Failed to read config file at {}", config_path.display())
            })?;
            serde_json::from_str(&config_content).with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?
        } else {
            info!(
                "No config file at {}, using defaults",
                config_path.display()
            );
            RawJsonConfig::default()
        };
        Ok(Self::from_raw(raw_json_config))
    }

    pub fn from_raw(raw: RawJsonConfig) -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .or(raw.database_url);

        let s3_config = raw.s3_storage.as_ref().and_then(parse_s3_config);
        let gcs_config = raw.gcs_storage.as_ref().and_then(|gcs| {
            let bucket = gcs.bucket_name.clone().filter(|s| !s.is_empty())?;
            Some(GcsConfig {
                bucket_name: bucket,
                service_account_path: gcs.service_account_path.clone(),
            })
        });

        AppConfig {
            database_url,
            environment: raw
                .environment
                .unwrap_or_else(|| "production".to_string()),
            version: raw
                .version
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            source_revision: raw.source_revision,
            pg_bin_dir: raw.pg_bin_dir,
            encryption_key_file: raw
                .encryption_key_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_FILE)),
            catalog_path: raw
                .catalog_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG)),
            notification_webhook: raw.notification_webhook.filter(|s| !s.is_empty()),
            exclude_patterns: raw.exclude_patterns,
            paths: ContentPaths {
                uploads: raw.paths.uploads,
                logs: raw.paths.logs,
                config: raw.paths.config,
                restore_root: raw.paths.restore_root.unwrap_or_else(|| PathBuf::from(".")),
                work_dir: raw.paths.work_dir,
            },
            local_root: raw.local_storage.and_then(|local| local.root),
            s3_config,
            gcs_config,
        }
    }

    pub fn local_storage_root(&self) -> PathBuf {
        self.local_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_ROOT))
    }

    /// Revision from config, then `SOURCE_REVISION`, then `git rev-parse`.
    pub fn resolve_source_revision(&self) -> String {
        if let Some(rev) = self.source_revision.as_ref().filter(|s| !s.is_empty()) {
            return rev.clone();
        }
        if let Ok(rev) = std::env::var("SOURCE_REVISION") {
            if !rev.trim().is_empty() {
                return rev.trim().to_string();
            }
        }
        match Command::new("git")
            .args(["rev-parse", "--short", "HEAD"])
            .output()
        {
            Ok(output) if output.status.success() => {
                let rev = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if rev.is_empty() { "unknown".to_string() } else { rev }
            }
            Ok(_) | Err(_) => {
                debug!("git revision unavailable, recording 'unknown'");
                "unknown".to_string()
            }
        }
    }
}

fn parse_s3_config(s3_raw: &JsonS3StorageConfig) -> Option<S3Config> {
    if let (Some(bucket), Some(region), Some(key_id), Some(secret), Some(endpoint)) = (
        s3_raw.bucket_name.as_ref().filter(|s| !s.is_empty()),
        s3_raw.region.as_ref().filter(|s| !s.is_empty()),
        s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
        s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
        s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()),
    ) {
        Some(S3Config {
            bucket_name: bucket.clone(),
            region: region.clone(),
            access_key_id: key_id.clone(),
            secret_access_key: secret.clone(),
            endpoint_url: endpoint.clone(),
            folder_prefix: s3_raw.folder_prefix.clone().filter(|s| !s.is_empty()),
        })
    } else {
        if s3_raw.bucket_name.is_some()
            || s3_raw.region.is_some()
            || s3_raw.access_key_id.is_some()
            || s3_raw.secret_access_key.is_some()
            || s3_raw.endpoint_url.is_some()
        {
            // Only warn if some S3 fields were provided but were incomplete/empty
            warn!(
                "s3_storage is present in config.json but some required fields (bucket_name, region, access_key_id, secret_access_key, endpoint_url) are missing or empty. The s3 destination is disabled."
            );
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawJsonConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = AppConfig::from_raw(raw(json!({})));
        assert_eq!(config.environment, "production");
        assert_eq!(config.local_storage_root(), PathBuf::from(DEFAULT_LOCAL_ROOT));
        assert_eq!(config.catalog_path, PathBuf::from(DEFAULT_CATALOG));
        // The local backend lists everything under its root.
        assert!(!config.catalog_path.starts_with(config.local_storage_root()));
        assert_eq!(config.paths.restore_root, PathBuf::from("."));
        assert!(config.s3_config.is_none());
        assert!(config.gcs_config.is_none());
    }

    #[test]
    fn test_complete_s3_section_is_accepted() {
        let config = AppConfig::from_raw(raw(json!({
            "s3_storage": {
                "bucket_name": "backups",
                "region": "fra1",
                "access_key_id": "key",
                "secret_access_key": "secret",
                "endpoint_url": "https://fra1.digitaloceanspaces.com",
                "folder_prefix": ""
            }
        })));
        let s3 = config.s3_config.unwrap();
        assert_eq!(s3.bucket_name, "backups");
        assert_eq!(s3.folder_prefix, None);
    }

    #[test]
    fn test_incomplete_s3_section_is_disabled() {
        let config = AppConfig::from_raw(raw(json!({
            "s3_storage": { "bucket_name": "backups", "region": "" }
        })));
        assert!(config.s3_config.is_none());
    }

    #[test]
    fn test_paths_and_gcs_section() {
        let config = AppConfig::from_raw(raw(json!({
            "environment": "staging",
            "source_revision": "deadbeef",
            "paths": {
                "uploads": ["/srv/app/media"],
                "config": ["/srv/app/settings.toml"],
                "restore_root": "/srv/app"
            },
            "gcs_storage": { "bucket_name": "app-backups" },
            "exclude_patterns": ["*.tmp"]
        })));
        assert_eq!(config.environment, "staging");
        assert_eq!(config.resolve_source_revision(), "deadbeef");
        assert_eq!(config.paths.uploads, vec![PathBuf::from("/srv/app/media")]);
        assert!(config.paths.logs.is_empty());
        assert_eq!(config.gcs_config.unwrap().bucket_name, "app-backups");
        assert_eq!(config.exclude_patterns, vec!["*.tmp".to_string()]);
    }

    #[test]
    fn test_missing_file_yields_defaults() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let config = AppConfig::load_from_json(&dir.path().join("absent.json"))?;
        assert_eq!(config.encryption_key_file, PathBuf::from(DEFAULT_KEY_FILE));
        Ok(())
    }

    #[test]
    fn test_malformed_file_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("config.json");
        fs::write(&path, "{ \"paths\": 3 ")?;
        assert!(AppConfig::load_from_json(&path).is_err());
        Ok(())
    }
}
