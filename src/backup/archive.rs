// dbvault/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Sizes reported for a finished archive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveInfo {
    pub original_size: u64,
    pub compressed_size: u64,
    pub ratio: f64,
}

/// Builds and extracts GZipped TAR archives.
#[derive(Debug, Clone, Copy)]
pub struct FileArchiveManager {
    compression: Compression,
}

impl Default for FileArchiveManager {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FileArchiveManager {
    /// `compress = false` still writes a gzip stream, at level 0.
    pub fn new(compress: bool) -> Self {
        let compression = if compress {
            Compression::default()
        } else {
            Compression::none()
        };
        Self { compression }
    }

    /// Archives each source path (file or directory) into `output`.
    ///
    /// Entries are named relative to the parent of their top-level source, so
    /// `/srv/app/media/a.png` is stored as `media/a.png`. Paths whose full path
    /// or base name matches an exclude glob are skipped; excluded directories
    /// are not descended into.
    pub fn archive(
        &self,
        sources: &[PathBuf],
        exclude_patterns: &[String],
        output: &Path,
    ) -> Result<ArchiveInfo> {
        let excludes = build_globset(exclude_patterns)?;
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "Failed to create parent directory for archive: {}",
                        parent.display()
                    )
                })?;
            }
        }

        let existing: Vec<&PathBuf> = sources
            .iter()
            .filter(|source| {
                let exists = source.exists();
                if !exists {
                    warn!("Archive source does not exist, skipping: {}", source.display());
                }
                exists
            })
            .collect();
        if existing.is_empty() {
            anyhow::bail!("None of the archive sources exist: {:?}", sources);
        }

        info!("Creating tar.gz archive at {}", output.display());

        let archive_file = File::create(output)
            .with_context(|| format!("Failed to create archive file: {}", output.display()))?;
        let enc = GzEncoder::new(archive_file, self.compression);
        let mut tar_builder = Builder::new(enc);
        tar_builder.follow_symlinks(false);

        let mut original_size = 0u64;
        for source in existing {
            let base = source.parent().unwrap_or_else(|| Path::new(""));
            let walker = WalkDir::new(source)
                .follow_links(false)
                .into_iter()
                .filter_entry(|entry| !is_excluded(&excludes, entry.path()));

            for entry in walker {
                let entry = entry
                    .with_context(|| format!("Failed to walk directory: {}", source.display()))?;
                let path = entry.path();
                let name = path.strip_prefix(base).with_context(|| {
                    format!(
                        "Failed to strip prefix {} from {}",
                        base.display(),
                        path.display()
                    )
                })?;
                if name.as_os_str().is_empty() {
                    continue;
                }

                let file_type = entry.file_type();
                if file_type.is_dir() {
                    tar_builder.append_dir(name, path).with_context(|| {
                        format!("Failed to append directory {} to archive", path.display())
                    })?;
                } else if file_type.is_file() || file_type.is_symlink() {
                    tar_builder.append_path_with_name(path, name).with_context(|| {
                        format!(
                            "Failed to append file {} as {} to archive",
                            path.display(),
                            name.display()
                        )
                    })?;
                    if file_type.is_file() {
                        original_size += entry.metadata().map(|m| m.len()).unwrap_or(0);
                    }
                }
            }
        }

        let encoder = tar_builder.into_inner().with_context(|| {
            format!(
                "Failed to get inner encoder from tar builder for archive: {}",
                output.display()
            )
        })?;
        encoder.finish().with_context(|| {
            format!(
                "Failed to finish Gzip encoding for archive: {}",
                output.display()
            )
        })?;

        let compressed_size = fs::metadata(output)
            .with_context(|| format!("Failed to stat archive: {}", output.display()))?
            .len();
        let ratio = if original_size == 0 {
            0.0
        } else {
            compressed_size as f64 / original_size as f64
        };

        info!(
            "✓ Tar.gz archive created at {} ({} -> {} bytes)",
            output.display(),
            original_size,
            compressed_size
        );
        Ok(ArchiveInfo {
            original_size,
            compressed_size,
            ratio,
        })
    }

    /// Extracts `archive` into `dest_dir`, creating it if absent.
    pub fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<()> {
        if !archive.is_file() {
            anyhow::bail!("Archive for extraction is not a file: {}", archive.display());
        }
        if !dest_dir.exists() {
            fs::create_dir_all(dest_dir).with_context(|| {
                format!("Failed to create extraction directory: {}", dest_dir.display())
            })?;
        } else if !dest_dir.is_dir() {
            anyhow::bail!(
                "Extraction path exists but is not a directory: {}",
                dest_dir.display()
            );
        }

        debug!(
            "Extracting tar.gz archive from {} to {}",
            archive.display(),
            dest_dir.display()
        );

        let archive_file = File::open(archive)
            .with_context(|| format!("Failed to open archive file: {}", archive.display()))?;
        let gz_decoder = flate2::read::GzDecoder::new(archive_file);
        let mut tar_archive = tar::Archive::new(gz_decoder);
        tar_archive.set_preserve_permissions(true);

        tar_archive.unpack(dest_dir).with_context(|| {
            format!(
                "Failed to unpack archive {} to {}",
                archive.display(),
                dest_dir.display()
            )
        })?;

        info!(
            "✓ Extracted {} to {}",
            archive.display(),
            dest_dir.display()
        );
        Ok(())
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob =
            Glob::new(pattern).with_context(|| format!("Invalid glob pattern: {}", pattern))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

fn is_excluded(excludes: &GlobSet, path: &Path) -> bool {
    if excludes.is_empty() {
        return false;
    }
    if excludes.is_match(path) {
        return true;
    }
    path.file_name()
        .is_some_and(|name| excludes.is_match(Path::new(name)))
}
