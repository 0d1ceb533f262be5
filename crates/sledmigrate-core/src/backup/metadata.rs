//! Backup metadata sidecar files.
//!
//! A plain UTF-8 `KEY=value` format with `#` comments. Unknown keys are
//! ignored and malformed lines are skipped, so the format can grow without
//! breaking older readers.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::Error;

/// Extension marking a compressed backup artifact.
const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Metadata file name inside uncompressed backup directories.
const DIRECTORY_METADATA: &str = ".backup_metadata";

/// Metadata file suffix next to compressed archives.
const SIDECAR_SUFFIX: &str = ".metadata";

/// Information about a database backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    /// Absolute path of the backup artifact.
    pub path: PathBuf,
    /// Path of the database the backup was taken from.
    pub original_db: PathBuf,
    /// When the backup was created.
    pub created_at: DateTime<Utc>,
    /// Artifact size in bytes.
    pub size: u64,
    /// Schema version captured at backup time.
    pub version: i64,
    /// Free-form description.
    pub description: String,
}

/// Whether a backup artifact is a compressed archive.
pub(crate) fn is_archive(path: &Path) -> bool {
    path.to_string_lossy().ends_with(ARCHIVE_SUFFIX)
}

/// Location of the metadata file for a backup artifact: a sibling
/// `.metadata` file for archives, a `.backup_metadata` file inside the
/// directory otherwise.
pub(crate) fn metadata_path(backup_path: &Path) -> PathBuf {
    if is_archive(backup_path) {
        PathBuf::from(format!("{}{SIDECAR_SUFFIX}", backup_path.display()))
    } else {
        backup_path.join(DIRECTORY_METADATA)
    }
}

impl BackupInfo {
    /// Write the metadata file for this backup.
    pub(crate) fn write(&self) -> Result<(), Error> {
        let content = format!(
            "# Database backup metadata\n\
             # Created: {created}\n\
             # Original DB: {original}\n\
             \n\
             ORIGINAL_DB={original}\n\
             CREATED_AT={created_rfc}\n\
             VERSION={version}\n\
             SIZE={size}\n\
             DESCRIPTION={description}\n",
            created = self.created_at.format("%Y-%m-%d %H:%M:%S"),
            original = self.original_db.display(),
            created_rfc = self.created_at.to_rfc3339(),
            version = self.version,
            size = self.size,
            description = self.description,
        );
        fs::write(metadata_path(&self.path), content)?;
        Ok(())
    }

    /// Read backup metadata for the given artifact.
    pub(crate) fn read(backup_path: &Path) -> Result<Self, Error> {
        let content = fs::read_to_string(metadata_path(backup_path))?;

        let mut info = BackupInfo {
            path: backup_path.to_path_buf(),
            original_db: PathBuf::new(),
            created_at: DateTime::UNIX_EPOCH,
            size: 0,
            version: 0,
            description: String::new(),
        };

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "ORIGINAL_DB" => info.original_db = PathBuf::from(value),
                "CREATED_AT" => {
                    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
                        info.created_at = t.with_timezone(&Utc);
                    }
                }
                "VERSION" => {
                    if let Ok(v) = value.parse() {
                        info.version = v;
                    }
                }
                "SIZE" => {
                    if let Ok(s) = value.parse() {
                        info.size = s;
                    }
                }
                "DESCRIPTION" => info.description = value.to_string(),
                _ => {}
            }
        }

        Ok(info)
    }
}
