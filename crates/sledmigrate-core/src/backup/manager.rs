//! Backup creation, listing, restore, and retention.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{Local, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{info, warn};

use super::metadata::{is_archive, metadata_path, BackupInfo};
use crate::catalog::CatalogStore;
use crate::error::Error;
use crate::store::{checkpoint, store_size};

/// Backup behavior knobs.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Package backups as `.tar.gz` archives instead of directories.
    pub compress: bool,
    /// Prune old backups after each create.
    pub cleanup_old_backups: bool,
    /// How many backups to keep when pruning. 0 disables the limit.
    pub max_backups: usize,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            compress: true,
            cleanup_old_backups: true,
            max_backups: 2,
        }
    }
}

/// Handles database backup and restore operations.
///
/// Snapshots always come from the store's checkpoint primitive; the manager
/// never reads live store files, which may be mid-write.
pub struct BackupManager {
    db_path: PathBuf,
    options: BackupOptions,
}

impl BackupManager {
    /// Create a backup manager with default options.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            options: BackupOptions::default(),
        }
    }

    /// Create a backup manager with explicit options.
    pub fn with_options(db_path: impl Into<PathBuf>, options: BackupOptions) -> Self {
        Self {
            db_path: db_path.into(),
            options,
        }
    }

    /// Create a backup of the open database.
    pub fn create(&self, db: &sled::Db, description: &str) -> Result<BackupInfo, Error> {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");

        let (backup_path, size) = if self.options.compress {
            let path = PathBuf::from(format!(
                "{}.backup_{timestamp}.tar.gz",
                self.db_path.display()
            ));
            let size = self.create_compressed(db, &path)?;
            (path, size)
        } else {
            let path = PathBuf::from(format!("{}.backup_{timestamp}", self.db_path.display()));
            let size = self.create_directory(db, &path)?;
            (path, size)
        };

        // Capture the schema version through the open handle.
        let version = CatalogStore::new(db.clone())
            .get()
            .map(|schema| schema.current_version)
            .unwrap_or(0);

        let info = BackupInfo {
            path: backup_path,
            original_db: self.db_path.clone(),
            created_at: Utc::now(),
            size,
            version,
            description: description.to_string(),
        };

        if self.options.cleanup_old_backups {
            if let Err(err) = self.prune_excess() {
                warn!(error = %err, "failed to clean up old backups");
            }
        }

        info.write()?;
        info!(
            path = %info.path.display(),
            size = info.size,
            version = info.version,
            "backup created"
        );

        Ok(info)
    }

    /// List all backups of this database that carry metadata.
    pub fn list(&self) -> Result<Vec<BackupInfo>, Error> {
        let mut backups = Vec::new();
        for path in self.backup_artifacts()? {
            if metadata_path(&path).exists() {
                if let Ok(info) = BackupInfo::read(&path) {
                    backups.push(info);
                }
            }
        }
        // Timestamped names make lexical order chronological.
        backups.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(backups)
    }

    /// Restore the database from a backup.
    ///
    /// The live store directory is first copied aside; on any failure the
    /// copy is moved back and kept on disk for inspection.
    pub fn restore(&self, backup_path: &Path) -> Result<(), Error> {
        if !backup_path.exists() || !metadata_path(backup_path).exists() {
            return Err(Error::RestoreFailed {
                reason: format!("invalid backup: {}", backup_path.display()),
            });
        }

        let info = BackupInfo::read(backup_path)?;
        if info.original_db != self.db_path {
            return Err(Error::RestoreFailed {
                reason: format!(
                    "backup is for database {}, not {}",
                    info.original_db.display(),
                    self.db_path.display()
                ),
            });
        }

        let recovery = PathBuf::from(format!(
            "{}.restore_temp_{}",
            self.db_path.display(),
            Local::now().format("%Y%m%d_%H%M%S")
        ));
        copy_dir(&self.db_path, &recovery).map_err(|err| Error::RestoreFailed {
            reason: format!("failed to create temporary backup: {err}"),
        })?;

        fs::remove_dir_all(&self.db_path)?;

        let result = if is_archive(backup_path) {
            self.extract_archive(backup_path)
        } else {
            copy_dir(backup_path, &self.db_path).map(|_| ())
        };

        match result {
            Ok(()) => {
                let _ = fs::remove_dir_all(&recovery);
                info!(
                    backup = %backup_path.display(),
                    version = info.version,
                    "database restored from backup"
                );
                Ok(())
            }
            Err(err) => {
                warn!(path = %recovery.display(), "restore failed, temporary backup kept");
                let _ = fs::remove_dir_all(&self.db_path);
                match copy_dir(&recovery, &self.db_path) {
                    Ok(_) => Err(Error::RestoreFailed {
                        reason: format!("restore failed but database recovered: {err}"),
                    }),
                    Err(recovery_err) => Err(Error::RestoreFailed {
                        reason: format!(
                            "restore failed and recovery failed: {recovery_err} \
                             (original: {err}); temporary backup kept at {}",
                            recovery.display()
                        ),
                    }),
                }
            }
        }
    }

    /// Remove backups older than the given age. Returns how many were
    /// removed.
    pub fn cleanup_older_than(&self, max_age: Duration) -> Result<usize, Error> {
        let cutoff = Utc::now() - chrono::Duration::seconds(max_age.as_secs() as i64);
        let mut removed = 0;
        for backup in self.list()? {
            if backup.created_at < cutoff {
                info!(path = %backup.path.display(), "removing old backup");
                if let Err(err) = remove_artifact(&backup.path) {
                    warn!(path = %backup.path.display(), error = %err, "failed to remove backup");
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Size of a backup artifact in bytes.
    pub fn backup_size(path: &Path) -> Result<u64, Error> {
        let meta = fs::metadata(path)?;
        if meta.is_dir() {
            store_size(path)
        } else {
            Ok(meta.len())
        }
    }

    fn db_name(&self) -> OsString {
        self.db_path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| OsString::from("db"))
    }

    /// All backup artifacts for this database, metadata sidecars excluded.
    fn backup_artifacts(&self) -> Result<Vec<PathBuf>, Error> {
        let parent = self.db_path.parent().unwrap_or_else(|| Path::new("."));
        let prefix = format!("{}.backup_", self.db_name().to_string_lossy());

        let entries = match fs::read_dir(parent) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && !name.ends_with(".metadata") {
                artifacts.push(entry.path());
            }
        }
        Ok(artifacts)
    }

    /// Uncompressed backup: checkpoint straight into the backup directory.
    fn create_directory(&self, db: &sled::Db, backup_path: &Path) -> Result<u64, Error> {
        if let Err(err) = checkpoint(db, backup_path) {
            let _ = fs::remove_dir_all(backup_path);
            return Err(Error::BackupFailed {
                reason: format!("failed to create checkpoint: {err}"),
            });
        }
        Self::backup_size(backup_path)
    }

    /// Compressed backup: checkpoint into a temporary directory, then
    /// stream it into a `.tar.gz` archive.
    fn create_compressed(&self, db: &sled::Db, backup_path: &Path) -> Result<u64, Error> {
        let temp = PathBuf::from(format!("{}.tmp_checkpoint", backup_path.display()));
        let _ = fs::remove_dir_all(&temp);

        if let Err(err) = checkpoint(db, &temp) {
            let _ = fs::remove_dir_all(&temp);
            return Err(Error::BackupFailed {
                reason: format!("failed to create checkpoint: {err}"),
            });
        }

        let result = self.compress_checkpoint(&temp, backup_path);
        let _ = fs::remove_dir_all(&temp);

        result.map_err(|err| {
            let _ = fs::remove_file(backup_path);
            Error::BackupFailed {
                reason: format!("failed to compress checkpoint: {err}"),
            }
        })
    }

    fn compress_checkpoint(&self, checkpoint_dir: &Path, out: &Path) -> Result<u64, Error> {
        let file = fs::File::create(out)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        // Root every entry under the database basename so that extraction
        // reproduces the original layout.
        let root = PathBuf::from(self.db_name());
        let mut files = Vec::new();
        walk_files(checkpoint_dir, &mut files)?;
        for path in files {
            let rel = path
                .strip_prefix(checkpoint_dir)
                .map_err(|err| Error::BackupFailed {
                    reason: err.to_string(),
                })?;
            builder.append_path_with_name(&path, root.join(rel))?;
        }

        let encoder = builder.into_inner()?;
        encoder.finish()?;

        Ok(fs::metadata(out)?.len())
    }

    fn extract_archive(&self, archive_path: &Path) -> Result<(), Error> {
        fs::create_dir_all(&self.db_path)?;
        let file = fs::File::open(archive_path)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));

        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_path = entry.path()?.into_owned();
            // Entries are rooted under the database basename; strip it.
            let rel: PathBuf = entry_path.components().skip(1).collect();
            if rel.as_os_str().is_empty() {
                continue;
            }
            let target = self.db_path.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&target)?;
        }
        Ok(())
    }

    /// Keep only the newest `max_backups` artifacts, by modification time.
    fn prune_excess(&self) -> Result<(), Error> {
        if self.options.max_backups == 0 {
            return Ok(());
        }

        let mut artifacts: Vec<(PathBuf, SystemTime)> = Vec::new();
        for path in self.backup_artifacts()? {
            let modified = fs::metadata(&path)?.modified()?;
            artifacts.push((path, modified));
        }

        artifacts.sort_by(|a, b| b.1.cmp(&a.1));

        for (path, _) in artifacts.into_iter().skip(self.options.max_backups) {
            info!(path = %path.display(), "removing old backup");
            if let Err(err) = remove_artifact(&path) {
                warn!(path = %path.display(), error = %err, "failed to remove backup");
            }
        }
        Ok(())
    }
}

/// Remove a backup artifact and, for archives, its metadata sidecar.
fn remove_artifact(path: &Path) -> Result<(), Error> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
        let sidecar = metadata_path(path);
        if sidecar.exists() {
            fs::remove_file(sidecar)?;
        }
    }
    Ok(())
}

/// Recursively copy a directory tree. Returns the number of bytes copied.
fn copy_dir(src: &Path, dst: &Path) -> Result<u64, Error> {
    fs::create_dir_all(dst)?;
    let mut total = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            total += copy_dir(&entry.path(), &target)?;
        } else {
            total += fs::copy(entry.path(), &target)?;
        }
    }
    Ok(total)
}

/// Collect every file under `dir`, depth-first.
fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), Error> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            walk_files(&entry.path(), out)?;
        } else {
            out.push(entry.path());
        }
    }
    Ok(())
}
