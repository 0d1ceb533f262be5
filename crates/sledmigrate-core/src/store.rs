//! Store access helpers.
//!
//! The engine only consumes a narrow slice of sled: point reads and writes on
//! the default tree, an emptiness probe, and a consistent-checkpoint
//! primitive. Everything else about the store belongs to the application.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Reserved key holding the schema-version catalog record.
pub const SCHEMA_VERSION_KEY: &[u8] = b"__schema_version__";

/// Reserved key prefix for internal migration bookkeeping. User migrations
/// must not write keys under this prefix.
pub const MIGRATION_PREFIX: &[u8] = b"__migration_";

/// Name of sled's default tree, excluded from named-tree scans.
const DEFAULT_TREE_NAME: &[u8] = b"__sled__default";

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the database directory.
    pub path: PathBuf,

    /// Page cache capacity in bytes.
    pub cache_capacity: u64,

    /// Flush interval in milliseconds. None means flush on every write.
    pub flush_every_ms: Option<u64>,

    /// Enable zstd compression.
    pub compression: bool,

    /// Temporary database (deleted on drop).
    pub temporary: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
            cache_capacity: 256 * 1024 * 1024,
            flush_every_ms: Some(1000),
            compression: false,
            temporary: false,
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create a temporary configuration for testing.
    pub fn temporary() -> Self {
        Self {
            path: PathBuf::from(""),
            temporary: true,
            ..Default::default()
        }
    }

    /// Set the cache capacity.
    pub fn cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Set the flush interval.
    pub fn flush_every_ms(mut self, ms: Option<u64>) -> Self {
        self.flush_every_ms = ms;
        self
    }

    /// Enable or disable compression.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    fn to_sled_config(&self) -> sled::Config {
        let mut config = sled::Config::new()
            .cache_capacity(self.cache_capacity)
            .use_compression(self.compression);

        if self.temporary {
            config = config.temporary(true);
        } else {
            config = config.path(&self.path);
        }

        if let Some(ms) = self.flush_every_ms {
            config = config.flush_every_ms(Some(ms));
        }

        config
    }
}

/// Open (or create) a store with the given configuration.
pub fn open_store(config: &StoreConfig) -> Result<sled::Db, Error> {
    Ok(config.to_sled_config().open()?)
}

/// Produce a crash-consistent snapshot of `db` at `target`, readable as an
/// ordinary sled directory.
///
/// The snapshot is taken through sled's export/import mechanism rather than
/// by copying live files, which are not safe to read while the store is
/// being written.
pub fn checkpoint(db: &sled::Db, target: &Path) -> Result<(), Error> {
    db.flush()?;
    let snapshot = sled::Config::new().path(target).open()?;
    snapshot.import(db.export());
    snapshot.flush()?;
    Ok(())
}

/// Check whether the store holds any key at all, in any tree.
pub fn is_store_empty(db: &sled::Db) -> Result<bool, Error> {
    if !db.is_empty() {
        return Ok(false);
    }
    for name in db.tree_names() {
        if name.as_ref() == DEFAULT_TREE_NAME {
            continue;
        }
        if !db.open_tree(&name)?.is_empty() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Total on-disk size of the store directory in bytes.
pub fn store_size(path: &Path) -> Result<u64, Error> {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}
