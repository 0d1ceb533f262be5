//! Catalog persistence and state transitions.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::record::{MigrationRecord, SchemaVersion, Status};
use crate::error::Error;
use crate::registry::Registry;
use crate::store::{is_store_empty, SCHEMA_VERSION_KEY};

/// Owner of the persisted schema-version record.
///
/// The engine is the only mutator of catalog state; every other component
/// reads through [`CatalogStore::get`].
#[derive(Clone)]
pub struct CatalogStore {
    db: sled::Db,
}

impl CatalogStore {
    /// Create a catalog store over an open database.
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }

    /// Read the schema-version record.
    ///
    /// Returns the zero record when the reserved key is absent. This is not
    /// a write: a brand-new database stays untouched until something is
    /// actually recorded.
    pub fn get(&self) -> Result<SchemaVersion, Error> {
        match self.db.get(SCHEMA_VERSION_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(SchemaVersion::zero()),
        }
    }

    /// Overwrite the schema-version record with a durable write.
    pub fn set(&self, version: &SchemaVersion) -> Result<(), Error> {
        let bytes = serde_json::to_vec(version)?;
        self.db.insert(SCHEMA_VERSION_KEY, bytes)?;
        self.db.flush()?;
        Ok(())
    }

    /// Record a successful migration: append a success record, add the ID to
    /// the applied set, bump `current_version` monotonically, return the
    /// status to clean.
    pub fn update_after_migration(
        &self,
        id: &str,
        version: i64,
        description: &str,
        duration: Duration,
    ) -> Result<(), Error> {
        let mut schema = self.get()?;

        let record = MigrationRecord {
            id: id.to_string(),
            description: description.to_string(),
            applied_at: Utc::now(),
            duration: format!("{duration:?}"),
            success: true,
            error: None,
        };

        schema.applied_migrations.insert(id.to_string(), true);
        schema.last_migration_at = Some(record.applied_at);
        schema.migration_history.push(record);
        schema.status = Status::Clean;
        if version > schema.current_version {
            schema.current_version = version;
        }

        self.set(&schema)
    }

    /// Persist `status=migrating`. No other mutation.
    pub fn mark_migration_started(&self) -> Result<(), Error> {
        let mut schema = self.get()?;
        schema.status = Status::Migrating;
        self.set(&schema)
    }

    /// Persist `status=rollback`. No other mutation.
    pub fn mark_rollback_started(&self) -> Result<(), Error> {
        let mut schema = self.get()?;
        schema.status = Status::Rollback;
        self.set(&schema)
    }

    /// Record a failed migration: append a failure record and set
    /// `status=dirty`. The applied set and version are left untouched; the
    /// dirty marker is the signal that the catalog may be out of sync with
    /// the data.
    pub fn mark_migration_failed(
        &self,
        id: &str,
        description: &str,
        error: &dyn std::fmt::Display,
    ) -> Result<(), Error> {
        let mut schema = self.get()?;

        let record = MigrationRecord {
            id: id.to_string(),
            description: format!("{description} (FAILED)"),
            applied_at: Utc::now(),
            duration: "0s".to_string(),
            success: false,
            error: Some(error.to_string()),
        };

        schema.last_migration_at = Some(record.applied_at);
        schema.migration_history.push(record);
        schema.status = Status::Dirty;

        self.set(&schema)
    }

    /// Record a successful rollback: remove the ID from the applied set,
    /// append a `<id>_rollback` success record, recompute `current_version`
    /// from the remaining applied migrations, return the status to clean.
    pub fn update_after_rollback(
        &self,
        id: &str,
        description: &str,
    ) -> Result<(), Error> {
        let mut schema = self.get()?;

        schema.applied_migrations.remove(id);

        let record = MigrationRecord {
            id: format!("{id}_rollback"),
            description: format!("Rolled back: {description}"),
            applied_at: Utc::now(),
            duration: "0s".to_string(),
            success: true,
            error: None,
        };

        schema.last_migration_at = Some(record.applied_at);
        schema.migration_history.push(record);
        schema.status = Status::Clean;
        schema.current_version = schema.derive_current_version();

        self.set(&schema)
    }

    /// The full migration history.
    pub fn history(&self) -> Result<Vec<MigrationRecord>, Error> {
        Ok(self.get()?.migration_history)
    }

    /// Whether a specific migration has been applied.
    pub fn is_applied(&self, id: &str) -> Result<bool, Error> {
        Ok(self.get()?.is_applied(id))
    }

    /// Overwrite `current_version` without touching anything else.
    pub fn set_current_version(&self, version: i64) -> Result<(), Error> {
        let mut schema = self.get()?;
        schema.current_version = version;
        self.set(&schema)
    }

    /// Check the catalog invariants and refuse progress when the status is
    /// not clean.
    pub fn validate(&self) -> Result<(), Error> {
        let schema = self.get()?;

        match schema.status {
            Status::Dirty => return Err(Error::DirtyState),
            Status::Migrating => return Err(Error::MigratingState),
            Status::Rollback => return Err(Error::RollbackState),
            Status::Clean => {}
        }

        let successful = schema.successful_from_history();

        for id in successful.keys() {
            if !schema.is_applied(id) {
                return Err(Error::InconsistentCatalog {
                    message: format!(
                        "migration {id} appears in history as successful but not marked as applied"
                    ),
                });
            }
        }

        for (id, applied) in &schema.applied_migrations {
            if *applied && !successful.contains_key(id) {
                return Err(Error::InconsistentCatalog {
                    message: format!(
                        "migration {id} marked as applied but no successful record in history"
                    ),
                });
            }
        }

        let derived = schema.derive_current_version();
        if schema.current_version != derived {
            return Err(Error::InconsistentCatalog {
                message: format!(
                    "current_version is {} but the applied set derives {derived}",
                    schema.current_version
                ),
            });
        }

        Ok(())
    }

    /// Force `status=clean` without touching the rest of the record.
    ///
    /// Does not fix missing history records; use
    /// [`CatalogStore::repair_missing_history`] for that.
    pub fn force_clean(&self) -> Result<(), Error> {
        warn!("forcing catalog status to clean");
        let mut schema = self.get()?;
        schema.status = Status::Clean;
        self.set(&schema)
    }

    /// Synthesize success records for applied migrations that lack one, and
    /// return the repaired IDs.
    pub fn repair_missing_history(&self, registry: &Registry) -> Result<Vec<String>, Error> {
        let mut schema = self.get()?;
        let successful = schema.successful_from_history();
        let now = Utc::now();

        let mut repaired = Vec::new();
        for (id, applied) in &schema.applied_migrations {
            if !*applied || successful.contains_key(id) {
                continue;
            }
            let description = registry
                .get(id)
                .map(|m| m.description.clone())
                .unwrap_or_else(|| "unknown migration".to_string());

            schema.migration_history.push(MigrationRecord {
                id: id.clone(),
                description: format!("{description} (repaired - missing history)"),
                applied_at: now,
                duration: "0s".to_string(),
                success: true,
                error: None,
            });
            repaired.push(id.clone());
        }

        if repaired.is_empty() {
            return Ok(repaired);
        }

        schema.status = Status::Clean;
        self.set(&schema)?;
        info!(count = repaired.len(), "repaired missing history records");

        Ok(repaired)
    }

    /// Classify a database without a schema-version record and write its
    /// first one.
    ///
    /// - Record already present: nothing to do.
    /// - Store is completely empty: a fresh database. Every registered
    ///   migration is marked applied (with synthetic history records) and
    ///   `current_version` jumps to the newest registered version, so a
    ///   fresh start never replays history against an empty dataset.
    /// - Store has data but no record: a pre-migration legacy database. The
    ///   zero record is written and every registered migration stays
    ///   pending.
    ///
    /// Runs effectively once per store; the reserved key guards re-entry.
    pub fn initialize_fresh_database(&self, registry: &Registry) -> Result<(), Error> {
        if self.db.get(SCHEMA_VERSION_KEY)?.is_some() {
            return Ok(());
        }

        if !is_store_empty(&self.db)? {
            debug!("pre-migration database detected, starting at version 0");
            return self.set(&SchemaVersion::zero());
        }

        let migrations = registry.all();
        if migrations.is_empty() {
            return self.set(&SchemaVersion::zero());
        }

        let mut schema = SchemaVersion::zero();
        let now = Utc::now();
        for m in migrations {
            schema.applied_migrations.insert(m.id.clone(), true);
            schema.migration_history.push(MigrationRecord {
                id: m.id.clone(),
                description: format!("{} (skipped - fresh database)", m.description),
                applied_at: now,
                duration: "0s".to_string(),
                success: true,
                error: None,
            });
            if m.version > schema.current_version {
                schema.current_version = m.version;
            }
        }

        info!(
            version = schema.current_version,
            migrations = migrations.len(),
            "initialized fresh database at latest version"
        );
        self.set(&schema)
    }
}
