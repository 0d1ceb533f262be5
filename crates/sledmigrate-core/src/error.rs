//! Core error types.

use thiserror::Error;

use crate::catalog::Status;

/// Opaque error type returned by user-supplied migration callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the migration engine and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// A migration ID does not follow the `<timestamp>_<description>` format.
    #[error("invalid migration ID '{id}': {reason}")]
    InvalidMigrationId {
        /// The offending ID.
        id: String,
        /// Why the ID was rejected.
        reason: String,
    },

    /// A migration with the same ID is already registered.
    #[error("migration with ID '{id}' already registered")]
    DuplicateMigration {
        /// The duplicated ID.
        id: String,
    },

    /// A migration is missing a required callback.
    #[error("migration '{id}' must have an {callback} function")]
    MissingCallback {
        /// The migration ID.
        id: String,
        /// Which callback is missing (`up` or `down`).
        callback: &'static str,
    },

    /// A migration was requested that is not in the registry.
    #[error("migration '{id}' not found")]
    MigrationNotFound {
        /// The unknown ID.
        id: String,
    },

    /// A declared dependency is neither applied nor registered.
    #[error("migration '{id}' depends on non-existent migration '{dependency}'")]
    DanglingDependency {
        /// The migration declaring the dependency.
        id: String,
        /// The missing dependency ID.
        dependency: String,
    },

    /// The dependency graph over the pending set contains a cycle.
    #[error("circular dependency detected involving migrations: {involved:?}")]
    Cycle {
        /// Migrations with residual unmet dependencies.
        involved: Vec<String>,
    },

    /// The catalog reports a failed migration that was never resolved.
    #[error("database is in dirty state, manual intervention required")]
    DirtyState,

    /// The catalog reports a migration in progress.
    #[error("migration is currently in progress")]
    MigratingState,

    /// The catalog reports a rollback in progress.
    #[error("rollback is currently in progress")]
    RollbackState,

    /// The catalog record violates its own invariants.
    #[error("inconsistent migration catalog: {message}")]
    InconsistentCatalog {
        /// Description of the violated invariant.
        message: String,
    },

    /// A user callback (`up`, `down`, or `validate`) returned an error.
    #[error("migration '{id}' failed")]
    MigrationFailed {
        /// The migration whose callback failed.
        id: String,
        /// The callback error.
        #[source]
        source: BoxError,
    },

    /// An execution plan cannot be driven by the engine.
    #[error("invalid execution plan: {reason}")]
    InvalidPlan {
        /// Why the plan was rejected.
        reason: String,
    },

    /// Backup creation failed before the migration touched any state.
    #[error("failed to create backup: {reason}")]
    BackupFailed {
        /// Why the backup could not be created.
        reason: String,
    },

    /// Restoring from a backup failed. When the live store could not be
    /// recovered from the temporary safety copy either, `reason` carries
    /// both errors.
    #[error("restore failed: {reason}")]
    RestoreFailed {
        /// Why the restore failed.
        reason: String,
    },

    /// The database is not clean and startup cannot continue automatically.
    #[error(
        "database is in '{status}' state - manual intervention required. \
         Run '{cli} status' to check and resolve issues"
    )]
    UncleanState {
        /// The catalog status blocking startup.
        status: Status,
        /// CLI name used in operator guidance.
        cli: String,
    },

    /// Migrations are pending but the startup options forbid running them.
    #[error(
        "database has {count} pending migrations. Run migrations using \
         '{cli} up' or restart with migrations enabled"
    )]
    PendingMigrations {
        /// Number of pending migrations.
        count: usize,
        /// CLI name used in operator guidance.
        cli: String,
    },

    /// An interrupted migration cannot be retried automatically.
    #[error(
        "database is in 'migrating' state - migration '{id}' ({description}) was \
         interrupted. This migration is not marked as rerunnable and requires \
         manual intervention. Options:\n\
         \x20 1. Run '{cli} validate' to check if the migration completed successfully\n\
         \x20 2. Run '{cli} force-clean' to force reset (use with caution)\n\
         \x20 3. Restore from backup if available"
    )]
    NotRerunnable {
        /// The interrupted migration.
        id: String,
        /// Its description.
        description: String,
        /// CLI name used in operator guidance.
        cli: String,
    },

    /// Not enough free disk space to run migrations safely.
    #[error(
        "insufficient disk space for migration: {required} bytes required \
         ({db_size} bytes database x {multiplier}), only {available} bytes available"
    )]
    InsufficientDiskSpace {
        /// Required free space in bytes.
        required: u64,
        /// Available free space in bytes.
        available: u64,
        /// Current database size in bytes.
        db_size: u64,
        /// The configured size multiplier.
        multiplier: f64,
    },

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Catalog (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
