//! Application-boot integration.
//!
//! [`check_and_run`] composes the catalog discriminator, crash recovery,
//! planning, and execution into a single entry point suitable for calling
//! right after the database is opened.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::catalog::{CatalogStore, Status};
use crate::engine::MigrationEngine;
use crate::error::Error;
use crate::planner::Planner;
use crate::registry::Registry;
use crate::store::store_size;

/// Configures migration behavior at application startup.
#[derive(Debug, Clone)]
pub struct StartupOptions {
    /// Execute pending migrations during startup. When false, startup fails
    /// if migrations are needed.
    pub run_migrations: bool,

    /// Create a backup before running migrations. Off by default: taking a
    /// checkpoint and compressing it is CPU intensive.
    pub backup_enabled: bool,

    /// Verify available disk space before running migrations.
    pub check_disk_space: bool,

    /// Required free space = database size x this multiplier.
    pub database_size_multiplier: f64,

    /// CLI name embedded in operator-facing error messages.
    pub cli_name: String,
}

impl Default for StartupOptions {
    fn default() -> Self {
        Self {
            run_migrations: false,
            backup_enabled: false,
            check_disk_space: true,
            database_size_multiplier: 2.0,
            cli_name: "sled-migrate".to_string(),
        }
    }
}

/// Check migration status and optionally run pending migrations.
///
/// On a database left in `migrating` state by a crashed process, recovery is
/// attempted: if the interrupted migration is rerunnable the status is reset
/// and the migration re-executed; otherwise startup fails with operator
/// guidance and the catalog is left untouched for diagnosis.
pub fn check_and_run(
    db: &sled::Db,
    db_path: &Path,
    registry: &Registry,
    opts: &StartupOptions,
) -> Result<(), Error> {
    let catalog = CatalogStore::new(db.clone());
    catalog.initialize_fresh_database(registry)?;

    let planner = Planner::new(registry, &catalog);
    let mut schema = catalog.get()?;

    if schema.status == Status::Migrating {
        attempt_recovery(&catalog, &planner, opts)?;
        schema = catalog.get()?;
    }

    if schema.status != Status::Clean {
        return Err(Error::UncleanState {
            status: schema.status,
            cli: opts.cli_name.clone(),
        });
    }

    let plan = planner.plan_upgrade()?;
    if plan.is_empty() {
        debug!(version = schema.current_version, "database is up to date");
        return Ok(());
    }

    if !opts.run_migrations {
        return Err(Error::PendingMigrations {
            count: plan.migrations.len(),
            cli: opts.cli_name.clone(),
        });
    }

    if opts.check_disk_space {
        check_disk_space(db_path, opts.database_size_multiplier)?;
    }

    info!(
        current = plan.current_version,
        target = plan.target_version,
        count = plan.migrations.len(),
        "running startup migrations"
    );

    let mut engine = MigrationEngine::new(db.clone(), db_path);
    engine.set_backup_enabled(opts.backup_enabled);
    engine.execute(&plan, |message| debug!("{message}"))?;

    info!(version = plan.target_version, "startup migrations completed");
    Ok(())
}

/// Try to recover from an interrupted migration.
fn attempt_recovery(
    catalog: &CatalogStore,
    planner: &Planner<'_>,
    opts: &StartupOptions,
) -> Result<(), Error> {
    let plan = planner.plan_upgrade()?;

    if plan.is_empty() {
        // Status says migrating but nothing is pending: the catalog
        // contradicts itself and an operator has to decide.
        return Err(Error::InconsistentCatalog {
            message: format!(
                "database is in 'migrating' state but no pending migrations found. \
                 Run '{} force-clean' to manually reset state",
                opts.cli_name
            ),
        });
    }

    // The head of the plan is the migration that was interrupted.
    let stuck = &plan.migrations[0];
    if !stuck.rerunnable {
        return Err(Error::NotRerunnable {
            id: stuck.id.clone(),
            description: stuck.description.clone(),
            cli: opts.cli_name.clone(),
        });
    }

    warn!(
        migration = %stuck.id,
        description = %stuck.description,
        "recovering from interrupted migration"
    );

    catalog.force_clean()?;
    info!("migration state reset to clean, will retry migration");
    Ok(())
}

/// Verify there is enough free space for a migration run.
///
/// The probe is best-effort: when the database size or the filesystem
/// statistics cannot be determined, the check is skipped.
fn check_disk_space(db_path: &Path, multiplier: f64) -> Result<(), Error> {
    let db_size = match store_size(db_path) {
        Ok(size) => size,
        Err(err) => {
            debug!(error = %err, "could not calculate database size, skipping space check");
            return Ok(());
        }
    };

    let Some(available) = free_disk_space(db_path) else {
        debug!("disk space check not available on this system");
        return Ok(());
    };

    let required = (db_size as f64 * multiplier) as u64;
    debug!(
        db_size,
        required, available, multiplier, "migration disk space check"
    );

    if available < required {
        return Err(Error::InsufficientDiskSpace {
            required,
            available,
            db_size,
            multiplier,
        });
    }

    Ok(())
}

#[cfg(unix)]
fn free_disk_space(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;

    let path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn free_disk_space(_path: &Path) -> Option<u64> {
    None
}
