//! Plan execution.
//!
//! The engine drives an [`ExecutionPlan`] strictly sequentially. Because
//! user callbacks are arbitrary non-transactional code, the catalog is
//! committed after each successful migration individually: after any crash
//! the catalog truthfully reflects the set of migrations whose `up`
//! returned success, except that a crash during a callback leaves
//! `status=migrating` behind for the startup recovery path.

use std::time::Instant;

use tracing::{debug, info};

use crate::backup::BackupManager;
use crate::catalog::CatalogStore;
use crate::error::Error;
use crate::planner::{ExecutionPlan, PlanKind};
use crate::registry::{format_version_as_time, Migration};

/// Executes migration plans against an open database.
pub struct MigrationEngine {
    db: sled::Db,
    catalog: CatalogStore,
    backup: Option<BackupManager>,
    dry_run: bool,
    verbose: bool,
    backup_enabled: bool,
}

impl MigrationEngine {
    /// Create an engine with backup support rooted at the database path.
    pub fn new(db: sled::Db, db_path: impl Into<std::path::PathBuf>) -> Self {
        let catalog = CatalogStore::new(db.clone());
        Self {
            db,
            catalog,
            backup: Some(BackupManager::new(db_path)),
            dry_run: false,
            verbose: false,
            backup_enabled: true,
        }
    }

    /// Create an engine without any backup manager.
    pub fn without_backup(db: sled::Db) -> Self {
        let catalog = CatalogStore::new(db.clone());
        Self {
            db,
            catalog,
            backup: None,
            dry_run: false,
            verbose: false,
            backup_enabled: false,
        }
    }

    /// Simulate only: no backups, no callbacks, no catalog writes.
    pub fn set_dry_run(&mut self, enabled: bool) {
        self.dry_run = enabled;
    }

    /// Emit per-migration timing on the progress stream.
    pub fn set_verbose(&mut self, enabled: bool) {
        self.verbose = enabled;
    }

    /// Enable or disable backup creation before execution.
    pub fn set_backup_enabled(&mut self, enabled: bool) {
        self.backup_enabled = enabled;
    }

    /// Replace the backup manager.
    pub fn set_backup_manager(&mut self, manager: BackupManager) {
        self.backup = Some(manager);
    }

    /// Execute a plan, reporting progress through the callback.
    pub fn execute(
        &self,
        plan: &ExecutionPlan,
        mut progress: impl FnMut(&str),
    ) -> Result<(), Error> {
        match plan.kind {
            PlanKind::Upgrade => self.execute_upgrade(plan, &mut progress),
            PlanKind::Downgrade => self.execute_downgrade(plan, &mut progress),
            PlanKind::Rerun => self.execute_rerun(plan, &mut progress),
        }
    }

    fn execute_upgrade(
        &self,
        plan: &ExecutionPlan,
        progress: &mut dyn FnMut(&str),
    ) -> Result<(), Error> {
        progress("Starting upgrade...");

        if self.dry_run {
            return self.simulate_upgrade(plan, progress);
        }
        if plan.is_empty() {
            progress("Nothing to do, database is up to date");
            return Ok(());
        }

        self.create_backup_if_enabled(
            progress,
            &format!(
                "Before upgrade to version {} ({} migrations)",
                plan.target_version,
                plan.migrations.len()
            ),
        )?;

        self.catalog.validate()?;
        self.catalog.mark_migration_started()?;

        for (index, migration) in plan.migrations.iter().enumerate() {
            progress(&format!(
                "Executing migration {}/{}: {}",
                index + 1,
                plan.migrations.len(),
                migration.id
            ));

            let start = Instant::now();
            self.run_or_mark_failed(migration, true, &migration.id, &migration.description)?;
            let duration = start.elapsed();

            self.catalog.update_after_migration(
                &migration.id,
                migration.version,
                &migration.description,
                duration,
            )?;
            info!(migration = %migration.id, ?duration, "migration applied");

            if self.verbose {
                progress(&format!(
                    "Migration {} completed in {:?}",
                    migration.id, duration
                ));
            }
        }

        progress("Upgrade completed successfully");
        Ok(())
    }

    fn execute_downgrade(
        &self,
        plan: &ExecutionPlan,
        progress: &mut dyn FnMut(&str),
    ) -> Result<(), Error> {
        progress("Starting downgrade...");

        if self.dry_run {
            return self.simulate_downgrade(plan, progress);
        }
        if plan.is_empty() {
            progress("Nothing to do, database is already at or below the target version");
            return Ok(());
        }

        self.create_backup_if_enabled(
            progress,
            &format!(
                "Before rollback to version {} ({} rollbacks)",
                plan.target_version,
                plan.migrations.len()
            ),
        )?;

        self.catalog.validate()?;
        self.catalog.mark_rollback_started()?;

        for (index, migration) in plan.migrations.iter().enumerate() {
            progress(&format!(
                "Rolling back migration {}/{}: {}",
                index + 1,
                plan.migrations.len(),
                migration.id
            ));

            let start = Instant::now();
            self.run_or_mark_failed(
                migration,
                false,
                &format!("{}_rollback", migration.id),
                &format!("Rollback: {}", migration.description),
            )?;
            let duration = start.elapsed();

            self.catalog
                .update_after_rollback(&migration.id, &migration.description)?;
            info!(migration = %migration.id, ?duration, "migration rolled back");

            if self.verbose {
                progress(&format!(
                    "Rollback of {} completed in {:?}",
                    migration.id, duration
                ));
            }
        }

        progress("Downgrade completed successfully");
        Ok(())
    }

    fn execute_rerun(
        &self,
        plan: &ExecutionPlan,
        progress: &mut dyn FnMut(&str),
    ) -> Result<(), Error> {
        if plan.migrations.len() != 1 {
            return Err(Error::InvalidPlan {
                reason: format!(
                    "rerun plan must contain exactly one migration, got {}",
                    plan.migrations.len()
                ),
            });
        }
        let migration = &plan.migrations[0];
        progress(&format!("Rerunning migration: {}", migration.id));

        if self.dry_run {
            return self.simulate_rerun(plan, progress);
        }

        self.create_backup_if_enabled(
            progress,
            &format!("Before rerun of migration {}", migration.id),
        )?;

        self.catalog.validate()?;
        self.catalog.mark_migration_started()?;

        progress(&format!("Rolling back migration: {}", migration.id));
        self.run_or_mark_failed(
            migration,
            false,
            &format!("{}_rerun_rollback", migration.id),
            &format!("Rerun Rollback: {}", migration.description),
        )?;

        progress(&format!("Re-applying migration: {}", migration.id));
        let start = Instant::now();
        self.run_or_mark_failed(
            migration,
            true,
            &format!("{}_rerun", migration.id),
            &format!("Rerun: {}", migration.description),
        )?;
        let duration = start.elapsed();

        // The version stays where it is; only the history and applied set
        // record the rerun.
        self.catalog.update_after_migration(
            &format!("{}_rerun", migration.id),
            migration.version,
            &format!("Rerun: {}", migration.description),
            duration,
        )?;

        progress(&format!(
            "Rerun of migration {} completed successfully",
            migration.id
        ));
        Ok(())
    }

    /// Run one callback direction; on failure, mark the catalog dirty under
    /// `record_id` before propagating.
    fn run_or_mark_failed(
        &self,
        migration: &Migration,
        forward: bool,
        record_id: &str,
        record_description: &str,
    ) -> Result<(), Error> {
        if let Err(err) = migration.run(&self.db, forward) {
            let cause = error_chain(&err);
            if let Err(mark_err) =
                self.catalog
                    .mark_migration_failed(record_id, record_description, &cause)
            {
                tracing::error!(
                    migration = %migration.id,
                    error = %cause,
                    "migration failed and the failure could not be recorded"
                );
                return Err(mark_err);
            }
            return Err(err);
        }
        Ok(())
    }

    fn create_backup_if_enabled(
        &self,
        progress: &mut dyn FnMut(&str),
        description: &str,
    ) -> Result<(), Error> {
        if !self.backup_enabled {
            return Ok(());
        }
        let Some(manager) = &self.backup else {
            return Ok(());
        };

        progress("Creating database backup before migration...");
        let info = manager
            .create(&self.db, description)
            .map_err(|err| match err {
                Error::BackupFailed { .. } => err,
                other => Error::BackupFailed {
                    reason: other.to_string(),
                },
            })?;
        progress(&format!("Backup created: {}", info.path.display()));
        Ok(())
    }

    fn simulate_upgrade(
        &self,
        plan: &ExecutionPlan,
        progress: &mut dyn FnMut(&str),
    ) -> Result<(), Error> {
        progress("DRY RUN: Simulating upgrade...");
        for (index, migration) in plan.migrations.iter().enumerate() {
            progress(&format!(
                "DRY RUN: Would execute migration {}/{}: {}",
                index + 1,
                plan.migrations.len(),
                migration.id
            ));
            progress(&format!("  Description: {}", migration.description));
            progress(&format!(
                "  Version: {} ({})",
                migration.version,
                format_version_as_time(migration.version)
            ));
        }
        progress(&format!(
            "DRY RUN: Would upgrade from version {} to {}",
            plan.current_version, plan.target_version
        ));
        Ok(())
    }

    fn simulate_downgrade(
        &self,
        plan: &ExecutionPlan,
        progress: &mut dyn FnMut(&str),
    ) -> Result<(), Error> {
        progress("DRY RUN: Simulating downgrade...");
        for (index, migration) in plan.migrations.iter().enumerate() {
            progress(&format!(
                "DRY RUN: Would rollback migration {}/{}: {}",
                index + 1,
                plan.migrations.len(),
                migration.id
            ));
            progress(&format!("  Description: {}", migration.description));
            progress(&format!(
                "  Version: {} ({})",
                migration.version,
                format_version_as_time(migration.version)
            ));
        }
        progress(&format!(
            "DRY RUN: Would downgrade from version {} to {}",
            plan.current_version, plan.target_version
        ));
        Ok(())
    }

    fn simulate_rerun(
        &self,
        plan: &ExecutionPlan,
        progress: &mut dyn FnMut(&str),
    ) -> Result<(), Error> {
        let migration = &plan.migrations[0];
        progress("DRY RUN: Simulating rerun...");
        progress(&format!("DRY RUN: Would rollback migration: {}", migration.id));
        progress(&format!("DRY RUN: Would re-apply migration: {}", migration.id));
        progress(&format!("  Description: {}", migration.description));
        progress(&format!(
            "  Version: {} (unchanged) - {}",
            migration.version,
            format_version_as_time(migration.version)
        ));
        debug!(migration = %migration.id, "dry-run rerun simulated");
        Ok(())
    }
}

/// Render an error with its immediate cause, for catalog failure records.
fn error_chain(err: &Error) -> String {
    match std::error::Error::source(err) {
        Some(source) => format!("{err}: {source}"),
        None => err.to_string(),
    }
}
