//! Command implementations.

use std::error::Error;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use sledmigrate_core::{
    format_version_as_time, open_store, BackupManager, BackupOptions, CatalogStore, ExecutionPlan,
    MigrationEngine, PlanKind, Planner, Registry, Status, StoreConfig,
};

use crate::{migrations, BackupAction, Cli, Command};

type CliResult = Result<(), Box<dyn Error>>;

/// Dispatch the parsed command line.
pub fn run(cli: Cli) -> CliResult {
    let registry = build_registry()?;

    match &cli.command {
        Command::Status => status(&cli, &registry),
        Command::Up {
            target_version,
            no_backup,
            yes,
        } => up(&cli, &registry, *target_version, *no_backup, *yes),
        Command::Down {
            target_version,
            no_backup,
            yes,
        } => down(&cli, &registry, *target_version, *no_backup, *yes),
        Command::Rerun { id, yes } => rerun(&cli, &registry, id, *yes),
        Command::Validate => validate(&cli),
        Command::History => history(&cli),
        Command::Backup { action } => match action {
            BackupAction::Create {
                description,
                no_compress,
            } => backup_create(&cli, description, *no_compress),
            BackupAction::List => backup_list(&cli),
            BackupAction::Restore { path, yes } => backup_restore(&cli, path, *yes),
            BackupAction::Cleanup { older_than_hours } => backup_cleanup(&cli, *older_than_hours),
        },
        Command::ForceClean { yes } => force_clean(&cli, *yes),
        Command::Repair => repair(&cli, &registry),
    }
}

fn build_registry() -> Result<Registry, Box<dyn Error>> {
    let mut registry = Registry::new();
    for migration in migrations::all() {
        registry.register(migration)?;
    }
    Ok(registry)
}

fn open_db(cli: &Cli) -> Result<sled::Db, Box<dyn Error>> {
    Ok(open_store(&StoreConfig::new(&cli.database))?)
}

fn status(cli: &Cli, registry: &Registry) -> CliResult {
    let db = open_db(cli)?;
    let catalog = CatalogStore::new(db);
    let schema = catalog.get()?;

    println!("=== Migration Status ===");
    println!(
        "Current version: {} ({})",
        schema.current_version,
        format_version_as_time(schema.current_version)
    );
    println!("Status: {}", schema.status);
    println!("Applied migrations: {}", schema.applied_migrations.len());
    if let Some(at) = schema.last_migration_at {
        println!("Last migration at: {}", at.to_rfc3339());
    }

    let pending = registry.pending(&schema.applied_migrations)?;
    println!("Pending migrations: {}", pending.len());
    for m in &pending {
        println!("  {} (v{}) - {}", m.id, m.version, m.description);
    }

    if schema.status != Status::Clean {
        print_warning("Database is not clean; run 'validate' for details\n");
    }
    Ok(())
}

fn up(
    cli: &Cli,
    registry: &Registry,
    target_version: Option<i64>,
    no_backup: bool,
    yes: bool,
) -> CliResult {
    let db = open_db(cli)?;
    let catalog = CatalogStore::new(db.clone());
    let planner = Planner::new(registry, &catalog);

    if !cli.dry_run {
        catalog.validate()?;
    }

    let plan = match target_version {
        Some(version) => planner.plan_upgrade_to(version)?,
        None => planner.plan_upgrade()?,
    };

    if plan.is_empty() {
        print_success("Database is already up to date!\n");
        return Ok(());
    }

    display_plan(&plan, cli.dry_run);

    if !cli.dry_run && !yes && !confirm("Do you want to proceed with this migration?") {
        print_info("Migration cancelled.\n");
        return Ok(());
    }

    let mut engine = MigrationEngine::new(db, &cli.database);
    engine.set_dry_run(cli.dry_run);
    engine.set_verbose(cli.verbose);
    if no_backup {
        engine.set_backup_enabled(false);
        if cli.verbose {
            print_info("Backup creation disabled by --no-backup flag\n");
        }
    }

    engine.execute(&plan, progress_printer(cli.verbose))?;

    if cli.dry_run {
        print_success("Dry run completed successfully. No changes were made.\n");
    } else {
        print_success("Migration completed successfully!\n");
        print_info(&format!("Database is now at version {}\n", plan.target_version));
    }
    Ok(())
}

fn down(
    cli: &Cli,
    registry: &Registry,
    target_version: i64,
    no_backup: bool,
    yes: bool,
) -> CliResult {
    let db = open_db(cli)?;
    let catalog = CatalogStore::new(db.clone());
    let planner = Planner::new(registry, &catalog);

    if !cli.dry_run {
        catalog.validate()?;
    }

    let plan = planner.plan_downgrade(target_version)?;
    if plan.is_empty() {
        print_success("Database is already at or below the target version.\n");
        return Ok(());
    }

    display_plan(&plan, cli.dry_run);

    if !cli.dry_run {
        print_warning("Rolling back migrations may lose data.\n");
        if !yes && !confirm("Do you want to proceed with this rollback?") {
            print_info("Rollback cancelled.\n");
            return Ok(());
        }
    }

    let mut engine = MigrationEngine::new(db, &cli.database);
    engine.set_dry_run(cli.dry_run);
    engine.set_verbose(cli.verbose);
    if no_backup {
        engine.set_backup_enabled(false);
    }

    engine.execute(&plan, progress_printer(cli.verbose))?;

    if cli.dry_run {
        print_success("Dry run completed successfully. No changes were made.\n");
    } else {
        print_success("Rollback completed successfully!\n");
        print_info(&format!("Database is now at version {}\n", plan.target_version));
    }
    Ok(())
}

fn rerun(cli: &Cli, registry: &Registry, id: &str, yes: bool) -> CliResult {
    let db = open_db(cli)?;
    let catalog = CatalogStore::new(db.clone());
    let planner = Planner::new(registry, &catalog);

    if !cli.dry_run {
        catalog.validate()?;
    }

    let plan = planner.plan_rerun(id)?;
    display_plan(&plan, cli.dry_run);

    if !cli.dry_run && !yes && !confirm("Do you want to rerun this migration?") {
        print_info("Rerun cancelled.\n");
        return Ok(());
    }

    let mut engine = MigrationEngine::new(db, &cli.database);
    engine.set_dry_run(cli.dry_run);
    engine.set_verbose(cli.verbose);

    engine.execute(&plan, progress_printer(cli.verbose))?;

    if cli.dry_run {
        print_success("Dry run completed successfully. No changes were made.\n");
    } else {
        print_success(&format!("Migration {id} rerun successfully!\n"));
    }
    Ok(())
}

fn validate(cli: &Cli) -> CliResult {
    let db = open_db(cli)?;
    let catalog = CatalogStore::new(db);

    match catalog.validate() {
        Ok(()) => {
            print_success("Migration catalog is consistent.\n");
            Ok(())
        }
        Err(err) => {
            print_error(&format!("Validation failed: {err}\n"));
            print_info("Run 'repair' to fix missing history records, or 'force-clean' to reset the status.\n");
            Err(err.into())
        }
    }
}

fn history(cli: &Cli) -> CliResult {
    let db = open_db(cli)?;
    let catalog = CatalogStore::new(db);
    let records = catalog.history()?;

    if records.is_empty() {
        print_info("No migration history.\n");
        return Ok(());
    }

    println!("=== Migration History ===");
    for record in records {
        let marker = if record.success { "✓" } else { "✗" };
        println!(
            "{marker} {} [{}] {} ({})",
            record.applied_at.format("%Y-%m-%d %H:%M:%S"),
            record.id,
            record.description,
            record.duration,
        );
        if let Some(error) = &record.error {
            println!("    error: {error}");
        }
    }
    Ok(())
}

fn backup_create(cli: &Cli, description: &str, no_compress: bool) -> CliResult {
    let db = open_db(cli)?;

    let manager = BackupManager::with_options(
        &cli.database,
        BackupOptions {
            compress: !no_compress,
            ..Default::default()
        },
    );

    let info = manager.create(&db, description)?;
    print_success(&format!(
        "Backup created: {} ({:.2} MB)\n",
        info.path.display(),
        info.size as f64 / 1024.0 / 1024.0
    ));
    Ok(())
}

fn backup_list(cli: &Cli) -> CliResult {
    let manager = BackupManager::new(&cli.database);
    let backups = manager.list()?;

    if backups.is_empty() {
        print_info("No backups found.\n");
        return Ok(());
    }

    println!("=== Available Backups ===");
    for backup in backups {
        println!(
            "{}\n  created: {}  version: {}  size: {:.2} MB\n  {}",
            backup.path.display(),
            backup.created_at.format("%Y-%m-%d %H:%M:%S"),
            backup.version,
            backup.size as f64 / 1024.0 / 1024.0,
            backup.description,
        );
    }
    Ok(())
}

fn backup_restore(cli: &Cli, path: &Path, yes: bool) -> CliResult {
    print_warning("Restoring will replace the current database contents.\n");
    if !yes && !confirm("Do you want to restore from this backup?") {
        print_info("Restore cancelled.\n");
        return Ok(());
    }

    // The database must not be open while its directory is replaced.
    let manager = BackupManager::new(&cli.database);
    manager.restore(path)?;
    print_success("Database restored successfully from backup.\n");
    Ok(())
}

fn backup_cleanup(cli: &Cli, older_than_hours: u64) -> CliResult {
    let manager = BackupManager::new(&cli.database);
    let removed = manager.cleanup_older_than(Duration::from_secs(older_than_hours * 3600))?;

    if removed > 0 {
        print_success(&format!("Removed {removed} old backup(s).\n"));
    } else {
        print_info("No old backups to remove.\n");
    }
    Ok(())
}

fn force_clean(cli: &Cli, yes: bool) -> CliResult {
    print_warning(
        "force-clean only resets the status flag; it does not verify that the \
         last migration actually completed.\n",
    );
    if !yes && !confirm("Do you want to force the status to clean?") {
        print_info("Cancelled.\n");
        return Ok(());
    }

    let db = open_db(cli)?;
    CatalogStore::new(db).force_clean()?;
    print_success("Catalog status forced to clean.\n");
    Ok(())
}

fn repair(cli: &Cli, registry: &Registry) -> CliResult {
    let db = open_db(cli)?;
    let catalog = CatalogStore::new(db);

    let repaired = catalog.repair_missing_history(registry)?;
    if repaired.is_empty() {
        print_info("Nothing to repair.\n");
    } else {
        print_success(&format!("Repaired {} history record(s):\n", repaired.len()));
        for id in repaired {
            println!("  {id}");
        }
    }
    Ok(())
}

fn display_plan(plan: &ExecutionPlan, dry_run: bool) {
    let prefix = if dry_run { "[DRY RUN] " } else { "" };
    println!("=== {prefix}Migration Plan ===");
    println!("Current version: {}", plan.current_version);
    println!("Target version: {}", plan.target_version);
    let verb = match plan.kind {
        PlanKind::Upgrade => "apply",
        PlanKind::Downgrade => "roll back",
        PlanKind::Rerun => "rerun",
    };
    println!("Migrations to {verb}: {}", plan.migrations.len());
    println!();
    for (i, m) in plan.migrations.iter().enumerate() {
        println!("  {}. {} (v{}) - {}", i + 1, m.id, m.version, m.description);
    }
    println!();
}

fn progress_printer(verbose: bool) -> impl FnMut(&str) {
    move |message: &str| {
        if verbose || message.starts_with("DRY RUN") || message.starts_with("Backup created") {
            println!("[PROGRESS] {message}");
        }
    }
}

fn confirm(message: &str) -> bool {
    print!("{message} (y/N): ");
    io::stdout().flush().ok();

    let mut response = String::new();
    if io::stdin().read_line(&mut response).is_err() {
        return false;
    }
    matches!(response.trim(), "y" | "Y" | "yes" | "Yes")
}

fn print_success(message: &str) {
    print!("✓ {message}");
}

fn print_warning(message: &str) {
    print!("⚠ {message}");
}

fn print_error(message: &str) {
    print!("✗ {message}");
}

fn print_info(message: &str) {
    print!("ℹ {message}");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_for(database: &Path) -> Cli {
        Cli {
            database: database.to_path_buf(),
            verbose: false,
            dry_run: false,
            command: Command::Status,
        }
    }

    #[test]
    fn test_build_registry_accepts_declared_migrations() {
        let registry = build_registry().unwrap();
        assert_eq!(registry.len(), migrations::all().len());
    }

    #[test]
    fn test_open_db_creates_database_directory() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("db");

        let db = open_db(&cli_for(&db_path)).unwrap();
        db.insert(b"k", b"v").unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn test_status_runs_against_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        let cli = cli_for(&dir.path().join("db"));
        let registry = build_registry().unwrap();

        status(&cli, &registry).unwrap();
    }
}
