//! End-to-end migration flows against a real store.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sledmigrate_core::{
    BackupManager, BackupOptions, CatalogStore, Error, Migration, MigrationEngine, Planner,
    Registry, Status,
};

fn open_db(path: &Path) -> sled::Db {
    sled::open(path).unwrap()
}

/// A migration whose callbacks write observable state into the store.
fn key_writer(id: &str, key: &'static [u8], value: &'static [u8]) -> Migration {
    Migration::new(id, format!("writes {}", String::from_utf8_lossy(key)))
        .up(move |db| {
            db.insert(key, value)?;
            Ok(())
        })
        .down(move |db| {
            db.remove(key)?;
            Ok(())
        })
        .validate(move |db| {
            if db.get(key)?.is_none() {
                return Err(format!("expected key {:?} to exist", key).into());
            }
            Ok(())
        })
}

#[test]
fn complete_upgrade_and_downgrade_flow() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = open_db(&db_path);

    let mut registry = Registry::new();
    registry
        .register(key_writer("1754917200_users", b"users_initialized", b"true"))
        .unwrap();
    registry
        .register(key_writer("1754917300_orders", b"orders_initialized", b"true"))
        .unwrap();

    let catalog = CatalogStore::new(db.clone());
    let planner = Planner::new(&registry, &catalog);
    let engine = MigrationEngine::without_backup(db.clone());

    // Upgrade applies both migrations and their effects.
    let plan = planner.plan_upgrade().unwrap();
    assert_eq!(plan.estimated_steps, 2);
    engine.execute(&plan, |_| {}).unwrap();

    assert!(db.get(b"users_initialized").unwrap().is_some());
    assert!(db.get(b"orders_initialized").unwrap().is_some());

    let schema = catalog.get().unwrap();
    assert_eq!(schema.current_version, 1_754_917_300);
    assert_eq!(schema.status, Status::Clean);
    catalog.validate().unwrap();

    // Downgrade one step removes only the newest migration.
    let plan = planner.plan_downgrade(1_754_917_200).unwrap();
    assert_eq!(plan.estimated_steps, 1);
    engine.execute(&plan, |_| {}).unwrap();

    assert!(db.get(b"users_initialized").unwrap().is_some());
    assert!(db.get(b"orders_initialized").unwrap().is_none());

    let schema = catalog.get().unwrap();
    assert_eq!(schema.current_version, 1_754_917_200);
    assert!(schema.is_applied("1754917200_users"));
    assert!(!schema.is_applied("1754917300_orders"));
    catalog.validate().unwrap();

    // Downgrade to zero rolls back the rest.
    engine.execute(&planner.plan_downgrade(0).unwrap(), |_| {}).unwrap();
    assert!(db.get(b"users_initialized").unwrap().is_none());
    assert_eq!(catalog.get().unwrap().current_version, 0);
    catalog.validate().unwrap();
}

#[test]
fn upgrade_to_stops_at_target_version() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = open_db(&db_path);

    let mut registry = Registry::new();
    registry
        .register(key_writer("1754917200_users", b"users_initialized", b"true"))
        .unwrap();
    registry
        .register(key_writer("1754917300_orders", b"orders_initialized", b"true"))
        .unwrap();

    let catalog = CatalogStore::new(db.clone());
    let planner = Planner::new(&registry, &catalog);
    let engine = MigrationEngine::without_backup(db.clone());

    engine
        .execute(&planner.plan_upgrade_to(1_754_917_200).unwrap(), |_| {})
        .unwrap();

    assert!(db.get(b"users_initialized").unwrap().is_some());
    assert!(db.get(b"orders_initialized").unwrap().is_none());
    assert_eq!(catalog.get().unwrap().current_version, 1_754_917_200);

    // The rest follows on a full upgrade.
    engine.execute(&planner.plan_upgrade().unwrap(), |_| {}).unwrap();
    assert_eq!(catalog.get().unwrap().current_version, 1_754_917_300);
}

#[test]
fn failed_migration_leaves_earlier_steps_committed() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = open_db(&db_path);

    let mut registry = Registry::new();
    registry
        .register(key_writer("1754917200_users", b"users_initialized", b"true"))
        .unwrap();
    registry
        .register(
            Migration::new("1754917300_broken", "always fails")
                .up(|_| Err("write refused".into()))
                .down(|_| Ok(())),
        )
        .unwrap();

    let catalog = CatalogStore::new(db.clone());
    let planner = Planner::new(&registry, &catalog);
    let engine = MigrationEngine::without_backup(db.clone());

    let err = engine
        .execute(&planner.plan_upgrade().unwrap(), |_| {})
        .unwrap_err();
    assert!(matches!(err, Error::MigrationFailed { .. }));

    // First step committed; the store reflects it.
    assert!(db.get(b"users_initialized").unwrap().is_some());

    let schema = catalog.get().unwrap();
    assert_eq!(schema.status, Status::Dirty);
    assert!(schema.is_applied("1754917200_users"));
    assert!(!schema.is_applied("1754917300_broken"));

    // A dirty database refuses further work until repaired.
    let err = engine
        .execute(&planner.plan_upgrade().unwrap(), |_| {})
        .unwrap_err();
    assert!(matches!(err, Error::DirtyState));

    // force-clean unblocks it.
    catalog.force_clean().unwrap();
    let err = engine
        .execute(&planner.plan_upgrade().unwrap(), |_| {})
        .unwrap_err();
    assert!(matches!(err, Error::MigrationFailed { .. }));
}

#[test]
fn rerun_is_observable_in_store_and_history() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = open_db(&db_path);

    let runs = Arc::new(AtomicUsize::new(0));
    let up_runs = Arc::clone(&runs);

    let mut registry = Registry::new();
    registry
        .register(
            Migration::new("1754917200_counter", "counts executions")
                .up(move |db| {
                    up_runs.fetch_add(1, Ordering::SeqCst);
                    db.insert(b"counted", b"yes")?;
                    Ok(())
                })
                .down(|db| {
                    db.remove(b"counted")?;
                    Ok(())
                })
                .rerunnable(true),
        )
        .unwrap();

    let catalog = CatalogStore::new(db.clone());
    let planner = Planner::new(&registry, &catalog);
    let engine = MigrationEngine::without_backup(db.clone());

    engine.execute(&planner.plan_upgrade().unwrap(), |_| {}).unwrap();
    engine
        .execute(&planner.plan_rerun("1754917200_counter").unwrap(), |_| {})
        .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(db.get(b"counted").unwrap().is_some());

    let schema = catalog.get().unwrap();
    assert_eq!(schema.current_version, 1_754_917_200);
    assert_eq!(
        schema.migration_history.last().unwrap().id,
        "1754917200_counter_rerun"
    );
    catalog.validate().unwrap();
}

#[test]
fn engine_creates_backup_before_migrating() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = open_db(&db_path);

    let mut registry = Registry::new();
    registry
        .register(key_writer("1754917200_users", b"users_initialized", b"true"))
        .unwrap();

    let catalog = CatalogStore::new(db.clone());
    let planner = Planner::new(&registry, &catalog);

    let mut engine = MigrationEngine::new(db.clone(), &db_path);
    engine.set_backup_manager(BackupManager::with_options(
        &db_path,
        BackupOptions {
            compress: false,
            cleanup_old_backups: false,
            max_backups: 0,
        },
    ));

    let mut messages = Vec::new();
    engine
        .execute(&planner.plan_upgrade().unwrap(), |m| {
            messages.push(m.to_string())
        })
        .unwrap();

    // A backup artifact exists and was reported on the progress stream.
    let backups = BackupManager::new(&db_path).list().unwrap();
    assert_eq!(backups.len(), 1);
    assert!(messages.iter().any(|m| m.starts_with("Backup created:")));

    // The backup captures the pre-migration state.
    assert_eq!(backups[0].version, 0);
}

#[test]
fn restore_returns_store_to_pre_migration_state() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");

    let mut registry = Registry::new();
    registry
        .register(key_writer("1754917200_users", b"users_initialized", b"true"))
        .unwrap();

    let manager = BackupManager::with_options(
        &db_path,
        BackupOptions {
            compress: true,
            cleanup_old_backups: false,
            max_backups: 0,
        },
    );

    let backup_path = {
        let db = open_db(&db_path);
        db.insert(b"pre_existing", b"data").unwrap();

        let info = manager.create(&db, "before upgrade").unwrap();

        let catalog = CatalogStore::new(db.clone());
        let planner = Planner::new(&registry, &catalog);
        MigrationEngine::without_backup(db.clone())
            .execute(&planner.plan_upgrade().unwrap(), |_| {})
            .unwrap();
        assert!(db.get(b"users_initialized").unwrap().is_some());

        info.path
    };

    manager.restore(&backup_path).unwrap();

    let db = open_db(&db_path);
    assert_eq!(db.get(b"pre_existing").unwrap().unwrap().as_ref(), b"data");
    // The migration and its catalog entry are gone with the restore.
    assert!(db.get(b"users_initialized").unwrap().is_none());
    assert_eq!(CatalogStore::new(db).get().unwrap().current_version, 0);
}
