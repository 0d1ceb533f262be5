//! Startup recovery behavior for interrupted migrations.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sledmigrate_core::{
    check_and_run, CatalogStore, Error, Migration, Registry, SchemaVersion, StartupOptions, Status,
};

fn open_db(path: &Path) -> sled::Db {
    sled::open(path).unwrap()
}

fn startup_opts() -> StartupOptions {
    StartupOptions {
        run_migrations: true,
        ..Default::default()
    }
}

/// Write a catalog record simulating a process killed mid-migration.
fn simulate_interrupted(catalog: &CatalogStore) {
    let mut schema = SchemaVersion::zero();
    schema.status = Status::Migrating;
    catalog.set(&schema).unwrap();
}

#[test]
fn recovers_interrupted_rerunnable_migration() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = open_db(&db_path);

    let calls = Arc::new(AtomicUsize::new(0));
    let up_calls = Arc::clone(&calls);

    let mut registry = Registry::new();
    registry
        .register(
            Migration::new("1755000000_test_rerunnable", "Test rerunnable migration")
                .up(move |_| {
                    up_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .down(|_| Ok(()))
                .validate(|_| Ok(()))
                .rerunnable(true),
        )
        .unwrap();

    let catalog = CatalogStore::new(db.clone());
    simulate_interrupted(&catalog);

    check_and_run(&db, &db_path, &registry, &startup_opts()).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let schema = catalog.get().unwrap();
    assert_eq!(schema.status, Status::Clean);
    assert!(schema.is_applied("1755000000_test_rerunnable"));
    assert_eq!(schema.current_version, 1_755_000_000);
}

#[test]
fn fails_on_interrupted_non_rerunnable_migration() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = open_db(&db_path);

    let mut registry = Registry::new();
    registry
        .register(
            Migration::new("1755000000_test_not_rerunnable", "Test non-rerunnable migration")
                .up(|_| Ok(()))
                .down(|_| Ok(()))
                .validate(|_| Ok(()))
                .rerunnable(false),
        )
        .unwrap();

    let catalog = CatalogStore::new(db.clone());
    simulate_interrupted(&catalog);

    let err = check_and_run(&db, &db_path, &registry, &startup_opts()).unwrap_err();
    assert!(err.to_string().contains("not marked as rerunnable"));

    // No auto-recovery: the catalog stays diagnosable.
    assert_eq!(catalog.get().unwrap().status, Status::Migrating);
}

#[test]
fn recovers_when_first_migration_was_interrupted() {
    // Stuck with zero migrations completed: the very first migration was
    // the one interrupted.
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = open_db(&db_path);

    let calls = Arc::new(AtomicUsize::new(0));
    let up_calls = Arc::clone(&calls);

    let mut registry = Registry::new();
    registry
        .register(
            Migration::new("1755003600_initial_migration", "Initial migration")
                .up(move |_| {
                    up_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .down(|_| Ok(()))
                .rerunnable(true),
        )
        .unwrap();

    let catalog = CatalogStore::new(db.clone());
    simulate_interrupted(&catalog);

    check_and_run(&db, &db_path, &registry, &startup_opts()).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let schema = catalog.get().unwrap();
    assert_eq!(schema.status, Status::Clean);
    assert!(schema.is_applied("1755003600_initial_migration"));
    assert_eq!(schema.current_version, 1_755_003_600);
}

#[test]
fn fails_on_migrating_state_with_nothing_pending() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = open_db(&db_path);

    // Empty registry: nothing can be pending.
    let registry = Registry::new();

    let catalog = CatalogStore::new(db.clone());
    simulate_interrupted(&catalog);

    let err = check_and_run(&db, &db_path, &registry, &startup_opts()).unwrap_err();
    assert!(matches!(err, Error::InconsistentCatalog { .. }));
    assert!(err.to_string().contains("force-clean"));
}

#[test]
fn fails_on_dirty_state_with_guidance() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = open_db(&db_path);

    let registry = Registry::new();
    let catalog = CatalogStore::new(db.clone());
    catalog
        .mark_migration_failed("1755000000_x", "failed one", &"boom")
        .unwrap();

    let err = check_and_run(&db, &db_path, &registry, &startup_opts()).unwrap_err();
    assert!(matches!(err, Error::UncleanState { .. }));
    assert!(err.to_string().contains("'dirty'"));
    assert!(err.to_string().contains("status"));
}

#[test]
fn refuses_pending_migrations_when_not_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = open_db(&db_path);

    // Non-empty store without a catalog record: pre-migration database, so
    // the registered migration becomes pending.
    db.insert(b"legacy_data", b"x").unwrap();

    let mut registry = Registry::new();
    registry
        .register(
            Migration::new("1755000000_pending", "Pending migration")
                .up(|_| Ok(()))
                .down(|_| Ok(())),
        )
        .unwrap();

    let opts = StartupOptions::default(); // run_migrations = false
    let err = check_and_run(&db, &db_path, &registry, &opts).unwrap_err();
    assert!(matches!(err, Error::PendingMigrations { count: 1, .. }));
}

#[test]
fn fresh_empty_database_skips_all_migrations() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = open_db(&db_path);

    let calls = Arc::new(AtomicUsize::new(0));

    let mut registry = Registry::new();
    for id in [
        "1755000000_one",
        "1755000100_two",
        "1755000200_three",
    ] {
        let up_calls = Arc::clone(&calls);
        registry
            .register(
                Migration::new(id, format!("migration {id}"))
                    .up(move |_| {
                        up_calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .down(|_| Ok(())),
            )
            .unwrap();
    }

    check_and_run(&db, &db_path, &registry, &startup_opts()).unwrap();

    // Nothing ran: a fresh database starts at the latest version.
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let schema = CatalogStore::new(db).get().unwrap();
    assert_eq!(schema.current_version, 1_755_000_200);
    assert_eq!(schema.applied_migrations.len(), 3);
    assert_eq!(schema.status, Status::Clean);
}

#[test]
fn pre_migration_database_runs_everything() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = open_db(&db_path);
    db.insert(b"existing_user_key", b"existing_value").unwrap();

    let calls = Arc::new(AtomicUsize::new(0));

    let mut registry = Registry::new();
    for id in ["1755000000_one", "1755000100_two"] {
        let up_calls = Arc::clone(&calls);
        registry
            .register(
                Migration::new(id, format!("migration {id}"))
                    .up(move |_| {
                        up_calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .down(|_| Ok(())),
            )
            .unwrap();
    }

    check_and_run(&db, &db_path, &registry, &startup_opts()).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let schema = CatalogStore::new(db.clone()).get().unwrap();
    assert_eq!(schema.current_version, 1_755_000_100);
    assert_eq!(schema.status, Status::Clean);

    // The pre-existing data is untouched.
    assert_eq!(
        db.get(b"existing_user_key").unwrap().unwrap().as_ref(),
        b"existing_value"
    );
}

#[test]
fn startup_is_idempotent_once_current() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = open_db(&db_path);
    db.insert(b"legacy", b"x").unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let up_calls = Arc::clone(&calls);

    let mut registry = Registry::new();
    registry
        .register(
            Migration::new("1755000000_once", "Runs once")
                .up(move |_| {
                    up_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .down(|_| Ok(())),
        )
        .unwrap();

    check_and_run(&db, &db_path, &registry, &startup_opts()).unwrap();
    check_and_run(&db, &db_path, &registry, &startup_opts()).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
