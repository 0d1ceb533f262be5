//! sledmigrate - schema migrations for sled databases.
//!
//! sled has no native notion of schema version. This crate layers one on
//! top: a durable catalog of applied migrations stored inside the database
//! itself, a planner that orders pending migrations by dependencies and
//! timestamps, an engine that drives forward and backward transitions with
//! crash-recovery semantics, and a backup manager used as the atomicity
//! substitute around non-transactional multi-step migrations.
//!
//! # Example
//!
//! ```no_run
//! use sledmigrate_core::{check_and_run, Migration, Registry, StartupOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = Registry::new();
//!     registry.register(
//!         Migration::new("1736700000_add_meta", "Add metadata records")
//!             .up(|db| {
//!                 db.insert(b"meta", b"{}")?;
//!                 Ok(())
//!             })
//!             .down(|db| {
//!                 db.remove(b"meta")?;
//!                 Ok(())
//!             })
//!             .rerunnable(true),
//!     )?;
//!
//!     let db = sled::open("./data")?;
//!     let opts = StartupOptions {
//!         run_migrations: true,
//!         ..Default::default()
//!     };
//!     check_and_run(&db, std::path::Path::new("./data"), &registry, &opts)?;
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod global;
pub mod planner;
pub mod registry;
pub mod startup;
pub mod store;

pub use backup::{BackupInfo, BackupManager, BackupOptions};
pub use catalog::{CatalogStore, MigrationRecord, SchemaVersion, Status};
pub use engine::MigrationEngine;
pub use error::{BoxError, Error};
pub use planner::{ExecutionPlan, PlanKind, Planner};
pub use registry::{
    format_version_as_time, parse_version, Migration, MigrationFn, Registry,
    MAX_MIGRATION_VERSION, MIN_MIGRATION_VERSION,
};
pub use startup::{check_and_run, StartupOptions};
pub use store::{open_store, StoreConfig, MIGRATION_PREFIX, SCHEMA_VERSION_KEY};
