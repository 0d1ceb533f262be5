//! The schema-version catalog.
//!
//! A single JSON record stored inside the target database under the reserved
//! key `__schema_version__`. The record is small, read on every decision, and
//! rewritten as one blob so that each update rides on the store's atomic
//! single-key write.

mod record;
mod store;

pub use record::{is_rollback_record, MigrationRecord, SchemaVersion, Status};
pub use store::CatalogStore;
