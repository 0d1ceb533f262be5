//! The persisted schema-version record.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix marking a history record as a rollback of the base migration.
const ROLLBACK_SUFFIX: &str = "_rollback";

/// Current migration state of the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// All migrations applied successfully.
    Clean,
    /// A migration is in progress.
    Migrating,
    /// A migration failed; manual intervention required.
    Dirty,
    /// A rollback is in progress.
    Rollback,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Clean => write!(f, "clean"),
            Status::Migrating => write!(f, "migrating"),
            Status::Dirty => write!(f, "dirty"),
            Status::Rollback => write!(f, "rollback"),
        }
    }
}

/// One entry in the migration history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration ID, possibly suffixed `_rollback` or `_rerun`.
    pub id: String,
    /// Description at the time the record was written.
    pub description: String,
    /// When the operation finished.
    pub applied_at: DateTime<Utc>,
    /// Wall-clock duration, rendered as a string.
    pub duration: String,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error text for failed operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The schema-version catalog record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Unix timestamp of the newest applied migration, 0 if none.
    pub current_version: i64,
    /// Set of applied migration IDs.
    pub applied_migrations: BTreeMap<String, bool>,
    /// Ordered history of migration operations.
    pub migration_history: Vec<MigrationRecord>,
    /// Timestamp of the latest write to this record.
    #[serde(default)]
    pub last_migration_at: Option<DateTime<Utc>>,
    /// Current migration state.
    pub status: Status,
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::zero()
    }
}

impl SchemaVersion {
    /// The record of a database with no applied migrations.
    pub fn zero() -> Self {
        Self {
            current_version: 0,
            applied_migrations: BTreeMap::new(),
            migration_history: Vec::new(),
            last_migration_at: None,
            status: Status::Clean,
        }
    }

    /// Whether the given migration ID is in the applied set.
    pub fn is_applied(&self, id: &str) -> bool {
        self.applied_migrations.get(id).copied().unwrap_or(false)
    }

    /// IDs that the history currently supports as successfully applied.
    ///
    /// Walks the history in order: a successful non-rollback record adds its
    /// ID, a rollback record removes the ID it rolls back.
    pub fn successful_from_history(&self) -> BTreeMap<String, bool> {
        let mut successful = BTreeMap::new();
        for record in &self.migration_history {
            if record.success && !is_rollback_record(&record.id) {
                successful.insert(record.id.clone(), true);
            } else if let Some(original) = record.id.strip_suffix(ROLLBACK_SUFFIX) {
                successful.remove(original);
            }
        }
        successful
    }

    /// Recompute `current_version` from the applied set.
    ///
    /// IDs that do not parse (none are expected) are skipped, matching the
    /// rollback recomputation behavior.
    pub fn derive_current_version(&self) -> i64 {
        self.applied_migrations
            .keys()
            .filter_map(|id| crate::registry::parse_version(id).ok())
            .max()
            .unwrap_or(0)
    }
}

/// Whether a record ID denotes a rollback operation.
pub fn is_rollback_record(id: &str) -> bool {
    id.len() > ROLLBACK_SUFFIX.len() && id.ends_with(ROLLBACK_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, success: bool) -> MigrationRecord {
        MigrationRecord {
            id: id.to_string(),
            description: String::new(),
            applied_at: Utc::now(),
            duration: "0s".to_string(),
            success,
            error: None,
        }
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Clean).unwrap(), "\"clean\"");
        assert_eq!(
            serde_json::to_string(&Status::Migrating).unwrap(),
            "\"migrating\""
        );
        assert_eq!(serde_json::to_string(&Status::Dirty).unwrap(), "\"dirty\"");
        assert_eq!(
            serde_json::to_string(&Status::Rollback).unwrap(),
            "\"rollback\""
        );
    }

    #[test]
    fn test_record_json_field_names() {
        let mut version = SchemaVersion::zero();
        version.applied_migrations.insert("1700000000_a".into(), true);
        version.migration_history.push(record("1700000000_a", true));

        let json = serde_json::to_value(&version).unwrap();
        assert!(json.get("current_version").is_some());
        assert!(json.get("applied_migrations").is_some());
        assert!(json.get("migration_history").is_some());
        assert!(json.get("last_migration_at").is_some());
        assert_eq!(json["status"], "clean");

        let entry = &json["migration_history"][0];
        assert!(entry.get("id").is_some());
        assert!(entry.get("applied_at").is_some());
        assert!(entry.get("duration").is_some());
        assert!(entry.get("success").is_some());
        // `error` is omitted for successful records.
        assert!(entry.get("error").is_none());
    }

    #[test]
    fn test_successful_from_history_respects_rollbacks() {
        let mut version = SchemaVersion::zero();
        version.migration_history.push(record("1700000000_a", true));
        version.migration_history.push(record("1700000100_b", true));
        version
            .migration_history
            .push(record("1700000100_b_rollback", true));

        let successful = version.successful_from_history();
        assert!(successful.contains_key("1700000000_a"));
        assert!(!successful.contains_key("1700000100_b"));
    }

    #[test]
    fn test_failed_records_do_not_count() {
        let mut version = SchemaVersion::zero();
        version.migration_history.push(record("1700000000_a", false));
        assert!(version.successful_from_history().is_empty());
    }

    #[test]
    fn test_is_rollback_record() {
        assert!(is_rollback_record("1700000000_a_rollback"));
        assert!(!is_rollback_record("1700000000_a"));
        assert!(!is_rollback_record("_rollback"));
    }

    #[test]
    fn test_derive_current_version() {
        let mut version = SchemaVersion::zero();
        assert_eq!(version.derive_current_version(), 0);

        version.applied_migrations.insert("1700000000_a".into(), true);
        version.applied_migrations.insert("1800000000_b".into(), true);
        assert_eq!(version.derive_current_version(), 1_800_000_000);
    }
}
