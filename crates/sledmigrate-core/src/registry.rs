//! Migration descriptors and the in-memory registry.
//!
//! Migrations are declared as descriptors built with [`Migration::new`] and
//! registered into a [`Registry`] before any planning happens. The registry
//! computes the pending execution order: a topological sort over declared
//! dependencies, breaking ties by the Unix-timestamp version encoded in each
//! migration ID.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use crate::error::{BoxError, Error};

/// Earliest valid migration timestamp (2000-01-01T00:00:00Z).
pub const MIN_MIGRATION_VERSION: i64 = 946_684_800;

/// Latest valid migration timestamp (2100-01-01T00:00:00Z).
pub const MAX_MIGRATION_VERSION: i64 = 4_102_444_800;

/// Signature of a user-supplied migration callback.
pub type MigrationFn = Arc<dyn Fn(&sled::Db) -> Result<(), BoxError> + Send + Sync>;

/// A single database migration.
///
/// The `version` is always re-derived from the ID at registration; it is
/// never trusted from any external source.
#[derive(Clone)]
pub struct Migration {
    /// Unix-timestamp ID, e.g. `1736700000_add_market_meta`.
    pub id: String,
    /// Unix timestamp parsed from the ID.
    pub version: i64,
    /// IDs of migrations that must be applied before this one.
    pub dependencies: Vec<String>,
    /// Human-readable description.
    pub description: String,
    /// If true, the migration can be safely re-executed after an
    /// interruption. Required for automatic crash recovery.
    pub rerunnable: bool,
    pub(crate) up: Option<MigrationFn>,
    pub(crate) down: Option<MigrationFn>,
    pub(crate) validate: Option<MigrationFn>,
}

impl Migration {
    /// Create a new migration descriptor. `up` and `down` callbacks must be
    /// attached before registration.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            dependencies: Vec::new(),
            description: description.into(),
            rerunnable: false,
            up: None,
            down: None,
            validate: None,
        }
    }

    /// Attach the forward callback.
    pub fn up(mut self, f: impl Fn(&sled::Db) -> Result<(), BoxError> + Send + Sync + 'static) -> Self {
        self.up = Some(Arc::new(f));
        self
    }

    /// Attach the backward callback.
    pub fn down(mut self, f: impl Fn(&sled::Db) -> Result<(), BoxError> + Send + Sync + 'static) -> Self {
        self.down = Some(Arc::new(f));
        self
    }

    /// Attach an optional post-migration validator.
    pub fn validate(
        mut self,
        f: impl Fn(&sled::Db) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Arc::new(f));
        self
    }

    /// Declare dependencies on other migrations by ID.
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Mark the migration as safely re-executable after interruption.
    pub fn rerunnable(mut self, yes: bool) -> Self {
        self.rerunnable = yes;
        self
    }

    /// Run the forward or backward callback. The validator, when present,
    /// checks the migrated state and therefore only runs after `up`.
    pub(crate) fn run(&self, db: &sled::Db, forward: bool) -> Result<(), Error> {
        let (f, name) = if forward {
            (self.up.as_ref(), "up")
        } else {
            (self.down.as_ref(), "down")
        };

        let f = f.ok_or_else(|| Error::MissingCallback {
            id: self.id.clone(),
            callback: if forward { "up" } else { "down" },
        })?;

        f(db).map_err(|source| {
            tracing::debug!(migration = %self.id, direction = name, "callback failed");
            Error::MigrationFailed {
                id: self.id.clone(),
                source,
            }
        })?;

        if forward {
            if let Some(validate) = &self.validate {
                validate(db).map_err(|source| Error::MigrationFailed {
                    id: self.id.clone(),
                    source,
                })?;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("dependencies", &self.dependencies)
            .field("description", &self.description)
            .field("rerunnable", &self.rerunnable)
            .field("has_up", &self.up.is_some())
            .field("has_down", &self.down.is_some())
            .field("has_validate", &self.validate.is_some())
            .finish()
    }
}

/// Parse the Unix-timestamp version from a migration ID.
///
/// The format is `<timestamp>_<description>`: split on the first underscore,
/// integer-parse the first field, require a non-empty second field containing
/// only `[A-Za-z0-9_-]`.
pub fn parse_version(id: &str) -> Result<i64, Error> {
    let invalid = |reason: &str| Error::InvalidMigrationId {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    let (timestamp, description) = id
        .split_once('_')
        .ok_or_else(|| invalid("migration ID must follow format <timestamp>_<description>"))?;

    if description.is_empty() {
        return Err(invalid("description must not be empty"));
    }
    if !description
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid(
            "description may only contain letters, digits, '_' and '-'",
        ));
    }

    let version: i64 = timestamp
        .parse()
        .map_err(|_| invalid("invalid timestamp in migration ID"))?;

    if !(MIN_MIGRATION_VERSION..=MAX_MIGRATION_VERSION).contains(&version) {
        return Err(invalid("timestamp is outside valid range (2000-2100)"));
    }

    Ok(version)
}

/// Render a version timestamp as a human-readable UTC time.
pub fn format_version_as_time(version: i64) -> String {
    if version == 0 {
        return "(no migrations)".to_string();
    }
    match Utc.timestamp_opt(version, 0).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => format!("(invalid timestamp {version})"),
    }
}

/// In-memory catalog of declared migrations.
///
/// Populated once at process init and read-only during execution.
#[derive(Default)]
pub struct Registry {
    migrations: HashMap<String, Arc<Migration>>,
    ordered: Vec<Arc<Migration>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration.
    ///
    /// Rejects empty IDs, unparsable IDs, duplicates, and missing `up`/`down`
    /// callbacks. The migration version is derived from the ID here.
    pub fn register(&mut self, mut migration: Migration) -> Result<(), Error> {
        if migration.id.is_empty() {
            return Err(Error::InvalidMigrationId {
                id: String::new(),
                reason: "migration ID cannot be empty".to_string(),
            });
        }
        if self.migrations.contains_key(&migration.id) {
            return Err(Error::DuplicateMigration {
                id: migration.id.clone(),
            });
        }
        if migration.up.is_none() {
            return Err(Error::MissingCallback {
                id: migration.id.clone(),
                callback: "up",
            });
        }
        if migration.down.is_none() {
            return Err(Error::MissingCallback {
                id: migration.id.clone(),
                callback: "down",
            });
        }

        migration.version = parse_version(&migration.id)?;

        let migration = Arc::new(migration);
        self.migrations
            .insert(migration.id.clone(), Arc::clone(&migration));

        // Keep the ordered list sorted by version, ties broken by ID.
        let pos = self.ordered.partition_point(|m| {
            (m.version, m.id.as_str()) < (migration.version, migration.id.as_str())
        });
        self.ordered.insert(pos, migration);

        Ok(())
    }

    /// Number of registered migrations.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Look up a migration by ID.
    pub fn get(&self, id: &str) -> Option<&Arc<Migration>> {
        self.migrations.get(id)
    }

    /// All migrations ordered by version ascending.
    pub fn all(&self) -> &[Arc<Migration>] {
        &self.ordered
    }

    /// Migrations with `lo <= version <= hi`, ordered by version.
    pub fn in_version_range(&self, lo: i64, hi: i64) -> Vec<Arc<Migration>> {
        self.ordered
            .iter()
            .filter(|m| m.version >= lo && m.version <= hi)
            .cloned()
            .collect()
    }

    /// Migrations not yet applied, in execution order.
    ///
    /// The order satisfies two rules at once: a migration runs after all of
    /// its declared dependencies, and among migrations with no outstanding
    /// dependency the one with the smallest version runs first. This is
    /// Kahn's topological sort with the ready set kept as a min-heap keyed
    /// on `(version, id)`.
    pub fn pending(&self, applied: &BTreeMap<String, bool>) -> Result<Vec<Arc<Migration>>, Error> {
        let is_applied = |id: &str| applied.get(id).copied().unwrap_or(false);

        let pending: Vec<&Arc<Migration>> = self
            .ordered
            .iter()
            .filter(|m| !is_applied(&m.id))
            .collect();

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let pending_by_id: HashMap<&str, &Arc<Migration>> =
            pending.iter().map(|m| (m.id.as_str(), *m)).collect();

        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for m in &pending {
            in_degree.insert(m.id.as_str(), 0);
        }

        for m in &pending {
            for dep in &m.dependencies {
                if is_applied(dep) {
                    continue;
                }
                if !pending_by_id.contains_key(dep.as_str()) {
                    return Err(Error::DanglingDependency {
                        id: m.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                successors.entry(dep.as_str()).or_default().push(m.id.as_str());
                *in_degree.entry(m.id.as_str()).or_default() += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<(i64, &str)>> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| Reverse((pending_by_id[id].version, *id)))
            .collect();

        let mut sorted = Vec::with_capacity(pending.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            sorted.push(Arc::clone(pending_by_id[id]));
            for succ in successors.remove(id).unwrap_or_default() {
                if let Some(degree) = in_degree.get_mut(succ) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((pending_by_id[succ].version, succ)));
                    }
                }
            }
        }

        if sorted.len() != pending.len() {
            let mut involved: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            involved.sort();
            return Err(Error::Cycle { involved });
        }

        Ok(sorted)
    }
}
