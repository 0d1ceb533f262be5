//! Migration planning.
//!
//! The planner turns the registry and the persisted catalog into an
//! [`ExecutionPlan`] the engine can drive. It never mutates anything.

use std::fmt;
use std::sync::Arc;

use crate::catalog::CatalogStore;
use crate::error::Error;
use crate::registry::{Migration, Registry};

/// The kind of transition a plan performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    /// Apply pending migrations forward.
    Upgrade,
    /// Roll applied migrations back.
    Downgrade,
    /// Re-execute a single migration (down then up).
    Rerun,
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanKind::Upgrade => write!(f, "upgrade"),
            PlanKind::Downgrade => write!(f, "downgrade"),
            PlanKind::Rerun => write!(f, "rerun"),
        }
    }
}

/// A planned migration execution.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// What kind of transition this is.
    pub kind: PlanKind,
    /// Catalog version when the plan was made.
    pub current_version: i64,
    /// Version the plan moves the database to.
    pub target_version: i64,
    /// Migrations in execution order.
    pub migrations: Vec<Arc<Migration>>,
    /// Number of engine steps the plan will take.
    pub estimated_steps: usize,
}

impl ExecutionPlan {
    /// Whether the plan does nothing.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PlanKind::Upgrade => write!(
                f,
                "Upgrade from version {} to {} ({} migrations)",
                self.current_version,
                self.target_version,
                self.migrations.len()
            ),
            PlanKind::Downgrade => write!(
                f,
                "Downgrade from version {} to {} ({} rollbacks)",
                self.current_version,
                self.target_version,
                self.migrations.len()
            ),
            PlanKind::Rerun => match self.migrations.first() {
                Some(m) => write!(f, "Rerun migration '{}'", m.id),
                None => write!(f, "Rerun migration"),
            },
        }
    }
}

/// Produces execution plans from the registry and the catalog.
pub struct Planner<'a> {
    registry: &'a Registry,
    catalog: &'a CatalogStore,
}

impl<'a> Planner<'a> {
    /// Create a planner.
    pub fn new(registry: &'a Registry, catalog: &'a CatalogStore) -> Self {
        Self { registry, catalog }
    }

    /// Plan the application of all pending migrations.
    pub fn plan_upgrade(&self) -> Result<ExecutionPlan, Error> {
        let schema = self.catalog.get()?;
        let pending = self.registry.pending(&schema.applied_migrations)?;

        let target_version = pending
            .iter()
            .map(|m| m.version)
            .max()
            .unwrap_or(schema.current_version)
            .max(schema.current_version);

        Ok(ExecutionPlan {
            kind: PlanKind::Upgrade,
            current_version: schema.current_version,
            target_version,
            estimated_steps: pending.len(),
            migrations: pending,
        })
    }

    /// Plan an upgrade limited to migrations with `version <= target`.
    ///
    /// A no-op plan is returned when the database is already at or past the
    /// target.
    pub fn plan_upgrade_to(&self, target_version: i64) -> Result<ExecutionPlan, Error> {
        let schema = self.catalog.get()?;

        if schema.current_version >= target_version {
            return Ok(ExecutionPlan {
                kind: PlanKind::Upgrade,
                current_version: schema.current_version,
                target_version: schema.current_version,
                migrations: Vec::new(),
                estimated_steps: 0,
            });
        }

        let pending: Vec<Arc<Migration>> = self
            .registry
            .pending(&schema.applied_migrations)?
            .into_iter()
            .filter(|m| m.version <= target_version)
            .collect();

        Ok(ExecutionPlan {
            kind: PlanKind::Upgrade,
            current_version: schema.current_version,
            target_version,
            estimated_steps: pending.len(),
            migrations: pending,
        })
    }

    /// Plan a rollback of every applied migration newer than `target`.
    ///
    /// Migrations roll back newest-first, by version order. A no-op plan is
    /// returned when the database is already at or below the target.
    pub fn plan_downgrade(&self, target_version: i64) -> Result<ExecutionPlan, Error> {
        let schema = self.catalog.get()?;

        if schema.current_version <= target_version {
            return Ok(ExecutionPlan {
                kind: PlanKind::Downgrade,
                current_version: schema.current_version,
                target_version: schema.current_version,
                migrations: Vec::new(),
                estimated_steps: 0,
            });
        }

        let mut rollback: Vec<Arc<Migration>> = self
            .registry
            .in_version_range(target_version + 1, schema.current_version)
            .into_iter()
            .filter(|m| schema.is_applied(&m.id))
            .collect();
        rollback.reverse();

        Ok(ExecutionPlan {
            kind: PlanKind::Downgrade,
            current_version: schema.current_version,
            target_version,
            estimated_steps: rollback.len(),
            migrations: rollback,
        })
    }

    /// Plan a rerun (down then up) of a single migration. The catalog
    /// version is unchanged by a rerun.
    pub fn plan_rerun(&self, id: &str) -> Result<ExecutionPlan, Error> {
        let migration = self
            .registry
            .get(id)
            .cloned()
            .ok_or_else(|| Error::MigrationNotFound { id: id.to_string() })?;

        let schema = self.catalog.get()?;

        Ok(ExecutionPlan {
            kind: PlanKind::Rerun,
            current_version: schema.current_version,
            target_version: schema.current_version,
            migrations: vec![migration],
            estimated_steps: 2,
        })
    }
}
