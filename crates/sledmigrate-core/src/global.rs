//! Optional process-wide registry.
//!
//! Prefer constructing a [`Registry`] explicitly and passing it around; this
//! thin layer exists for binaries that collect migrations from many modules
//! without threading a registry through them.

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::Error;
use crate::registry::{Migration, Registry};

static GLOBAL: Lazy<RwLock<Registry>> = Lazy::new(|| RwLock::new(Registry::new()));

/// Register a migration in the global registry.
pub fn register(migration: Migration) -> Result<(), Error> {
    GLOBAL.write().register(migration)
}

/// Run a closure against the global registry.
pub fn with_registry<T>(f: impl FnOnce(&Registry) -> T) -> T {
    f(&GLOBAL.read())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_register_and_read() {
        register(
            Migration::new("1711111111_global_demo", "demo")
                .up(|_| Ok(()))
                .down(|_| Ok(())),
        )
        .unwrap();

        let found = with_registry(|r| r.get("1711111111_global_demo").is_some());
        assert!(found);

        // Duplicates are still rejected.
        let err = register(
            Migration::new("1711111111_global_demo", "demo")
                .up(|_| Ok(()))
                .down(|_| Ok(())),
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateMigration { .. }));
    }
}
