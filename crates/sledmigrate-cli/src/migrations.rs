//! Migration declarations compiled into this binary.
//!
//! Add your migrations to [`all`]. Each one is a descriptor built with
//! [`Migration::new`]:
//!
//! ```ignore
//! Migration::new("1736700000_add_market_meta", "Add market metadata records")
//!     .up(|db| {
//!         db.insert(b"market_meta", b"{}")?;
//!         Ok(())
//!     })
//!     .down(|db| {
//!         db.remove(b"market_meta")?;
//!         Ok(())
//!     })
//!     .rerunnable(true)
//! ```
//!
//! The leading number is the Unix timestamp of when the migration was
//! written; it determines execution order between independent migrations.
//! Declare `depends_on([...])` when order matters beyond timestamps.

use sledmigrate_core::Migration;

/// All migrations shipped with this binary, in any order.
pub fn all() -> Vec<Migration> {
    Vec::new()
}
