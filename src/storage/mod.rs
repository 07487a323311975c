//! Storage backends for the fact store.
//!
//! The engine sees storage only through the [`FactStore`] capability set;
//! [`MemoryStore`] backs tests and embedded use, and the Postgres backend
//! (feature `backend-postgres`) persists facts across restarts under the
//! one-table-per-predicate layout.

pub mod memory;
#[cfg(feature = "backend-postgres")]
pub mod postgres;
pub mod traits;

pub use memory::MemoryStore;
#[cfg(feature = "backend-postgres")]
pub use postgres::PgStore;
pub use traits::FactStore;
