//! Database module: row models and SQL repositories.
//!
//! - `model`: row structs mapped by `sqlx::FromRow` and converted into domain types.
//! - `repo`: pool setup, migrations and the waitlist ledger queries.
//! - `queue`: notification job queries.
//! - `settings`: settings rows and the append-only analytics table.
//!
//! Callers import from `restock_waitlist::db`; the repository API is re-exported here.

pub mod model;
pub mod queue;
pub mod repo;
pub mod settings;

pub use model::{NewEntry, NewJob};
pub use queue::*;
pub use repo::*;
pub use settings::*;
