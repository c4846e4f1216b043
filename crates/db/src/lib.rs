//! `db` crate: the execution state store.
//!
//! Provides execution record types and their status state machine, the
//! [`ExecutionStore`] / [`DefinitionStore`] contracts, an in-memory backend
//! and a Postgres backend (connection pool, migrations, repository
//! functions).  No orchestration logic lives here.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use pool::DbPool;
pub use postgres::PgStore;
pub use store::{DefinitionStore, ExecutionStore};
