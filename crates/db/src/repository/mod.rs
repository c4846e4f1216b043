//! Repository functions: one function per database operation.
//!
//! Definition functions take a `&DbPool`; execution functions take a
//! `&mut PgConnection` so [`crate::PgStore`] can compose them inside a
//! transaction.  No business logic, only SQL and row conversion.

pub mod workflows;
pub mod plans;
pub mod executions;
