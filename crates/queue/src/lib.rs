//! `queue` crate: a supervised in-process worker pool.
//!
//! Jobs are pushed onto a bounded channel and picked up by a fixed number of
//! worker tasks.  Each job runs in its own spawned task so a panic inside a
//! handler is caught at the join boundary and reported to
//! [`JobHandler::on_failure`] instead of taking a worker down.

pub mod error;
pub mod pool;

pub use error::QueueError;
pub use pool::{JobFailure, JobHandler, PoolConfig, WorkerPool};
