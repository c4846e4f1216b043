use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The pool has been shut down and accepts no more jobs.
    #[error("worker pool is closed")]
    Closed,
}
