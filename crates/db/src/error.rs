//! Typed error type for the db crate.

use thiserror::Error;
use uuid::Uuid;

use crate::models::ExecutionStatus;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The requested status change violates the state machine, or the
    /// execution is no longer in the status the caller expected.
    #[error("invalid transition for execution {execution_id}: {from} -> {to}")]
    InvalidTransition {
        execution_id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// A different result was already recorded for this step.
    #[error("conflicting result for step '{step_id}' of execution {execution_id}")]
    StepResultConflict { execution_id: Uuid, step_id: String },

    #[error("execution {execution_id} is not awaiting approval for step '{step_id}'")]
    NotAwaitingApproval { execution_id: Uuid, step_id: String },

    #[error("approval for step '{step_id}' of execution {execution_id} was already resolved")]
    AlreadyResolved { execution_id: Uuid, step_id: String },
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}
