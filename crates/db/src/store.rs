//! Storage contracts shared by the in-memory and Postgres backends.
//!
//! The engine never touches a backend directly; it holds an
//! `Arc<dyn ExecutionStore>` and relies on the guarantees documented here
//! to stay correct when two drivers race on the same execution.

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    DbError,
    models::{
        AppendOutcome, CancelOutcome, ExecutionRecord, ExecutionStatus, NewExecution, PlanRow,
        StatusUpdate, StepResult, WorkflowRow,
    },
};

/// Durable record of executions.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a new execution in `pending` status.
    async fn create(&self, new: NewExecution) -> Result<ExecutionRecord, DbError>;

    /// Reconstruct the full state of an execution.
    async fn load(&self, id: Uuid) -> Result<ExecutionRecord, DbError>;

    /// Append a resolved step result.
    ///
    /// Appending the same `(step_id, result)` twice is a no-op reported as
    /// [`AppendOutcome::Duplicate`]; a different result for an already
    /// recorded step fails with [`DbError::StepResultConflict`].  Appending
    /// to a terminal execution fails with [`DbError::InvalidTransition`].
    async fn append_step_result(
        &self,
        id: Uuid,
        result: StepResult,
    ) -> Result<AppendOutcome, DbError>;

    /// Compare-and-set status change.  Fails with
    /// [`DbError::InvalidTransition`] when the current status differs from
    /// `update.expected` or the state machine forbids the move.
    async fn update_status(
        &self,
        id: Uuid,
        update: StatusUpdate,
    ) -> Result<ExecutionRecord, DbError>;

    /// Cooperative cancellation.  Running executions are flagged, pending
    /// and paused ones are cancelled immediately, terminal ones are left
    /// untouched.
    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, DbError>;

    /// Park a running execution in front of `step_id`.
    async fn request_approval(&self, id: Uuid, step_id: &str) -> Result<ExecutionRecord, DbError>;

    /// Resolve the approval checkpoint in front of `step_id`.  Approval
    /// moves the execution back to `running`; rejection fails it with a
    /// [`crate::models::FailureKind::Rejected`] error.
    async fn resolve_approval(
        &self,
        id: Uuid,
        step_id: &str,
        approved: bool,
    ) -> Result<ExecutionRecord, DbError>;

    /// All executions currently in `status`, oldest first.
    async fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<ExecutionRecord>, DbError>;
}

/// Author-owned definitions.  Bodies are opaque JSON at this layer.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn put_workflow(&self, row: WorkflowRow) -> Result<WorkflowRow, DbError>;
    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError>;
    async fn list_workflows(&self) -> Result<Vec<WorkflowRow>, DbError>;
    async fn delete_workflow(&self, id: Uuid) -> Result<(), DbError>;
    async fn put_plan(&self, row: PlanRow) -> Result<PlanRow, DbError>;
    async fn get_plan(&self, id: Uuid) -> Result<PlanRow, DbError>;
}

/// Shared validation for [`ExecutionStore::update_status`].
pub fn check_transition(
    record: &ExecutionRecord,
    update: &StatusUpdate,
) -> Result<(), DbError> {
    let current = record.status;
    if current != update.expected || !current.can_transition_to(update.next) {
        return Err(DbError::InvalidTransition {
            execution_id: record.id,
            from: current,
            to: update.next,
        });
    }
    Ok(())
}

/// Shared validation for [`ExecutionStore::resolve_approval`].
pub fn check_resolvable(record: &ExecutionRecord, step_id: &str) -> Result<(), DbError> {
    if record.approval(step_id).is_some_and(|a| a.approved.is_some()) {
        return Err(DbError::AlreadyResolved {
            execution_id: record.id,
            step_id: step_id.to_owned(),
        });
    }
    if record.status != ExecutionStatus::Paused
        || record.awaiting_step.as_deref() != Some(step_id)
    {
        return Err(DbError::NotAwaitingApproval {
            execution_id: record.id,
            step_id: step_id.to_owned(),
        });
    }
    Ok(())
}
