//! Human approval checkpoints in front of plan steps.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use db::models::ExecutionRecord;
use db::ExecutionStore;

use crate::events::{EventBus, ExecutionEvent};
use crate::EngineError;

/// Parks executions at approval points and resolves them.
///
/// All state lives in the store; the gate itself only adds events and
/// logging, so any process may resolve a checkpoint another one created.
#[derive(Clone)]
pub struct ApprovalGate {
    store: Arc<dyn ExecutionStore>,
    events: EventBus,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn ExecutionStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// running → paused, waiting on `step_id`.
    pub async fn request_approval(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<ExecutionRecord, EngineError> {
        let record = self.store.request_approval(execution_id, step_id).await?;
        info!(%execution_id, step_id, "execution paused for approval");
        self.events.publish(ExecutionEvent::from_record(&record));
        Ok(record)
    }

    /// Approve (paused → running) or reject (paused → failed/rejected).
    ///
    /// Fails with `NotAwaitingApproval` when the execution is not paused
    /// on exactly this step and `AlreadyResolved` when the checkpoint was
    /// decided before.
    pub async fn resolve(
        &self,
        execution_id: Uuid,
        step_id: &str,
        approved: bool,
    ) -> Result<ExecutionRecord, EngineError> {
        let record = self.store.resolve_approval(execution_id, step_id, approved).await?;
        info!(%execution_id, step_id, approved, status = %record.status, "approval resolved");
        if record.status.is_terminal() {
            self.events.publish(ExecutionEvent::from_record(&record));
        }
        Ok(record)
    }
}
