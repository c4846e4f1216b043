//! In-process store.  Used by tests, `rusty-flow run`, and `serve --memory`.
//!
//! Every operation takes the write lock for its whole read-check-write
//! sequence, which gives the same atomicity the Postgres backend gets from
//! conditional `UPDATE`s and transactions.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::{
    DbError,
    models::{
        AppendOutcome, ApprovalRecord, CancelOutcome, ExecutionError, ExecutionRecord,
        ExecutionStatus, FailureKind, NewExecution, PlanRow, StatusUpdate, StepResult,
        WorkflowRow,
    },
    store::{check_resolvable, check_transition, DefinitionStore, ExecutionStore},
};

#[derive(Default)]
pub struct MemoryStore {
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
    workflows: RwLock<HashMap<Uuid, WorkflowRow>>,
    plans: RwLock<HashMap<Uuid, PlanRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create(&self, new: NewExecution) -> Result<ExecutionRecord, DbError> {
        let record = ExecutionRecord::new(new);
        self.executions.write().await.insert(record.id, record.clone());
        Ok(record)
    }

    async fn load(&self, id: Uuid) -> Result<ExecutionRecord, DbError> {
        self.executions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(DbError::NotFound)
    }

    async fn append_step_result(
        &self,
        id: Uuid,
        result: StepResult,
    ) -> Result<AppendOutcome, DbError> {
        let mut executions = self.executions.write().await;
        let record = executions.get_mut(&id).ok_or(DbError::NotFound)?;

        if let Some(existing) = record.step_result(&result.step_id) {
            if existing.same_outcome(&result) {
                debug!(execution_id = %id, step_id = %result.step_id, "duplicate step result ignored");
                return Ok(AppendOutcome::Duplicate);
            }
            return Err(DbError::StepResultConflict {
                execution_id: id,
                step_id: result.step_id,
            });
        }

        if record.status.is_terminal() {
            return Err(DbError::InvalidTransition {
                execution_id: id,
                from: record.status,
                to: record.status,
            });
        }

        record.step_results.push(result);
        Ok(AppendOutcome::Appended)
    }

    async fn update_status(
        &self,
        id: Uuid,
        update: StatusUpdate,
    ) -> Result<ExecutionRecord, DbError> {
        let mut executions = self.executions.write().await;
        let record = executions.get_mut(&id).ok_or(DbError::NotFound)?;
        check_transition(record, &update)?;
        record.apply_status(update.next, update.error);
        Ok(record.clone())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, DbError> {
        let mut executions = self.executions.write().await;
        let record = executions.get_mut(&id).ok_or(DbError::NotFound)?;

        let outcome = match record.status {
            status if status.is_terminal() => CancelOutcome::Rejected,
            ExecutionStatus::Running => {
                record.cancel_requested = true;
                CancelOutcome::Requested
            }
            _ => {
                record.cancel_requested = true;
                record.apply_status(ExecutionStatus::Cancelled, None);
                CancelOutcome::Cancelled
            }
        };
        Ok(outcome)
    }

    async fn request_approval(&self, id: Uuid, step_id: &str) -> Result<ExecutionRecord, DbError> {
        let mut executions = self.executions.write().await;
        let record = executions.get_mut(&id).ok_or(DbError::NotFound)?;
        check_transition(
            record,
            &StatusUpdate::new(ExecutionStatus::Running, ExecutionStatus::Paused),
        )?;

        if record.approval(step_id).is_none() {
            record.approvals.push(ApprovalRecord {
                step_id: step_id.to_owned(),
                approved: None,
                requested_at: Utc::now(),
                resolved_at: None,
            });
        }
        record.apply_status(ExecutionStatus::Paused, None);
        record.awaiting_step = Some(step_id.to_owned());
        Ok(record.clone())
    }

    async fn resolve_approval(
        &self,
        id: Uuid,
        step_id: &str,
        approved: bool,
    ) -> Result<ExecutionRecord, DbError> {
        let mut executions = self.executions.write().await;
        let record = executions.get_mut(&id).ok_or(DbError::NotFound)?;
        check_resolvable(record, step_id)?;

        let now = Utc::now();
        if let Some(approval) = record.approvals.iter_mut().find(|a| a.step_id == step_id) {
            approval.approved = Some(approved);
            approval.resolved_at = Some(now);
        }

        if approved {
            record.apply_status(ExecutionStatus::Running, None);
        } else {
            let error = ExecutionError::new(FailureKind::Rejected, "approval rejected")
                .at_step(step_id);
            record.apply_status(ExecutionStatus::Failed, Some(error));
        }
        Ok(record.clone())
    }

    async fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<ExecutionRecord>, DbError> {
        let mut records: Vec<ExecutionRecord> = self
            .executions
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn put_workflow(&self, row: WorkflowRow) -> Result<WorkflowRow, DbError> {
        self.workflows.write().await.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError> {
        self.workflows.read().await.get(&id).cloned().ok_or(DbError::NotFound)
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRow>, DbError> {
        let mut rows: Vec<WorkflowRow> = self.workflows.read().await.values().cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), DbError> {
        self.workflows
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(DbError::NotFound)
    }

    async fn put_plan(&self, row: PlanRow) -> Result<PlanRow, DbError> {
        self.plans.write().await.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_plan(&self, id: Uuid) -> Result<PlanRow, DbError> {
        self.plans.read().await.get(&id).cloned().ok_or(DbError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionTarget, TargetKind, TriggerKind};
    use serde_json::json;

    fn new_execution() -> NewExecution {
        NewExecution {
            target: ExecutionTarget { kind: TargetKind::Plan, id: Uuid::new_v4() },
            tenant_id: Uuid::new_v4(),
            triggered_by: Some("tester".into()),
            trigger_kind: TriggerKind::Api,
            input_data: json!({ "k": "v" }),
        }
    }

    fn step(id: &str, value: serde_json::Value) -> StepResult {
        let now = Utc::now();
        StepResult {
            step_id: id.into(),
            result: value,
            outcome: None,
            error: None,
            attempts: 1,
            error_trail: vec![],
            started_at: now,
            completed_at: now,
        }
    }

    async fn running(store: &MemoryStore) -> ExecutionRecord {
        let rec = store.create(new_execution()).await.unwrap();
        store
            .update_status(rec.id, StatusUpdate::new(ExecutionStatus::Pending, ExecutionStatus::Running))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_append_is_a_no_op() {
        let store = MemoryStore::new();
        let rec = running(&store).await;

        let first = store.append_step_result(rec.id, step("a", json!(1))).await.unwrap();
        let second = store.append_step_result(rec.id, step("a", json!(1))).await.unwrap();

        assert_eq!(first, AppendOutcome::Appended);
        assert_eq!(second, AppendOutcome::Duplicate);
        let loaded = store.load(rec.id).await.unwrap();
        assert_eq!(loaded.step_results.len(), 1);
        assert_eq!(loaded.step_results[0].result, json!(1));
    }

    #[tokio::test]
    async fn conflicting_append_is_rejected() {
        let store = MemoryStore::new();
        let rec = running(&store).await;

        store.append_step_result(rec.id, step("a", json!(1))).await.unwrap();
        let err = store.append_step_result(rec.id, step("a", json!(2))).await.unwrap_err();
        assert!(matches!(err, DbError::StepResultConflict { step_id, .. } if step_id == "a"));
    }

    #[tokio::test]
    async fn stale_compare_and_set_loses() {
        let store = MemoryStore::new();
        let rec = running(&store).await;

        // A second driver still believes the execution is pending.
        let err = store
            .update_status(rec.id, StatusUpdate::new(ExecutionStatus::Pending, ExecutionStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition { from: ExecutionStatus::Running, .. }));
    }

    #[tokio::test]
    async fn terminal_status_is_final() {
        let store = MemoryStore::new();
        let rec = running(&store).await;
        let done = store
            .update_status(rec.id, StatusUpdate::new(ExecutionStatus::Running, ExecutionStatus::Completed))
            .await
            .unwrap();
        assert!(done.completed_at.is_some());

        let err = store
            .update_status(rec.id, StatusUpdate::new(ExecutionStatus::Completed, ExecutionStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition { .. }));

        let err = store.append_step_result(rec.id, step("late", json!(null))).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn cancel_depends_on_current_status() {
        let store = MemoryStore::new();

        let pending = store.create(new_execution()).await.unwrap();
        assert_eq!(store.request_cancel(pending.id).await.unwrap(), CancelOutcome::Cancelled);
        let loaded = store.load(pending.id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Cancelled);
        assert!(loaded.completed_at.is_some());

        let rec = running(&store).await;
        assert_eq!(store.request_cancel(rec.id).await.unwrap(), CancelOutcome::Requested);
        let loaded = store.load(rec.id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert!(loaded.cancel_requested);

        assert_eq!(store.request_cancel(pending.id).await.unwrap(), CancelOutcome::Rejected);
    }

    #[tokio::test]
    async fn approval_is_single_use() {
        let store = MemoryStore::new();
        let rec = running(&store).await;

        let paused = store.request_approval(rec.id, "s2").await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.awaiting_step.as_deref(), Some("s2"));

        let err = store.resolve_approval(rec.id, "s3", true).await.unwrap_err();
        assert!(matches!(err, DbError::NotAwaitingApproval { .. }));

        let resumed = store.resolve_approval(rec.id, "s2", true).await.unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Running);
        assert!(resumed.is_approved("s2"));
        assert!(resumed.awaiting_step.is_none());

        let err = store.resolve_approval(rec.id, "s2", true).await.unwrap_err();
        assert!(matches!(err, DbError::AlreadyResolved { .. }));
    }

    #[tokio::test]
    async fn rejection_fails_with_rejected_reason() {
        let store = MemoryStore::new();
        let rec = running(&store).await;
        store.request_approval(rec.id, "s2").await.unwrap();

        let failed = store.resolve_approval(rec.id, "s2", false).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.error.unwrap().kind, FailureKind::Rejected);
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn resolving_a_running_execution_is_rejected() {
        let store = MemoryStore::new();
        let rec = running(&store).await;
        let err = store.resolve_approval(rec.id, "s1", true).await.unwrap_err();
        assert!(matches!(err, DbError::NotAwaitingApproval { .. }));
    }
}
