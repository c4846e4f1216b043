//! Postgres-backed [`ExecutionStore`] and [`DefinitionStore`].

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::{
    DbError, DbPool,
    models::{
        AppendOutcome, CancelOutcome, ExecutionError, ExecutionRecord, ExecutionStatus,
        FailureKind, NewExecution, PlanRow, StatusUpdate, StepResult, WorkflowRow,
    },
    repository::{executions as exec_repo, plans as plan_repo, workflows as wf_repo},
    store::{check_resolvable, check_transition, DefinitionStore, ExecutionStore},
};

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn create(&self, new: NewExecution) -> Result<ExecutionRecord, DbError> {
        let record = ExecutionRecord::new(new);
        let mut conn = self.pool.acquire().await?;
        exec_repo::insert_execution(&mut conn, &record).await?;
        Ok(record)
    }

    async fn load(&self, id: Uuid) -> Result<ExecutionRecord, DbError> {
        let mut conn = self.pool.acquire().await?;
        exec_repo::load_execution(&mut conn, id, false).await
    }

    async fn append_step_result(
        &self,
        id: Uuid,
        result: StepResult,
    ) -> Result<AppendOutcome, DbError> {
        let mut tx = self.pool.begin().await?;
        let record = exec_repo::load_execution(&mut tx, id, true).await?;

        if let Some(existing) = record.step_result(&result.step_id) {
            tx.rollback().await?;
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
            tx.rollback().await?;
            return Err(DbError::InvalidTransition {
                execution_id: id,
                from: record.status,
                to: record.status,
            });
        }

        exec_repo::insert_step_result(&mut tx, id, &result).await?;
        tx.commit().await?;
        Ok(AppendOutcome::Appended)
    }

    async fn update_status(
        &self,
        id: Uuid,
        update: StatusUpdate,
    ) -> Result<ExecutionRecord, DbError> {
        let mut tx = self.pool.begin().await?;
        let mut record = exec_repo::load_execution(&mut tx, id, true).await?;
        check_transition(&record, &update)?;

        record.apply_status(update.next, update.error);
        exec_repo::write_execution_header(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, DbError> {
        let mut tx = self.pool.begin().await?;
        let mut record = exec_repo::load_execution(&mut tx, id, true).await?;

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

        if outcome.accepted() {
            exec_repo::write_execution_header(&mut tx, &record).await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn request_approval(&self, id: Uuid, step_id: &str) -> Result<ExecutionRecord, DbError> {
        let mut tx = self.pool.begin().await?;
        let mut record = exec_repo::load_execution(&mut tx, id, true).await?;
        check_transition(
            &record,
            &StatusUpdate::new(ExecutionStatus::Running, ExecutionStatus::Paused),
        )?;

        exec_repo::insert_approval(&mut tx, id, step_id).await?;
        record.apply_status(ExecutionStatus::Paused, None);
        record.awaiting_step = Some(step_id.to_owned());
        exec_repo::write_execution_header(&mut tx, &record).await?;

        let record = exec_repo::load_execution(&mut tx, id, false).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn resolve_approval(
        &self,
        id: Uuid,
        step_id: &str,
        approved: bool,
    ) -> Result<ExecutionRecord, DbError> {
        let mut tx = self.pool.begin().await?;
        let mut record = exec_repo::load_execution(&mut tx, id, true).await?;
        check_resolvable(&record, step_id)?;

        exec_repo::resolve_approval(&mut tx, id, step_id, approved).await?;
        if approved {
            record.apply_status(ExecutionStatus::Running, None);
        } else {
            let error = ExecutionError::new(FailureKind::Rejected, "approval rejected")
                .at_step(step_id);
            record.apply_status(ExecutionStatus::Failed, Some(error));
        }
        exec_repo::write_execution_header(&mut tx, &record).await?;

        let record = exec_repo::load_execution(&mut tx, id, false).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<ExecutionRecord>, DbError> {
        let mut conn = self.pool.acquire().await?;
        let ids = exec_repo::list_ids_by_status(&mut conn, &status.to_string()).await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            records.push(exec_repo::load_execution(&mut conn, id, false).await?);
        }
        Ok(records)
    }
}

#[async_trait]
impl DefinitionStore for PgStore {
    async fn put_workflow(&self, row: WorkflowRow) -> Result<WorkflowRow, DbError> {
        wf_repo::upsert_workflow(&self.pool, &row).await
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError> {
        wf_repo::get_workflow(&self.pool, id).await
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRow>, DbError> {
        wf_repo::list_workflows(&self.pool).await
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), DbError> {
        wf_repo::delete_workflow(&self.pool, id).await
    }

    async fn put_plan(&self, row: PlanRow) -> Result<PlanRow, DbError> {
        plan_repo::upsert_plan(&self.pool, &row).await
    }

    async fn get_plan(&self, id: Uuid) -> Result<PlanRow, DbError> {
        plan_repo::get_plan(&self.pool, id).await
    }
}
