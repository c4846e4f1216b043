//! `ExecutionService`: the facade the HTTP layer and the CLI talk to.
//!
//! Triggers create the execution record up front and hand the drive to the
//! worker pool; callers either get the pending record back immediately or
//! wait on the event bus until the execution settles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use db::models::{
    CancelOutcome, ExecutionError, ExecutionRecord, ExecutionStatus, ExecutionTarget,
    FailureKind, NewExecution, TargetKind, TriggerKind,
};
use db::DefinitionStore;
use queue::{JobFailure, JobHandler, PoolConfig, WorkerPool};

use crate::events::{ExecutionEvent, spawn_notification};
use crate::executor::WorkflowExecutor;
use crate::models::{Plan, PlanStepView, Workflow};
use crate::program::Program;
use crate::EngineError;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long a synchronous trigger blocks before returning the current
    /// record.
    pub sync_wait_budget: Duration,
    pub pool: PoolConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            sync_wait_budget: Duration::from_secs(30),
            pool: PoolConfig::default(),
        }
    }
}

/// Who or what is starting an execution.
#[derive(Debug, Clone)]
pub struct TriggerOptions {
    pub kind: TriggerKind,
    pub triggered_by: Option<String>,
    /// Block until the execution settles or the wait budget runs out.
    pub wait: bool,
}

impl TriggerOptions {
    pub fn new(kind: TriggerKind) -> Self {
        Self { kind, triggered_by: None, wait: false }
    }

    pub fn waiting(mut self) -> Self {
        self.wait = true;
        self
    }

    pub fn by(mut self, who: impl Into<String>) -> Self {
        self.triggered_by = Some(who.into());
        self
    }
}

/// Status read model: the record plus the derived plan step list.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionView {
    #[serde(flatten)]
    pub record: ExecutionRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_steps: Option<Vec<PlanStepView>>,
}

/// Work item for the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveJob {
    pub execution_id: Uuid,
    pub mode: DriveMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    /// pending → running, then drive.
    Start,
    /// Continue a running execution.
    Resume,
}

impl DriveJob {
    pub fn start(execution_id: Uuid) -> Self {
        Self { execution_id, mode: DriveMode::Start }
    }

    pub fn resume(execution_id: Uuid) -> Self {
        Self { execution_id, mode: DriveMode::Resume }
    }
}

// ---------------------------------------------------------------------------
// Driver (job handler)
// ---------------------------------------------------------------------------

struct Driver {
    executor: Arc<WorkflowExecutor>,
    definitions: Arc<dyn DefinitionStore>,
}

impl Driver {
    async fn program_for(&self, target: ExecutionTarget) -> Result<Program, EngineError> {
        match target.kind {
            TargetKind::Workflow => {
                let workflow = Workflow::from_row(self.definitions.get_workflow(target.id).await?)?;
                Program::from_workflow(&workflow)
            }
            TargetKind::Plan => {
                let plan = Plan::from_row(self.definitions.get_plan(target.id).await?)?;
                Program::from_plan(&plan)
            }
        }
    }

    async fn notify_url_for(&self, target: ExecutionTarget) -> Option<String> {
        self.program_for(target).await.ok().and_then(|p| p.notify_url)
    }
}

#[async_trait]
impl JobHandler<DriveJob> for Driver {
    async fn handle(&self, job: DriveJob) -> anyhow::Result<()> {
        let record = self.executor.store().load(job.execution_id).await?;

        let program = match self.program_for(record.target).await {
            Ok(program) => program,
            Err(e) if e.is_structural() => {
                let error = ExecutionError::new(FailureKind::Structural, e.to_string());
                self.executor.fail(job.execution_id, error, None).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let record = match job.mode {
            DriveMode::Start => self.executor.run(&program, job.execution_id).await?,
            DriveMode::Resume => self.executor.resume(&program, job.execution_id).await?,
        };
        debug!(execution_id = %record.id, status = %record.status, "driver finished");
        Ok(())
    }

    async fn on_failure(&self, job: DriveJob, failure: JobFailure) {
        let error = ExecutionError::new(FailureKind::Crashed, failure.to_string());
        let notify_url = match self.executor.store().load(job.execution_id).await {
            Ok(record) => self.notify_url_for(record.target).await,
            Err(_) => None,
        };
        if let Err(e) = self.executor.fail(job.execution_id, error, notify_url.as_deref()).await {
            error!(execution_id = %job.execution_id, error = %e, "could not record crashed driver");
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionService
// ---------------------------------------------------------------------------

pub struct ExecutionService {
    executor: Arc<WorkflowExecutor>,
    definitions: Arc<dyn DefinitionStore>,
    driver: Arc<Driver>,
    pool: WorkerPool<DriveJob>,
    config: ServiceConfig,
}

impl ExecutionService {
    /// Starts the worker pool; must be called inside a tokio runtime.
    pub fn new(
        executor: Arc<WorkflowExecutor>,
        definitions: Arc<dyn DefinitionStore>,
        config: ServiceConfig,
    ) -> Self {
        let driver = Arc::new(Driver {
            executor: executor.clone(),
            definitions: definitions.clone(),
        });
        let pool = WorkerPool::start(config.pool.clone(), driver.clone());
        Self { executor, definitions, driver, pool, config }
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor> {
        &self.executor
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and store a workflow.
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<Workflow, EngineError> {
        Program::from_workflow(&workflow)?;
        let row = self.definitions.put_workflow(workflow.to_row()?).await?;
        info!(workflow_id = %row.id, name = %row.name, "workflow registered");
        Workflow::from_row(row)
    }

    pub async fn workflow(&self, id: Uuid) -> Result<Workflow, EngineError> {
        Workflow::from_row(self.definitions.get_workflow(id).await?)
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>, EngineError> {
        let rows = self.definitions.list_workflows().await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id;
                Workflow::from_row(row)
                    .inspect_err(|e| warn!(workflow_id = %id, error = %e, "skipping unreadable workflow"))
                    .ok()
            })
            .collect())
    }

    pub async fn delete_workflow(&self, id: Uuid) -> Result<(), EngineError> {
        self.definitions.delete_workflow(id).await?;
        info!(workflow_id = %id, "workflow deleted");
        Ok(())
    }

    pub async fn register_plan(&self, plan: Plan) -> Result<Plan, EngineError> {
        Program::from_plan(&plan)?;
        let row = self.definitions.put_plan(plan.to_row()?).await?;
        info!(plan_id = %row.id, steps = plan.steps.len(), "plan registered");
        Plan::from_row(row)
    }

    pub async fn plan(&self, id: Uuid) -> Result<Plan, EngineError> {
        Plan::from_row(self.definitions.get_plan(id).await?)
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    #[instrument(skip(self, input, options), fields(trigger = %options.kind))]
    pub async fn trigger_workflow(
        &self,
        workflow_id: Uuid,
        input: Value,
        options: TriggerOptions,
    ) -> Result<ExecutionRecord, EngineError> {
        let workflow = self.workflow(workflow_id).await?;
        if !workflow.enabled {
            return Err(EngineError::WorkflowDisabled(workflow_id));
        }
        let target = ExecutionTarget { kind: TargetKind::Workflow, id: workflow.id };
        let prepared = Program::from_workflow(&workflow);
        self.start(target, workflow.tenant_id, prepared, input, options).await
    }

    /// Trigger the workflow whose webhook trigger is bound to `path`.
    pub async fn trigger_webhook(
        &self,
        path: &str,
        payload: Value,
    ) -> Result<ExecutionRecord, EngineError> {
        let workflow = self
            .list_workflows()
            .await?
            .into_iter()
            .find(|w| w.webhook_path() == Some(path))
            .ok_or_else(|| EngineError::UnknownWebhook(path.to_owned()))?;
        self.trigger_workflow(workflow.id, payload, TriggerOptions::new(TriggerKind::Webhook))
            .await
    }

    #[instrument(skip(self, input, options), fields(trigger = %options.kind))]
    pub async fn start_plan(
        &self,
        plan_id: Uuid,
        input: Value,
        options: TriggerOptions,
    ) -> Result<ExecutionRecord, EngineError> {
        let plan = self.plan(plan_id).await?;
        let target = ExecutionTarget { kind: TargetKind::Plan, id: plan.id };
        let prepared = Program::from_plan(&plan);
        self.start(target, plan.tenant_id, prepared, input, options).await
    }

    async fn start(
        &self,
        target: ExecutionTarget,
        tenant_id: Uuid,
        prepared: Result<Program, EngineError>,
        input: Value,
        options: TriggerOptions,
    ) -> Result<ExecutionRecord, EngineError> {
        let record = self
            .executor
            .create(NewExecution {
                target,
                tenant_id,
                triggered_by: options.triggered_by,
                trigger_kind: options.kind,
                input_data: input,
            })
            .await?;

        // A bad definition still leaves a failed execution behind to inspect.
        let program = match prepared {
            Ok(program) => program,
            Err(e) if e.is_structural() => {
                let error = ExecutionError::new(FailureKind::Structural, e.to_string());
                return self.executor.fail(record.id, error, None).await;
            }
            Err(e) => return Err(e),
        };
        debug!(execution_id = %record.id, steps = program.steps.len(), "program prepared");

        let events = options.wait.then(|| self.executor.events().subscribe());
        self.pool.submit(DriveJob::start(record.id)).await?;

        match events {
            Some(rx) => self.wait_until_settled(record.id, rx).await,
            None => Ok(record),
        }
    }

    /// Block until the execution pauses or finishes, or the wait budget
    /// runs out, then return the stored record.
    async fn wait_until_settled(
        &self,
        execution_id: Uuid,
        mut rx: Receiver<ExecutionEvent>,
    ) -> Result<ExecutionRecord, EngineError> {
        let settled = |status: ExecutionStatus| status.is_terminal() || status == ExecutionStatus::Paused;
        let store = self.executor.store();

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(event) if event.execution_id == execution_id && settled(event.status) => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(%execution_id, skipped, "event receiver lagged");
                        if store.load(execution_id).await.is_ok_and(|r| settled(r.status)) {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };

        if tokio::time::timeout(self.config.sync_wait_budget, wait).await.is_err() {
            info!(%execution_id, budget = ?self.config.sync_wait_budget, "sync wait budget exceeded");
        }
        Ok(store.load(execution_id).await?)
    }

    // -----------------------------------------------------------------------
    // Inspection and control
    // -----------------------------------------------------------------------

    pub async fn status(&self, execution_id: Uuid) -> Result<ExecutionView, EngineError> {
        let record = self.executor.store().load(execution_id).await?;
        let plan_steps = match record.target.kind {
            TargetKind::Plan => match self.plan(record.target.id).await {
                Ok(plan) => Some(plan.step_view(&record)),
                Err(e) => {
                    warn!(%execution_id, error = %e, "plan for execution is unavailable");
                    None
                }
            },
            TargetKind::Workflow => None,
        };
        Ok(ExecutionView { record, plan_steps })
    }

    /// Resolve an approval checkpoint; approval hands the execution back to
    /// the pool at the step it paused in front of.
    pub async fn resolve_approval(
        &self,
        execution_id: Uuid,
        step_id: &str,
        approved: bool,
    ) -> Result<ExecutionRecord, EngineError> {
        let record = self.executor.approvals().resolve(execution_id, step_id, approved).await?;
        if record.status == ExecutionStatus::Running {
            self.pool.submit(DriveJob::resume(execution_id)).await?;
        } else if record.status.is_terminal() {
            if let Some(url) = self.driver.notify_url_for(record.target).await {
                self.notify(&record, url);
            }
        }
        Ok(record)
    }

    /// Request cancellation.  Running executions stop at their next step
    /// boundary; pending and paused ones are cancelled immediately.
    pub async fn cancel(
        &self,
        execution_id: Uuid,
    ) -> Result<(CancelOutcome, ExecutionRecord), EngineError> {
        let outcome = self.executor.store().request_cancel(execution_id).await?;
        let record = self.executor.store().load(execution_id).await?;
        info!(%execution_id, ?outcome, status = %record.status, "cancel requested");

        if outcome == CancelOutcome::Cancelled {
            self.executor.events().publish(ExecutionEvent::from_record(&record));
            if let Some(url) = self.driver.notify_url_for(record.target).await {
                self.notify(&record, url);
            }
        }
        Ok((outcome, record))
    }

    /// Re-submit every pending or running execution, e.g. after a restart.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let store = self.executor.store();
        let mut submitted = 0;

        for record in store.list_by_status(ExecutionStatus::Pending).await? {
            self.pool.submit(DriveJob::start(record.id)).await?;
            submitted += 1;
        }
        for record in store.list_by_status(ExecutionStatus::Running).await? {
            self.pool.submit(DriveJob::resume(record.id)).await?;
            submitted += 1;
        }

        info!(submitted, "recovered unfinished executions");
        Ok(submitted)
    }

    /// Stop accepting work and wait for in-flight drivers.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    fn notify(&self, record: &ExecutionRecord, url: String) {
        if let Some(notifier) = self.executor.notifier() {
            spawn_notification(notifier.clone(), record.clone(), url);
        }
    }
}
