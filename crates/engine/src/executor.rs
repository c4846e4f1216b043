//! Workflow execution engine.
//!
//! `WorkflowExecutor` is the central orchestrator:
//! 1. Moves a pending execution to running (compare-and-set, so exactly one
//!    driver wins).
//! 2. At every step boundary reloads the record and checks ownership,
//!    cancellation, the time budget and previously failed steps.
//! 3. Asks the resolver for runnable steps and dispatches them in waves of
//!    up to `max_parallel`, each through the `StepRegistry`.
//! 4. Persists each step result once, in resolver order.
//! 5. Retries `retryable` failures with exponential back-off and fails the
//!    execution on anything else.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use db::models::{
    AppendOutcome, ExecutionError, ExecutionRecord, ExecutionStatus, FailureKind, NewExecution,
    StatusUpdate, StepResult,
};
use db::{DbError, ExecutionStore};
use nodes::{ExecutionContext, StepError, StepRegistry};

use crate::approval::ApprovalGate;
use crate::events::{spawn_notification, EventBus, ExecutionEvent, Notifier};
use crate::program::{PreparedStep, Program};
use crate::resolver::{next_runnable, Resolution};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,
    /// Upper bound on steps dispatched concurrently within one execution.
    pub max_parallel: usize,
    /// Per-attempt timeout for steps without their own.
    pub default_step_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry_base_delay: Duration::from_millis(100),
            max_parallel: 4,
            default_step_timeout: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Drives executions of prepared programs against an `ExecutionStore`.
///
/// Holds no per-execution state: every decision is made from the record
/// reloaded at the step boundary, so any instance can resume any execution.
pub struct WorkflowExecutor {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<StepRegistry>,
    config: ExecutorConfig,
    events: EventBus,
    approvals: ApprovalGate,
    notifier: Option<Arc<dyn Notifier>>,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<StepRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        let events = EventBus::default();
        Self {
            approvals: ApprovalGate::new(store.clone(), events.clone()),
            store,
            registry,
            config,
            events,
            notifier: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.approvals = ApprovalGate::new(self.store.clone(), events.clone());
        self.events = events;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn approvals(&self) -> &ApprovalGate {
        &self.approvals
    }

    pub fn notifier(&self) -> Option<&Arc<dyn Notifier>> {
        self.notifier.as_ref()
    }

    /// Persist a new execution in `pending`.
    pub async fn create(&self, new: NewExecution) -> Result<ExecutionRecord, EngineError> {
        let record = self.store.create(new).await?;
        info!(execution_id = %record.id, target = %record.target.id, "execution created");
        Ok(record)
    }

    /// Start a pending execution and drive it until it pauses or finishes.
    ///
    /// Returns the record untouched when the execution is not pending; a
    /// concurrent trigger that lost the race never drives.
    #[instrument(skip(self, program), fields(target_id = %program.target.id))]
    pub async fn run(
        &self,
        program: &Program,
        execution_id: Uuid,
    ) -> Result<ExecutionRecord, EngineError> {
        let update = StatusUpdate::new(ExecutionStatus::Pending, ExecutionStatus::Running);
        match self.store.update_status(execution_id, update).await {
            Ok(_) => {
                info!(%execution_id, steps = program.steps.len(), "execution started");
                self.drive(program, execution_id).await
            }
            Err(DbError::InvalidTransition { from, .. }) => {
                debug!(%execution_id, %from, "execution not pending; not driving");
                Ok(self.store.load(execution_id).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Continue a `running` execution, e.g. after a restart or approval.
    /// No-op for any other status.
    #[instrument(skip(self, program), fields(target_id = %program.target.id))]
    pub async fn resume(
        &self,
        program: &Program,
        execution_id: Uuid,
    ) -> Result<ExecutionRecord, EngineError> {
        let record = self.store.load(execution_id).await?;
        if record.status != ExecutionStatus::Running {
            debug!(%execution_id, status = %record.status, "nothing to resume");
            return Ok(record);
        }
        info!(%execution_id, completed = record.step_results.len(), "resuming execution");
        self.drive(program, execution_id).await
    }

    /// Fail a non-terminal execution outside the drive loop (bad definition,
    /// crashed driver).
    pub async fn fail(
        &self,
        execution_id: Uuid,
        error: ExecutionError,
        notify_url: Option<&str>,
    ) -> Result<ExecutionRecord, EngineError> {
        let record = self.store.load(execution_id).await?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        error!(%execution_id, %error, "failing execution");
        let update = StatusUpdate::new(record.status, ExecutionStatus::Failed).with_error(error);
        self.transition(execution_id, update, notify_url).await
    }

    // -----------------------------------------------------------------------
    // Drive loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        program: &Program,
        execution_id: Uuid,
    ) -> Result<ExecutionRecord, EngineError> {
        let notify_url = program.notify_url.as_deref();
        // Failure kinds of steps that failed in this process.
        let mut failure_kinds: HashMap<String, FailureKind> = HashMap::new();

        loop {
            let record = self.store.load(execution_id).await?;

            if record.status != ExecutionStatus::Running {
                debug!(%execution_id, status = %record.status, "driver releasing execution");
                return Ok(record);
            }

            if record.cancel_requested {
                info!(%execution_id, "cancellation observed at step boundary");
                let update = StatusUpdate::new(ExecutionStatus::Running, ExecutionStatus::Cancelled);
                return self.transition(execution_id, update, notify_url).await;
            }

            let Some(remaining) = remaining_budget(program, &record) else {
                warn!(%execution_id, budget = ?program.timeout, "execution time budget exhausted");
                let error = ExecutionError::new(
                    FailureKind::Timeout,
                    format!("execution exceeded its {}s time budget", program.timeout.as_secs()),
                );
                let update = StatusUpdate::new(ExecutionStatus::Running, ExecutionStatus::Cancelled)
                    .with_error(error);
                return self.transition(execution_id, update, notify_url).await;
            };

            if let Some(failed) = record.step_results.iter().find(|r| !r.succeeded()) {
                let kind = failure_kinds
                    .get(&failed.step_id)
                    .copied()
                    .unwrap_or(FailureKind::StepExecution);
                let error = ExecutionError::new(kind, failed.error.clone().unwrap_or_default())
                    .at_step(&failed.step_id);
                let update =
                    StatusUpdate::new(ExecutionStatus::Running, ExecutionStatus::Failed).with_error(error);
                return self.transition(execution_id, update, notify_url).await;
            }

            let ready = match next_runnable(program, &record, &HashSet::new()) {
                Resolution::Terminal => {
                    info!(%execution_id, steps = record.step_results.len(), "execution completed");
                    let update =
                        StatusUpdate::new(ExecutionStatus::Running, ExecutionStatus::Completed);
                    return self.transition(execution_id, update, notify_url).await;
                }
                Resolution::AwaitingApproval(step_id) => {
                    return match self.approvals.request_approval(execution_id, &step_id).await {
                        Err(EngineError::Database(DbError::InvalidTransition { .. })) => {
                            Ok(self.store.load(execution_id).await?)
                        }
                        other => other,
                    };
                }
                Resolution::Stall(pending) => {
                    let error = ExecutionError::new(
                        FailureKind::Structural,
                        EngineError::Stall { pending }.to_string(),
                    );
                    let update = StatusUpdate::new(ExecutionStatus::Running, ExecutionStatus::Failed)
                        .with_error(error);
                    return self.transition(execution_id, update, notify_url).await;
                }
                Resolution::Ready(ids) if ids.is_empty() => {
                    let error = ExecutionError::new(
                        FailureKind::Structural,
                        EngineError::Stall { pending: Vec::new() }.to_string(),
                    );
                    let update = StatusUpdate::new(ExecutionStatus::Running, ExecutionStatus::Failed)
                        .with_error(error);
                    return self.transition(execution_id, update, notify_url).await;
                }
                Resolution::Ready(ids) => ids,
            };

            let wave: Vec<&PreparedStep> = ready
                .iter()
                .take(self.config.max_parallel.max(1))
                .filter_map(|id| program.step(id))
                .collect();

            let wave_ids: Vec<&str> = wave.iter().map(|s| s.id.as_str()).collect();
            debug!(%execution_id, wave = ?wave_ids, "dispatching");

            for run in self.dispatch_wave(program, &record, wave, remaining).await {
                if let Some(kind) = run.failure {
                    failure_kinds.insert(run.result.step_id.clone(), kind);
                }
                let step_id = run.result.step_id.clone();
                match self.store.append_step_result(execution_id, run.result).await {
                    Ok(AppendOutcome::Appended) => debug!(%execution_id, %step_id, "step result recorded"),
                    Ok(AppendOutcome::Duplicate) => {
                        debug!(%execution_id, %step_id, "step result already recorded")
                    }
                    Err(DbError::StepResultConflict { .. }) => {
                        warn!(%execution_id, %step_id, "another driver recorded a different result");
                    }
                    Err(DbError::InvalidTransition { .. }) => {
                        warn!(%execution_id, %step_id, "execution finished while step was in flight");
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    /// Run a wave concurrently.  Results come back in wave order.
    async fn dispatch_wave(
        &self,
        program: &Program,
        record: &ExecutionRecord,
        wave: Vec<&PreparedStep>,
        remaining: Duration,
    ) -> Vec<StepRun> {
        let outputs: BTreeMap<String, Value> = record
            .step_results
            .iter()
            .filter(|r| r.succeeded())
            .map(|r| (r.step_id.clone(), r.result.clone()))
            .collect();
        let deadline = Instant::now() + remaining;
        let wave_started = Utc::now();

        let handles: Vec<_> = wave
            .into_iter()
            .map(|step| {
                let runner = StepRunner {
                    registry: self.registry.clone(),
                    retry_base_delay: self.config.retry_base_delay,
                    max_attempts: 1 + step.max_retries.unwrap_or(program.max_retries),
                    step_timeout: step.timeout.unwrap_or(self.config.default_step_timeout),
                };
                let ctx = ExecutionContext {
                    execution_id: record.id,
                    target_id: program.target.id,
                    tenant_id: record.tenant_id,
                    step_id: step.id.clone(),
                    attempt: 1,
                    input: record.input_data.clone(),
                    outputs: outputs.clone(),
                    deadline,
                };
                let step = step.clone();
                (step.id.clone(), tokio::spawn(runner.run(step, ctx, wave_started)))
            })
            .collect();

        let mut runs = Vec::with_capacity(handles.len());
        for (step_id, handle) in handles {
            match handle.await {
                Ok(run) => runs.push(run),
                Err(join_err) => {
                    error!(execution_id = %record.id, %step_id, error = %join_err, "step task panicked");
                    runs.push(StepRun::failed(
                        step_id,
                        1,
                        Vec::new(),
                        format!("step panicked: {join_err}"),
                        FailureKind::StepExecution,
                        wave_started,
                        Utc::now(),
                    ));
                }
            }
        }
        runs
    }

    async fn transition(
        &self,
        execution_id: Uuid,
        update: StatusUpdate,
        notify_url: Option<&str>,
    ) -> Result<ExecutionRecord, EngineError> {
        match self.store.update_status(execution_id, update).await {
            Ok(record) => {
                self.announce(&record, notify_url);
                Ok(record)
            }
            Err(DbError::InvalidTransition { from, to, .. }) => {
                warn!(%execution_id, %from, %to, "status changed underneath the driver");
                Ok(self.store.load(execution_id).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn announce(&self, record: &ExecutionRecord, notify_url: Option<&str>) {
        info!(execution_id = %record.id, status = %record.status, "execution status changed");
        self.events.publish(ExecutionEvent::from_record(record));
        if record.status.is_terminal() {
            if let (Some(notifier), Some(url)) = (&self.notifier, notify_url) {
                spawn_notification(notifier.clone(), record.clone(), url.to_owned());
            }
        }
    }
}

/// Time left in the execution budget, `None` once it is used up.
fn remaining_budget(program: &Program, record: &ExecutionRecord) -> Option<Duration> {
    let spent = record.active_duration().to_std().unwrap_or_default();
    program.timeout.checked_sub(spent).filter(|d| !d.is_zero())
}

// ---------------------------------------------------------------------------
// Internal: execute a single step with retry logic.
// ---------------------------------------------------------------------------

struct StepRun {
    result: StepResult,
    /// Set when the step failed for good.
    failure: Option<FailureKind>,
}

impl StepRun {
    fn failed(
        step_id: String,
        attempts: u32,
        error_trail: Vec<String>,
        message: String,
        kind: FailureKind,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            result: StepResult {
                step_id,
                result: Value::Null,
                outcome: None,
                error: Some(message),
                attempts,
                error_trail,
                started_at,
                completed_at,
            },
            failure: Some(kind),
        }
    }
}

struct StepRunner {
    registry: Arc<StepRegistry>,
    retry_base_delay: Duration,
    max_attempts: u32,
    step_timeout: Duration,
}

impl StepRunner {
    /// `started_at` is shared by every step of the wave; the execution
    /// budget charges a wave once.
    async fn run(
        self,
        step: PreparedStep,
        mut ctx: ExecutionContext,
        started_at: DateTime<Utc>,
    ) -> StepRun {
        let clock = Instant::now();
        // Durations feed the execution budget, so they follow the runtime clock.
        let finished_at = |clock: Instant| {
            started_at
                + chrono::Duration::from_std(clock.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
        };
        let mut error_trail = Vec::new();

        loop {
            let left = ctx.deadline.saturating_duration_since(Instant::now());
            let timeout = self.step_timeout.min(left);

            let err = match self.registry.execute(&step.config, &ctx, timeout).await {
                Ok(output) => {
                    debug!(step_id = %step.id, attempt = ctx.attempt, "step succeeded");
                    return StepRun {
                        result: StepResult {
                            step_id: step.id,
                            result: output.value,
                            outcome: output.branch,
                            error: None,
                            attempts: ctx.attempt,
                            error_trail,
                            started_at,
                            completed_at: finished_at(clock),
                        },
                        failure: None,
                    };
                }
                Err(err) => err,
            };

            let budget_left = Instant::now() < ctx.deadline;
            if err.is_retryable() && ctx.attempt < self.max_attempts && budget_left {
                let delay = self
                    .retry_base_delay
                    .saturating_mul(2u32.saturating_pow(ctx.attempt - 1));
                warn!(
                    step_id = %step.id,
                    attempt = ctx.attempt,
                    max_attempts = self.max_attempts,
                    ?delay,
                    error = %err,
                    "retryable step error, backing off"
                );
                error_trail.push(err.to_string());
                tokio::time::sleep(delay.min(ctx.deadline.saturating_duration_since(Instant::now())))
                    .await;
                ctx.attempt += 1;
                continue;
            }

            warn!(step_id = %step.id, attempt = ctx.attempt, error = %err, "step failed");
            return StepRun::failed(
                step.id,
                ctx.attempt,
                error_trail,
                err.to_string(),
                failure_kind(&err),
                started_at,
                finished_at(clock),
            );
        }
    }
}

fn failure_kind(err: &StepError) -> FailureKind {
    if err.is_timeout() {
        FailureKind::StepTimeout
    } else {
        FailureKind::StepExecution
    }
}
