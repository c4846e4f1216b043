//! Persisted records for definitions and executions.
//!
//! Definition rows carry their JSON body untouched; the domain shape of a
//! workflow or plan lives in the `engine` crate.  Execution records are
//! defined here because the stores enforce their invariants (forward-only
//! status transitions, append-only step results).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// workflows / plans
// ---------------------------------------------------------------------------

/// A persisted workflow definition row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub enabled: bool,
    /// Full JSON workflow definition (nodes, edges, trigger, …)
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A persisted agent plan definition row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub goal: String,
    /// Full JSON plan definition (goal, steps, limits).
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// execution status
// ---------------------------------------------------------------------------

/// Lifecycle of an execution.
///
/// `pending → running → (paused ⇄ running)* → {completed, failed, cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// `completed`, `failed` and `cancelled` admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Failed | Cancelled)
                | (Running, Paused | Completed | Failed | Cancelled)
                | (Paused, Running | Failed | Cancelled)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"   => Ok(Self::Pending),
            "running"   => Ok(Self::Running),
            "paused"    => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed"    => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other       => Err(format!("unknown execution status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// execution metadata
// ---------------------------------------------------------------------------

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Schedule,
    Webhook,
    Api,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual   => write!(f, "manual"),
            Self::Schedule => write!(f, "schedule"),
            Self::Webhook  => write!(f, "webhook"),
            Self::Api      => write!(f, "api"),
        }
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual"   => Ok(Self::Manual),
            "schedule" => Ok(Self::Schedule),
            "webhook"  => Ok(Self::Webhook),
            "api"      => Ok(Self::Api),
            other      => Err(format!("unknown trigger kind: {other}")),
        }
    }
}

/// Which kind of definition an execution runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Workflow,
    Plan,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workflow => write!(f, "workflow"),
            Self::Plan     => write!(f, "plan"),
        }
    }
}

impl std::str::FromStr for TargetKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow" => Ok(Self::Workflow),
            "plan"     => Ok(Self::Plan),
            other      => Err(format!("unknown target kind: {other}")),
        }
    }
}

/// Reference from an execution to the definition it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTarget {
    pub kind: TargetKind,
    pub id: Uuid,
}

/// Classification of a top-level execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed graph, invalid step config, or a resolver stall.
    Structural,
    /// A step ran out of time on every permitted attempt.
    StepTimeout,
    /// A step's collaborator reported a failure.
    StepExecution,
    /// A human rejected an approval checkpoint.
    Rejected,
    /// The execution-wide time budget was exhausted.
    Timeout,
    /// The background driver crashed.
    Crashed,
}

/// Top-level failure (or cancellation) reason recorded on an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), step_id: None }
    }

    pub fn at_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step_id {
            Some(step) => write!(f, "{:?} at step '{}': {}", self.kind, step, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// step results / approvals
// ---------------------------------------------------------------------------

/// The resolved outcome of one step.  Only written once the step has
/// finished (successfully or not); in-flight steps are never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    /// Output visible to downstream steps (`null` on failure).
    pub result: serde_json::Value,
    /// Branch label chosen by a `condition` step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Final error, when the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Total attempts made, including the final one.
    pub attempts: u32,
    /// Errors of the attempts that preceded the final one.
    #[serde(default)]
    pub error_trail: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Content equality ignoring timing, used for idempotent appends.
    pub fn same_outcome(&self, other: &StepResult) -> bool {
        self.step_id == other.step_id
            && self.result == other.result
            && self.outcome == other.outcome
            && self.error == other.error
    }

    /// Wall-clock time spent on this step, retries included.
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}

/// One approval checkpoint.  `approved` stays `None` until resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub step_id: String,
    pub approved: Option<bool>,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// execution record
// ---------------------------------------------------------------------------

/// Input for [`crate::ExecutionStore::create`].
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub target: ExecutionTarget,
    pub tenant_id: Uuid,
    pub triggered_by: Option<String>,
    pub trigger_kind: TriggerKind,
    pub input_data: serde_json::Value,
}

/// Full state of one execution; the single source of truth for resumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub target: ExecutionTarget,
    pub tenant_id: Uuid,
    pub triggered_by: Option<String>,
    pub trigger_kind: TriggerKind,
    pub status: ExecutionStatus,
    pub input_data: serde_json::Value,
    pub step_results: Vec<StepResult>,
    pub approvals: Vec<ApprovalRecord>,
    pub awaiting_step: Option<String>,
    pub cancel_requested: bool,
    pub error: Option<ExecutionError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Build a fresh `pending` record.
    pub fn new(new: NewExecution) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: new.target,
            tenant_id: new.tenant_id,
            triggered_by: new.triggered_by,
            trigger_kind: new.trigger_kind,
            status: ExecutionStatus::Pending,
            input_data: new.input_data,
            step_results: Vec::new(),
            approvals: Vec::new(),
            awaiting_step: None,
            cancel_requested: false,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn step_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }

    pub fn approval(&self, step_id: &str) -> Option<&ApprovalRecord> {
        self.approvals.iter().find(|a| a.step_id == step_id)
    }

    /// `true` once a human has approved the checkpoint in front of `step_id`.
    pub fn is_approved(&self, step_id: &str) -> bool {
        self.approval(step_id).and_then(|a| a.approved) == Some(true)
    }

    /// Time spent running steps.  Steps dispatched together share a
    /// `started_at`; such a wave counts once, for its slowest step.
    pub fn active_duration(&self) -> chrono::Duration {
        let mut waves: BTreeMap<DateTime<Utc>, chrono::Duration> = BTreeMap::new();
        for result in &self.step_results {
            let longest = waves.entry(result.started_at).or_insert_with(chrono::Duration::zero);
            *longest = (*longest).max(result.duration());
        }
        waves.into_values().fold(chrono::Duration::zero(), |acc, d| acc + d)
    }

    /// Apply a validated status change in memory, maintaining the
    /// `completed_at ⇔ terminal` invariant.  Callers check
    /// [`ExecutionStatus::can_transition_to`] first.
    pub fn apply_status(&mut self, next: ExecutionStatus, error: Option<ExecutionError>) {
        let now = Utc::now();
        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next != ExecutionStatus::Paused {
            self.awaiting_step = None;
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        if error.is_some() {
            self.error = error;
        }
        self.status = next;
    }
}

/// Result of an idempotent step-result append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// An identical result for the same step was already stored.
    Duplicate,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// A running execution was flagged; it stops at the next step boundary.
    Requested,
    /// A pending or paused execution was cancelled on the spot.
    Cancelled,
    /// The execution had already reached a terminal status.
    Rejected,
}

impl CancelOutcome {
    pub fn accepted(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// A compare-and-set status change.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    /// The status the caller believes the execution is in.
    pub expected: ExecutionStatus,
    pub next: ExecutionStatus,
    pub error: Option<ExecutionError>,
}

impl StatusUpdate {
    pub fn new(expected: ExecutionStatus, next: ExecutionStatus) -> Self {
        Self { expected, next, error: None }
    }

    pub fn with_error(mut self, error: ExecutionError) -> Self {
        self.error = Some(error);
        self
    }
}

// ---------------------------------------------------------------------------
// execution rows (Postgres backend)
// ---------------------------------------------------------------------------

/// A row of the `executions` table.
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub target_kind: String,
    pub target_id: Uuid,
    pub tenant_id: Uuid,
    pub triggered_by: Option<String>,
    pub trigger_kind: String,
    pub status: String,
    pub input_data: serde_json::Value,
    pub awaiting_step: Option<String>,
    pub cancel_requested: bool,
    pub error: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A row of the `step_results` table.
#[derive(Debug, Clone, FromRow)]
pub struct StepResultRow {
    pub step_id: String,
    pub result: serde_json::Value,
    pub outcome: Option<String>,
    pub error: Option<String>,
    pub attempts: i32,
    pub error_trail: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// A row of the `approvals` table.
#[derive(Debug, Clone, FromRow)]
pub struct ApprovalRow {
    pub step_id: String,
    pub approved: Option<bool>,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> ExecutionRecord {
        ExecutionRecord::new(NewExecution {
            target: ExecutionTarget { kind: TargetKind::Workflow, id: Uuid::new_v4() },
            tenant_id: Uuid::new_v4(),
            triggered_by: None,
            trigger_kind: TriggerKind::Manual,
            input_data: json!({}),
        })
    }

    #[test]
    fn terminal_statuses_admit_no_transitions() {
        use ExecutionStatus::*;
        for from in [Completed, Failed, Cancelled] {
            for to in [Pending, Running, Paused, Completed, Failed, Cancelled] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn pause_round_trip_is_permitted() {
        use ExecutionStatus::*;
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Paused));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn status_parses_its_display_form() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Paused,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert!("succeeded".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn completed_at_tracks_terminal_status() {
        let mut rec = record();
        assert!(rec.completed_at.is_none());

        rec.apply_status(ExecutionStatus::Running, None);
        assert!(rec.started_at.is_some());
        assert!(rec.completed_at.is_none());

        rec.apply_status(ExecutionStatus::Paused, None);
        assert!(rec.completed_at.is_none());

        rec.apply_status(ExecutionStatus::Cancelled, None);
        assert!(rec.completed_at.is_some());
    }

    #[test]
    fn same_outcome_ignores_timestamps() {
        let now = Utc::now();
        let a = StepResult {
            step_id: "a".into(),
            result: json!({ "x": 1 }),
            outcome: None,
            error: None,
            attempts: 1,
            error_trail: vec![],
            started_at: now,
            completed_at: now,
        };
        let mut b = a.clone();
        b.started_at = now + chrono::Duration::seconds(5);
        b.completed_at = now + chrono::Duration::seconds(6);
        assert!(a.same_outcome(&b));

        b.result = json!({ "x": 2 });
        assert!(!a.same_outcome(&b));
    }

    #[test]
    fn a_parallel_wave_counts_once_towards_active_duration() {
        let wave = Utc::now();
        let secs = chrono::Duration::seconds;
        let step = |id: &str, started_at: DateTime<Utc>, took: i64| StepResult {
            step_id: id.into(),
            result: json!(null),
            outcome: None,
            error: None,
            attempts: 1,
            error_trail: vec![],
            started_at,
            completed_at: started_at + secs(took),
        };

        let mut rec = record();
        rec.step_results = vec![
            step("root", wave - secs(10), 1),
            step("p1", wave, 2),
            step("p2", wave, 3),
            step("p3", wave, 2),
            step("join", wave + secs(3), 1),
        ];
        assert_eq!(rec.active_duration(), secs(5));
    }
}
