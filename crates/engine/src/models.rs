//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow or plan looks
//! like in memory.  They round-trip through the JSONB `definition` column
//! of the `workflows` and `plans` tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use db::models::{ExecutionRecord, ExecutionStatus, PlanRow, WorkflowRow};

use crate::EngineError;

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn enabled() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// How a workflow is started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Triggered by an incoming HTTP request to `/webhook/{path}`.
    Webhook {
        /// URL path segment that identifies this workflow.
        path: String,
    },
    /// Triggered manually via the REST API.
    #[default]
    Manual,
    /// Triggered on a cron schedule by an external scheduler.
    Cron {
        /// Standard cron expression (5 fields).
        expression: String,
    },
}

// ---------------------------------------------------------------------------
// NodeDefinition / Edge
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique identifier within this workflow (referenced by edges).
    pub id: String,
    /// Built-in step type, e.g. `condition` or `api_call`.
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: Value,
    /// Per-attempt timeout override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Retry override; falls back to the workflow's `max_retries`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config,
            timeout_seconds: None,
            max_retries: None,
        }
    }
}

/// Directed edge from one node to another.  A labelled edge is only
/// followed when the origin's branch outcome equals the label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self { from: from.into(), to: to.into(), label: None }
    }

    pub fn labelled(from: impl Into<String>, to: impl Into<String>, label: impl Into<String>) -> Self {
        Self { from: from.into(), to: to.into(), label: Some(label.into()) }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub tenant_id: Uuid,
    pub name: String,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub trigger: Trigger,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Execution-wide time budget.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    /// Receives a POST when an execution reaches a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_url: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Convenience constructor for testing.
    pub fn new(
        name: impl Into<String>,
        trigger: Trigger,
        nodes: Vec<NodeDefinition>,
        edges: Vec<Edge>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            name: name.into(),
            enabled: true,
            trigger,
            nodes,
            edges,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
            notify_url: None,
            created_at: Utc::now(),
        }
    }

    pub fn webhook_path(&self) -> Option<&str> {
        match &self.trigger {
            Trigger::Webhook { path } => Some(path.as_str()),
            _ => None,
        }
    }

    pub fn to_row(&self) -> Result<WorkflowRow, EngineError> {
        Ok(WorkflowRow {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name.clone(),
            enabled: self.enabled,
            definition: serde_json::to_value(self)?,
            created_at: self.created_at,
        })
    }

    /// Columns win over whatever the stored body says.
    pub fn from_row(row: WorkflowRow) -> Result<Self, EngineError> {
        let mut workflow: Workflow = serde_json::from_value(row.definition)?;
        workflow.id = row.id;
        workflow.tenant_id = row.tenant_id;
        workflow.name = row.name;
        workflow.enabled = row.enabled;
        workflow.created_at = row.created_at;
        Ok(workflow)
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One step of an agent plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub requires_approval: bool,
    /// Defaults to `ai_response` prompted with the goal and description.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            requires_approval: false,
            step_type: None,
            config: None,
        }
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn typed(mut self, step_type: impl Into<String>, config: Value) -> Self {
        self.step_type = Some(step_type.into());
        self.config = Some(config);
        self
    }
}

/// An ordered list of steps toward a goal, executed strictly in sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub tenant_id: Uuid,
    pub goal: String,
    pub steps: Vec<PlanStep>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_url: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(goal: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            goal: goal.into(),
            steps,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
            notify_url: None,
            created_at: Utc::now(),
        }
    }

    pub fn to_row(&self) -> Result<PlanRow, EngineError> {
        Ok(PlanRow {
            id: self.id,
            tenant_id: self.tenant_id,
            goal: self.goal.clone(),
            definition: serde_json::to_value(self)?,
            created_at: self.created_at,
        })
    }

    pub fn from_row(row: PlanRow) -> Result<Self, EngineError> {
        let mut plan: Plan = serde_json::from_value(row.definition)?;
        plan.id = row.id;
        plan.tenant_id = row.tenant_id;
        plan.goal = row.goal;
        plan.created_at = row.created_at;
        Ok(plan)
    }

    /// Per-step status derived from an execution record.
    pub fn step_view(&self, record: &ExecutionRecord) -> Vec<PlanStepView> {
        let mut cursor_taken = false;
        self.steps
            .iter()
            .map(|step| {
                let result = record.step_result(&step.id);
                let status = match result {
                    Some(r) if r.succeeded() => PlanStepStatus::Completed,
                    Some(_) => PlanStepStatus::Failed,
                    None if !cursor_taken && record.status == ExecutionStatus::Running => {
                        cursor_taken = true;
                        PlanStepStatus::Running
                    }
                    None => {
                        cursor_taken = true;
                        PlanStepStatus::Pending
                    }
                };
                PlanStepView {
                    id: step.id.clone(),
                    description: step.description.clone(),
                    requires_approval: step.requires_approval,
                    status,
                    result: result.filter(|r| r.succeeded()).map(|r| r.result.clone()),
                    error: result.and_then(|r| r.error.clone()),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStepView {
    pub id: String,
    pub description: String,
    pub requires_approval: bool,
    pub status: PlanStepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::models::{ExecutionTarget, NewExecution, StepResult, TargetKind, TriggerKind};
    use serde_json::json;

    #[test]
    fn workflow_definition_defaults() {
        let wf: Workflow = serde_json::from_value(json!({
            "name": "minimal",
            "nodes": [ { "id": "a", "type": "delay", "config": { "duration_ms": 1 } } ]
        }))
        .unwrap();

        assert!(wf.enabled);
        assert_eq!(wf.trigger, Trigger::Manual);
        assert_eq!(wf.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
        assert_eq!(wf.max_retries, DEFAULT_MAX_RETRIES);
        assert!(wf.edges.is_empty());
        assert_eq!(wf.nodes[0].node_type, "delay");
    }

    #[test]
    fn row_columns_override_stored_body() {
        let wf = Workflow::new("orig", Trigger::Webhook { path: "hook".into() }, vec![], vec![]);
        let mut row = wf.to_row().unwrap();
        row.name = "renamed".into();
        row.enabled = false;

        let back = Workflow::from_row(row).unwrap();
        assert_eq!(back.id, wf.id);
        assert_eq!(back.name, "renamed");
        assert!(!back.enabled);
        assert_eq!(back.webhook_path(), Some("hook"));
    }

    #[test]
    fn plan_view_marks_the_cursor() {
        let plan = Plan::new(
            "ship it",
            vec![PlanStep::new("s1", "draft"), PlanStep::new("s2", "review"), PlanStep::new("s3", "send")],
        );
        let mut record = ExecutionRecord::new(NewExecution {
            target: ExecutionTarget { kind: TargetKind::Plan, id: plan.id },
            tenant_id: Uuid::nil(),
            triggered_by: None,
            trigger_kind: TriggerKind::Api,
            input_data: json!({}),
        });
        record.apply_status(ExecutionStatus::Running, None);
        let now = Utc::now();
        record.step_results.push(StepResult {
            step_id: "s1".into(),
            result: json!({ "text": "draft" }),
            outcome: None,
            error: None,
            attempts: 1,
            error_trail: vec![],
            started_at: now,
            completed_at: now,
        });

        let view = plan.step_view(&record);
        let statuses: Vec<_> = view.iter().map(|v| v.status).collect();
        assert_eq!(
            statuses,
            vec![PlanStepStatus::Completed, PlanStepStatus::Running, PlanStepStatus::Pending]
        );
        assert_eq!(view[0].result, Some(json!({ "text": "draft" })));
    }
}
