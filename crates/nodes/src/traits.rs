//! The `ExecutableNode` trait: the contract every step handler fulfils.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{NodeError, StepConfig};

/// Everything a step can see while it runs.
///
/// Defined here (in the nodes crate) so both the engine and individual node
/// implementations can import it without a circular dependency.  Owned by
/// the single task running the step; the engine builds a fresh one per
/// attempt from the persisted record.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    /// Workflow or plan being executed.
    pub target_id: Uuid,
    pub tenant_id: Uuid,
    /// Id of the step this context was built for.
    pub step_id: String,
    /// 1-based attempt counter.
    pub attempt: u32,
    /// Trigger payload, immutable for the lifetime of the execution.
    pub input: Value,
    /// Outputs of completed upstream steps, keyed by step id.
    pub outputs: BTreeMap<String, Value>,
    /// Point in time after which the engine abandons this attempt.
    pub deadline: tokio::time::Instant,
}

impl ExecutionContext {
    /// The document expressions and templates are evaluated against:
    /// `{ "input": …, "steps": { "<id>": … } }`.
    pub fn as_json(&self) -> Value {
        json!({
            "input": self.input,
            "steps": self.outputs,
        })
    }
}

/// What a step hands back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Value downstream steps see under `steps.<id>`.
    pub value: Value,
    /// Branch label used by the graph resolver (`condition` steps only).
    pub branch: Option<String>,
}

impl StepOutput {
    pub fn value(value: Value) -> Self {
        Self { value, branch: None }
    }

    pub fn branch(label: impl Into<String>) -> Self {
        Self { value: Value::Null, branch: Some(label.into()) }
    }
}

/// The core node trait.
///
/// Built-in step types and test doubles implement this; the registry owns
/// them as `Arc<dyn ExecutableNode>`.
#[async_trait]
pub trait ExecutableNode: Send + Sync {
    /// Run one attempt of the step described by `config`.
    async fn execute(
        &self,
        config: &StepConfig,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput, NodeError>;
}
