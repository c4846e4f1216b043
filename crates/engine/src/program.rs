//! Executable form of a workflow or plan.
//!
//! A [`Program`] is built once per driver run: the graph is validated and
//! every step config is parsed into a typed [`StepConfig`], so the driver
//! never sees raw definition JSON.

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use db::models::{ExecutionTarget, TargetKind};
use nodes::{AiResponseConfig, StepConfig};

use crate::{
    dag::validate_dag,
    models::{Edge, Plan, Workflow},
    EngineError,
};

#[derive(Debug, Clone)]
pub struct PreparedStep {
    pub id: String,
    pub config: StepConfig,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub requires_approval: bool,
}

/// How the resolver walks the steps.
#[derive(Debug, Clone)]
pub enum Shape {
    /// Workflow DAG.  `order` holds step indices in topological order.
    Graph { edges: Vec<Edge>, order: Vec<usize> },
    /// Plan: steps run strictly in definition order.
    Linear,
}

#[derive(Debug, Clone)]
pub struct Program {
    pub target: ExecutionTarget,
    pub tenant_id: Uuid,
    /// Steps in definition order.
    pub steps: Vec<PreparedStep>,
    pub shape: Shape,
    /// Execution-wide time budget.
    pub timeout: Duration,
    pub max_retries: u32,
    pub notify_url: Option<String>,
}

impl Program {
    pub fn from_workflow(workflow: &Workflow) -> Result<Self, EngineError> {
        let sorted = validate_dag(workflow)?;

        let steps = workflow
            .nodes
            .iter()
            .map(|node| {
                let config = StepConfig::parse(&node.node_type, &node.config).map_err(|source| {
                    EngineError::InvalidConfig { step_id: node.id.clone(), source }
                })?;
                Ok(PreparedStep {
                    id: node.id.clone(),
                    config,
                    timeout: node.timeout_seconds.map(Duration::from_secs),
                    max_retries: node.max_retries,
                    requires_approval: false,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        let order = sorted
            .iter()
            .filter_map(|id| steps.iter().position(|s| &s.id == id))
            .collect();

        Ok(Self {
            target: ExecutionTarget { kind: TargetKind::Workflow, id: workflow.id },
            tenant_id: workflow.tenant_id,
            steps,
            shape: Shape::Graph { edges: workflow.edges.clone(), order },
            timeout: Duration::from_secs(workflow.timeout_seconds),
            max_retries: workflow.max_retries,
            notify_url: workflow.notify_url.clone(),
        })
    }

    pub fn from_plan(plan: &Plan) -> Result<Self, EngineError> {
        let mut seen = std::collections::HashSet::new();
        let mut steps = Vec::with_capacity(plan.steps.len());

        for step in &plan.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(EngineError::DuplicateNodeId(step.id.clone()));
            }

            let config = match &step.step_type {
                Some(ty) => {
                    let raw = step.config.clone().unwrap_or_else(|| json!({}));
                    StepConfig::parse(ty, &raw)
                }
                None => Ok(StepConfig::AiResponse(AiResponseConfig {
                    prompt: format!("Goal: {}\nStep: {}", plan.goal, step.description),
                    model: None,
                    max_tokens: None,
                })),
            }
            .map_err(|source| EngineError::InvalidConfig { step_id: step.id.clone(), source })?;

            steps.push(PreparedStep {
                id: step.id.clone(),
                config,
                timeout: None,
                max_retries: None,
                requires_approval: step.requires_approval,
            });
        }

        Ok(Self {
            target: ExecutionTarget { kind: TargetKind::Plan, id: plan.id },
            tenant_id: plan.tenant_id,
            steps,
            shape: Shape::Linear,
            timeout: Duration::from_secs(plan.timeout_seconds),
            max_retries: plan.max_retries,
            notify_url: plan.notify_url.clone(),
        })
    }

    pub fn step(&self, id: &str) -> Option<&PreparedStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeDefinition, PlanStep, Trigger};

    #[test]
    fn workflow_configs_are_parsed_up_front() {
        let wf = Workflow::new(
            "bad",
            Trigger::Manual,
            vec![NodeDefinition::new("a", "delay", json!({ "duration_ms": "soon" }))],
            vec![],
        );
        let err = Program::from_workflow(&wf).unwrap_err();
        assert!(matches!(&err, EngineError::InvalidConfig { step_id, .. } if step_id == "a"));
        assert!(err.is_structural());
    }

    #[test]
    fn workflow_order_follows_edges() {
        let wf = Workflow::new(
            "ordered",
            Trigger::Manual,
            vec![
                NodeDefinition::new("last", "delay", json!({ "duration_ms": 1 })),
                NodeDefinition::new("first", "delay", json!({ "duration_ms": 1 })),
            ],
            vec![Edge::new("first", "last")],
        );
        let program = Program::from_workflow(&wf).unwrap();
        match program.shape {
            Shape::Graph { order, .. } => assert_eq!(order, vec![1, 0]),
            Shape::Linear => panic!("workflow must be a graph"),
        }
    }

    #[test]
    fn untyped_plan_steps_prompt_the_generator() {
        let plan = Plan::new(
            "Plan a launch",
            vec![
                PlanStep::new("s1", "List channels"),
                PlanStep::new("s2", "Wait").typed("delay", json!({ "duration_ms": 10 })).with_approval(),
            ],
        );
        let program = Program::from_plan(&plan).unwrap();

        match &program.steps[0].config {
            StepConfig::AiResponse(cfg) => {
                assert_eq!(cfg.prompt, "Goal: Plan a launch\nStep: List channels");
            }
            other => panic!("unexpected config {other:?}"),
        }
        assert!(program.steps[1].requires_approval);
        assert_eq!(program.target.kind, TargetKind::Plan);
    }

    #[test]
    fn duplicate_plan_step_ids_are_rejected() {
        let plan = Plan::new("g", vec![PlanStep::new("s", "a"), PlanStep::new("s", "b")]);
        assert!(matches!(Program::from_plan(&plan), Err(EngineError::DuplicateNodeId(_))));
    }
}
