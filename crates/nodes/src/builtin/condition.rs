use async_trait::async_trait;

use crate::{ExecutableNode, ExecutionContext, NodeError, StepConfig, StepKind, StepOutput};

/// Evaluates a boolean expression and reports the branch to follow.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionNode;

#[async_trait]
impl ExecutableNode for ConditionNode {
    async fn execute(
        &self,
        config: &StepConfig,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput, NodeError> {
        let StepConfig::Condition(cfg) = config else {
            return Err(super::mismatched(StepKind::Condition, config));
        };

        let branch = cfg.expr().eval(&ctx.as_json());
        Ok(StepOutput::branch(branch.to_string()))
    }
}
