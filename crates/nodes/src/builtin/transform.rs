use async_trait::async_trait;

use crate::{
    expr::render_value, ExecutableNode, ExecutionContext, NodeError, StepConfig, StepKind,
    StepOutput,
};

/// Reshapes context data.  No I/O, so every failure is a config bug.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransformNode;

#[async_trait]
impl ExecutableNode for TransformNode {
    async fn execute(
        &self,
        config: &StepConfig,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput, NodeError> {
        let StepConfig::Transform(cfg) = config else {
            return Err(super::mismatched(StepKind::Transform, config));
        };

        let value = render_value(&cfg.template, &ctx.as_json(), true)
            .map_err(|e| NodeError::Fatal(e.to_string()))?;
        Ok(StepOutput::value(value))
    }
}
