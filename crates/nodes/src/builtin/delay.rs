use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::{ExecutableNode, ExecutionContext, NodeError, StepConfig, StepKind, StepOutput};

/// Hard ceiling on a single delay step, whatever the config asks for.
pub const MAX_DELAY: Duration = Duration::from_secs(5);

/// Suspends the step (never the engine) for the configured duration.
#[derive(Debug, Clone, Copy)]
pub struct DelayNode {
    cap: Duration,
}

impl DelayNode {
    pub fn new(cap: Duration) -> Self {
        Self { cap: cap.min(MAX_DELAY) }
    }
}

impl Default for DelayNode {
    fn default() -> Self {
        Self::new(MAX_DELAY)
    }
}

#[async_trait]
impl ExecutableNode for DelayNode {
    async fn execute(
        &self,
        config: &StepConfig,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput, NodeError> {
        let StepConfig::Delay(cfg) = config else {
            return Err(super::mismatched(StepKind::Delay, config));
        };

        let requested = Duration::from_millis(cfg.duration_ms);
        let actual = requested.min(self.cap);
        if actual < requested {
            debug!(step_id = %ctx.step_id, ?requested, ?actual, "delay capped");
        }

        tokio::time::sleep(actual).await;
        Ok(StepOutput::value(json!({ "delayed_ms": actual.as_millis() as u64 })))
    }
}
