//! Built-in step handlers.

mod ai_response;
mod api_call;
mod condition;
mod delay;
mod transform;

pub use ai_response::AiResponseNode;
pub use api_call::ApiCallNode;
pub use condition::ConditionNode;
pub use delay::{DelayNode, MAX_DELAY};
pub use transform::TransformNode;

use crate::{NodeError, StepConfig, StepKind};

/// Error for a handler dispatched with another step type's config.
pub(crate) fn mismatched(expected: StepKind, got: &StepConfig) -> NodeError {
    NodeError::Fatal(format!(
        "{expected} handler received a '{}' config",
        got.kind()
    ))
}
