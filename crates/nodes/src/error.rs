//! Node-level error types.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a node's `execute` method.
///
/// The variant is the node's own opinion; the registry combines it with the
/// failure class fixed at registration time (see [`crate::FailureClass`]):
/// - `Retryable`: transient; re-attempted with back-off if the step type
///   is registered as retryable.
/// - `Fatal`: permanent; the execution fails immediately.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NodeError {
    /// Transient failure; the engine may re-try the step.
    #[error("retryable node error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal node error: {0}")]
    Fatal(String),
}

/// Outcome of a failed dispatch through [`crate::StepRegistry::execute`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StepError {
    /// The step did not finish within its allotted time.
    #[error("step timed out after {after:?}")]
    Timeout { after: Duration, retryable: bool },

    /// The step (or its collaborator) reported a failure.
    #[error("{message}")]
    Execution { message: String, retryable: bool },
}

impl StepError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { retryable, .. } | Self::Execution { retryable, .. } => *retryable,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A step definition whose configuration does not match its declared type.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("invalid '{step_type}' config: {message}")]
pub struct ConfigError {
    pub step_type: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(step_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self { step_type: step_type.into(), message: message.into() }
    }
}
