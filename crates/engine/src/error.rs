//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use nodes::ConfigError;

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the workflow.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    /// Every node has an incoming edge, so nothing can start.
    #[error("workflow has no entry node")]
    NoEntryPoint,

    /// Topological sort detected a cycle.
    #[error("workflow graph contains a cycle")]
    CycleDetected,

    /// A node's config does not match its declared type.
    #[error("step '{step_id}': {source}")]
    InvalidConfig {
        step_id: String,
        #[source]
        source: ConfigError,
    },

    /// Stored or submitted definition body could not be decoded.
    #[error("invalid definition: {0}")]
    InvalidDefinition(#[from] serde_json::Error),

    /// No step is runnable but the execution is not finished.
    #[error("no runnable step; unresolved: {pending:?}")]
    Stall { pending: Vec<String> },

    // ------ Execution errors ------

    #[error("workflow {0} is disabled")]
    WorkflowDisabled(Uuid),

    #[error("no workflow is registered for webhook path '{0}'")]
    UnknownWebhook(String),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),
}

impl EngineError {
    /// Malformed definition or unrunnable graph.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::DuplicateNodeId(_)
                | Self::UnknownNodeReference { .. }
                | Self::NoEntryPoint
                | Self::CycleDetected
                | Self::InvalidConfig { .. }
                | Self::InvalidDefinition(_)
                | Self::Stall { .. }
        )
    }
}
