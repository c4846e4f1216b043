//! `nodes` crate: the `ExecutableNode` trait, the built-in step types and
//! the registry the engine dispatches through.
//!
//! Every step type must implement [`ExecutableNode`] and be registered in a
//! [`StepRegistry`] together with its [`FailureClass`].

pub mod builtin;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod expr;
pub mod http;
pub mod mock;
pub mod registry;
pub mod traits;

pub use collaborators::{HttpClient, TextGenerator};
pub use config::{
    AiResponseConfig, ApiCallConfig, ConditionConfig, DelayConfig, StepConfig, StepKind,
    TransformConfig,
};
pub use error::{ConfigError, NodeError, StepError};
pub use registry::{FailureClass, StepRegistry, StepRegistryBuilder};
pub use traits::{ExecutableNode, ExecutionContext, StepOutput};
