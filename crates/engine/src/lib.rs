//! `engine` crate: domain models, DAG validation, the graph resolver and
//! the execution engine, plus the `ExecutionService` facade on top.

pub mod approval;
pub mod dag;
pub mod error;
pub mod events;
pub mod executor;
pub mod models;
pub mod program;
pub mod resolver;
pub mod service;

pub use approval::ApprovalGate;
pub use dag::validate_dag;
pub use error::EngineError;
pub use events::{EventBus, ExecutionEvent, Notifier, WebhookNotifier};
pub use executor::{ExecutorConfig, WorkflowExecutor};
pub use models::{Edge, NodeDefinition, Plan, PlanStep, Trigger, Workflow};
pub use program::Program;
pub use resolver::{next_runnable, Resolution};
pub use service::{ExecutionService, ExecutionView, ServiceConfig, TriggerOptions};
