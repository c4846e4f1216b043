//! Maps step types to handlers and failure classes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::{
    builtin::{AiResponseNode, ApiCallNode, ConditionNode, DelayNode, TransformNode},
    collaborators::{HttpClient, TextGenerator},
    ExecutableNode, ExecutionContext, NodeError, StepConfig, StepError, StepKind, StepOutput,
};

/// Whether failures of a step type may be retried.
///
/// Fixed per type at registration; a handler's `NodeError::Retryable` is
/// only honoured for types registered as [`FailureClass::Retryable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    Fatal,
}

struct Registration {
    node: Arc<dyn ExecutableNode>,
    class: FailureClass,
}

/// Builder for an immutable [`StepRegistry`].
#[derive(Default)]
pub struct StepRegistryBuilder {
    entries: HashMap<StepKind, Registration>,
}

impl StepRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `kind`.
    pub fn register(
        mut self,
        kind: StepKind,
        node: Arc<dyn ExecutableNode>,
        class: FailureClass,
    ) -> Self {
        self.entries.insert(kind, Registration { node, class });
        self
    }

    pub fn build(mut self) -> StepRegistry {
        // Pure steps fail the same way every time.
        for kind in [StepKind::Condition, StepKind::Transform] {
            if let Some(entry) = self.entries.get_mut(&kind) {
                entry.class = FailureClass::Fatal;
            }
        }
        StepRegistry { entries: self.entries }
    }
}

/// Read-only lookup from step type to handler, shared by every execution.
pub struct StepRegistry {
    entries: HashMap<StepKind, Registration>,
}

impl StepRegistry {
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder::new()
    }

    /// All built-in types wired to the given collaborators.  Callers may
    /// override individual types before building.
    pub fn builtin(
        generator: Arc<dyn TextGenerator>,
        http: Arc<dyn HttpClient>,
    ) -> StepRegistryBuilder {
        StepRegistryBuilder::new()
            .register(StepKind::Condition, Arc::new(ConditionNode), FailureClass::Fatal)
            .register(StepKind::AiResponse, Arc::new(AiResponseNode::new(generator)), FailureClass::Retryable)
            .register(StepKind::ApiCall, Arc::new(ApiCallNode::new(http)), FailureClass::Retryable)
            .register(StepKind::Transform, Arc::new(TransformNode), FailureClass::Fatal)
            .register(StepKind::Delay, Arc::new(DelayNode::default()), FailureClass::Retryable)
    }

    pub fn class_of(&self, kind: StepKind) -> Option<FailureClass> {
        self.entries.get(&kind).map(|e| e.class)
    }

    pub fn contains(&self, kind: StepKind) -> bool {
        self.entries.contains_key(&kind)
    }

    /// Run one attempt of a step, bounded by `timeout`.
    pub async fn execute(
        &self,
        config: &StepConfig,
        ctx: &ExecutionContext,
        timeout: Duration,
    ) -> Result<StepOutput, StepError> {
        let kind = config.kind();
        let Some(entry) = self.entries.get(&kind) else {
            return Err(StepError::Execution {
                message: format!("no handler registered for step type '{kind}'"),
                retryable: false,
            });
        };
        let retryable_class = entry.class == FailureClass::Retryable;

        debug!(step_id = %ctx.step_id, %kind, attempt = ctx.attempt, ?timeout, "dispatching step");

        match tokio::time::timeout(timeout, entry.node.execute(config, ctx)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(NodeError::Retryable(message))) => Err(StepError::Execution {
                message,
                retryable: retryable_class,
            }),
            Ok(Err(NodeError::Fatal(message))) => Err(StepError::Execution {
                message,
                retryable: false,
            }),
            Err(_) => Err(StepError::Timeout {
                after: timeout,
                retryable: retryable_class,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NoGenerator;
    use crate::mock::{context, MockBehaviour, MockHttpClient, MockNode};
    use crate::{ConditionConfig, DelayConfig};
    use serde_json::json;

    fn api_call() -> StepConfig {
        StepConfig::parse("api_call", &json!({ "url": "mock://svc" })).unwrap()
    }

    #[tokio::test]
    async fn pure_types_are_always_fatal() {
        let mock = Arc::new(MockNode::new());
        let registry = StepRegistry::builder()
            .register(StepKind::Condition, mock.clone(), FailureClass::Retryable)
            .register(StepKind::Transform, mock.clone(), FailureClass::Retryable)
            .register(StepKind::ApiCall, mock, FailureClass::Retryable)
            .build();

        assert_eq!(registry.class_of(StepKind::Condition), Some(FailureClass::Fatal));
        assert_eq!(registry.class_of(StepKind::Transform), Some(FailureClass::Fatal));
        assert_eq!(registry.class_of(StepKind::ApiCall), Some(FailureClass::Retryable));
        assert_eq!(registry.class_of(StepKind::Delay), None);
    }

    #[tokio::test]
    async fn retryable_errors_respect_the_registered_class() {
        let mock = Arc::new(MockNode::new().with_default(MockBehaviour::FailRetryable("503".into())));
        let ctx = context(json!({}));

        let retryable = StepRegistry::builder()
            .register(StepKind::ApiCall, mock.clone(), FailureClass::Retryable)
            .build();
        let err = retryable.execute(&api_call(), &ctx, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_retryable());

        let fatal = StepRegistry::builder()
            .register(StepKind::ApiCall, mock, FailureClass::Fatal)
            .build();
        let err = fatal.execute(&api_call(), &ctx, Duration::from_secs(1)).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_steps_time_out() {
        let mock = Arc::new(
            MockNode::new().with_default(MockBehaviour::Sleep(Duration::from_secs(60), json!(1))),
        );
        let registry = StepRegistry::builder()
            .register(StepKind::ApiCall, mock, FailureClass::Retryable)
            .build();

        let err = registry
            .execute(&api_call(), &context(json!({})), Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn builtin_delay_timeouts_follow_the_retry_policy() {
        let http = Arc::new(MockHttpClient::default());
        let registry = StepRegistry::builtin(Arc::new(NoGenerator), http).build();
        assert_eq!(registry.class_of(StepKind::Delay), Some(FailureClass::Retryable));

        let config = StepConfig::Delay(DelayConfig { duration_ms: 2_000 });
        let err = registry
            .execute(&config, &context(json!({})), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unregistered_type_is_a_fatal_execution_error() {
        let registry = StepRegistry::builder().build();
        let config = StepConfig::Delay(DelayConfig { duration_ms: 1 });
        let err = registry
            .execute(&config, &context(json!({})), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Execution { retryable: false, .. }));
    }

    #[tokio::test]
    async fn builtin_registry_covers_every_type() {
        let http = Arc::new(MockHttpClient::default());
        let registry = StepRegistry::builtin(Arc::new(NoGenerator), http).build();
        for kind in StepKind::ALL {
            assert!(registry.contains(kind), "{kind} missing");
        }

        let config = StepConfig::Condition(ConditionConfig::new("input.ok").unwrap());
        let out = registry
            .execute(&config, &context(json!({ "ok": true })), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.branch.as_deref(), Some("true"));
    }
}
