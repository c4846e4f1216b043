//! Test doubles for step handlers and collaborators.
//!
//! Useful in unit and integration tests where real generation backends and
//! HTTP endpoints are unavailable or irrelevant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    collaborators::{CollaboratorError, HttpClient, HttpRequest, HttpResponse},
    ExecutableNode, ExecutionContext, NodeError, StepConfig, StepOutput,
};

/// A context for exercising a handler outside the engine.
pub fn context(input: Value) -> ExecutionContext {
    ExecutionContext {
        execution_id: Uuid::new_v4(),
        target_id: Uuid::new_v4(),
        tenant_id: Uuid::nil(),
        step_id: "step".into(),
        attempt: 1,
        input,
        outputs: Default::default(),
        deadline: tokio::time::Instant::now() + Duration::from_secs(30),
    }
}

/// Lets a test hold a step mid-flight.
#[derive(Debug, Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Resolves once a step has entered the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Lets the waiting step continue.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Behaviour injected into `MockNode` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Report a branch label.
    Branch(String),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail retryably on the first `failures` attempts, then return `value`.
    FailTimesThenReturn { failures: u32, value: Value },
    /// Sleep, then return the value.
    Sleep(Duration, Value),
    /// Panic inside the handler.
    Panic(String),
    /// Wait on the gate, then return the value.
    Block(Arc<Gate>, Value),
}

/// A call observed by `MockNode`.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub step_id: String,
    pub attempt: u32,
    pub outputs: Vec<String>,
}

/// A scripted handler that records every call it receives.
///
/// Behaviour is chosen per step id, falling back to a default that returns
/// `{"step": "<id>"}`.
#[derive(Debug, Default)]
pub struct MockNode {
    default: Option<MockBehaviour>,
    per_step: HashMap<String, MockBehaviour>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, behaviour: MockBehaviour) -> Self {
        self.default = Some(behaviour);
        self
    }

    pub fn on(mut self, step_id: impl Into<String>, behaviour: MockBehaviour) -> Self {
        self.per_step.insert(step_id.into(), behaviour);
        self
    }

    /// Every call in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of times this node has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }

    /// Number of attempts made for one step.
    pub fn calls_for(&self, step_id: &str) -> usize {
        self.calls().iter().filter(|c| c.step_id == step_id).count()
    }

    /// Step ids in the order they were first executed.
    pub fn executed_steps(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for call in self.calls() {
            if !seen.contains(&call.step_id) {
                seen.push(call.step_id);
            }
        }
        seen
    }
}

#[async_trait]
impl ExecutableNode for MockNode {
    async fn execute(
        &self,
        _config: &StepConfig,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput, NodeError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(MockCall {
                step_id: ctx.step_id.clone(),
                attempt: ctx.attempt,
                outputs: ctx.outputs.keys().cloned().collect(),
            });
        }

        let behaviour = self
            .per_step
            .get(&ctx.step_id)
            .or(self.default.as_ref())
            .cloned()
            .unwrap_or_else(|| MockBehaviour::ReturnValue(json!({ "step": ctx.step_id })));

        match behaviour {
            MockBehaviour::ReturnValue(v) => Ok(StepOutput::value(v)),
            MockBehaviour::Branch(label) => Ok(StepOutput::branch(label)),
            MockBehaviour::FailRetryable(msg) => Err(NodeError::Retryable(msg)),
            MockBehaviour::FailFatal(msg) => Err(NodeError::Fatal(msg)),
            MockBehaviour::FailTimesThenReturn { failures, value } => {
                if ctx.attempt <= failures {
                    Err(NodeError::Retryable(format!("scripted failure {}", ctx.attempt)))
                } else {
                    Ok(StepOutput::value(value))
                }
            }
            MockBehaviour::Sleep(duration, v) => {
                tokio::time::sleep(duration).await;
                Ok(StepOutput::value(v))
            }
            MockBehaviour::Panic(msg) => panic!("{msg}"),
            MockBehaviour::Block(gate, v) => {
                gate.entered.notify_one();
                gate.release.notified().await;
                Ok(StepOutput::value(v))
            }
        }
    }
}

/// HTTP client that answers every request with a fixed response.
#[derive(Debug)]
pub struct MockHttpClient {
    response: Result<HttpResponse, CollaboratorError>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self::responding(200, json!({}))
    }
}

impl MockHttpClient {
    pub fn responding(status: u16, body: Value) -> Self {
        Self {
            response: Ok(HttpResponse { status, body }),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            response: Err(CollaboratorError::Transport(message.into())),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CollaboratorError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        self.response.clone()
    }
}
