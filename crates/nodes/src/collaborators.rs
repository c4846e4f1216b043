//! External services consumed by built-in steps.
//!
//! The engine knows nothing about how text is generated or how requests are
//! authenticated; `ai_response` and `api_call` steps talk to these traits
//! and the binary decides which implementation to inject.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure reported by a collaborator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CollaboratorError {
    /// The request never produced a usable response (network, TLS, decode).
    #[error("transport error: {0}")]
    Transport(String),

    /// The collaborator is not available in this deployment.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
}

/// Produces text for `ai_response` steps.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<String, CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    /// Parsed JSON when the body is JSON, otherwise the raw text.
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends requests for `api_call` steps and terminal-status webhooks.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CollaboratorError>;
}

/// Stand-in generator for deployments without a generation backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGenerator;

#[async_trait]
impl TextGenerator for NoGenerator {
    async fn generate(&self, _request: GenerationRequest) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::Unavailable(
            "no generation backend configured".to_owned(),
        ))
    }
}
