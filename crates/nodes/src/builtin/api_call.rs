use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::{
    collaborators::{HttpClient, HttpRequest},
    expr::{render_str, render_value},
    ExecutableNode, ExecutionContext, NodeError, StepConfig, StepKind, StepOutput,
};

/// Issues a templated HTTP request through the injected client.
pub struct ApiCallNode {
    client: Arc<dyn HttpClient>,
}

impl ApiCallNode {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExecutableNode for ApiCallNode {
    async fn execute(
        &self,
        config: &StepConfig,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput, NodeError> {
        let StepConfig::ApiCall(cfg) = config else {
            return Err(super::mismatched(StepKind::ApiCall, config));
        };

        let doc = ctx.as_json();
        let fatal = |e: crate::expr::ExprError| NodeError::Fatal(e.to_string());

        let url = render_str(&cfg.url, &doc, true).map_err(fatal)?;
        let headers = cfg
            .headers
            .iter()
            .map(|(k, v)| Ok((k.clone(), render_str(v, &doc, true)?)))
            .collect::<Result<_, crate::expr::ExprError>>()
            .map_err(fatal)?;
        let body = cfg
            .body
            .as_ref()
            .map(|b| render_value(b, &doc, true))
            .transpose()
            .map_err(fatal)?;

        let request = HttpRequest {
            method: cfg.method.to_ascii_uppercase(),
            url,
            headers,
            body,
        };
        debug!(step_id = %ctx.step_id, method = %request.method, url = %request.url, "api call");

        let response = self
            .client
            .send(request)
            .await
            .map_err(|e| NodeError::Retryable(e.to_string()))?;

        if !response.is_success() {
            return Err(NodeError::Retryable(format!(
                "upstream responded with HTTP {}",
                response.status
            )));
        }

        Ok(StepOutput::value(json!({
            "status": response.status,
            "body": response.body,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{CollaboratorError, HttpResponse};
    use crate::mock::context;
    use crate::ApiCallConfig;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct CannedClient {
        status: u16,
        seen: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl HttpClient for CannedClient {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CollaboratorError> {
            self.seen.lock().unwrap().push(request);
            Ok(HttpResponse { status: self.status, body: json!({ "ok": self.status < 400 }) })
        }
    }

    fn config() -> StepConfig {
        StepConfig::ApiCall(ApiCallConfig {
            method: "post".into(),
            url: "https://api.example.test/users/{{ input.user_id }}".into(),
            headers: BTreeMap::from([("x-trace".to_string(), "{{ input.trace }}".to_string())]),
            body: Some(json!({ "id": "{{ input.user_id }}" })),
        })
    }

    #[tokio::test]
    async fn renders_request_and_returns_status_and_body() {
        let client = Arc::new(CannedClient { status: 201, seen: Mutex::new(vec![]) });
        let node = ApiCallNode::new(client.clone());
        let ctx = context(json!({ "user_id": 42, "trace": "t-1" }));

        let out = node.execute(&config(), &ctx).await.unwrap();
        assert_eq!(out.value, json!({ "status": 201, "body": { "ok": true } }));

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].url, "https://api.example.test/users/42");
        assert_eq!(seen[0].headers["x-trace"], "t-1");
        assert_eq!(seen[0].body, Some(json!({ "id": 42 })));
    }

    #[tokio::test]
    async fn error_status_is_retryable() {
        let client = Arc::new(CannedClient { status: 503, seen: Mutex::new(vec![]) });
        let node = ApiCallNode::new(client);
        let ctx = context(json!({ "user_id": 1, "trace": "t" }));

        let err = node.execute(&config(), &ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::Retryable(msg) if msg.contains("503")));
    }

    #[tokio::test]
    async fn unresolved_url_reference_is_fatal() {
        let client = Arc::new(CannedClient { status: 200, seen: Mutex::new(vec![]) });
        let node = ApiCallNode::new(client.clone());

        let err = node.execute(&config(), &context(json!({}))).await.unwrap_err();
        assert!(matches!(err, NodeError::Fatal(_)));
        assert!(client.seen.lock().unwrap().is_empty());
    }
}
