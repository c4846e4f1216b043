use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::{
    collaborators::{GenerationRequest, TextGenerator},
    expr::render_str,
    ExecutableNode, ExecutionContext, NodeError, StepConfig, StepKind, StepOutput,
};

/// Renders a prompt from the context and asks the generator for text.
pub struct AiResponseNode {
    generator: Arc<dyn TextGenerator>,
}

impl AiResponseNode {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl ExecutableNode for AiResponseNode {
    async fn execute(
        &self,
        config: &StepConfig,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput, NodeError> {
        let StepConfig::AiResponse(cfg) = config else {
            return Err(super::mismatched(StepKind::AiResponse, config));
        };

        let prompt = render_str(&cfg.prompt, &ctx.as_json(), false)
            .map_err(|e| NodeError::Fatal(e.to_string()))?;

        let text = self
            .generator
            .generate(GenerationRequest {
                prompt,
                model: cfg.model.clone(),
                max_tokens: cfg.max_tokens,
            })
            .await
            .map_err(|e| NodeError::Retryable(e.to_string()))?;

        Ok(StepOutput::value(json!({ "text": text })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CollaboratorError;
    use crate::mock::context;
    use crate::AiResponseConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct EchoGenerator {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TextGenerator for EchoGenerator {
        async fn generate(&self, request: GenerationRequest) -> Result<String, CollaboratorError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            Ok(format!("echo: {}", request.prompt))
        }
    }

    #[tokio::test]
    async fn prompt_is_templated_from_context() {
        let generator = Arc::new(EchoGenerator::default());
        let node = AiResponseNode::new(generator.clone());
        let ctx = context(json!({ "topic": "otters" }));
        let config = StepConfig::AiResponse(AiResponseConfig {
            prompt: "Write about {{ input.topic }}{{ input.missing }}".into(),
            model: None,
            max_tokens: Some(64),
        });

        let out = node.execute(&config, &ctx).await.unwrap();
        assert_eq!(out.value, json!({ "text": "echo: Write about otters" }));
        assert_eq!(generator.prompts.lock().unwrap().as_slice(), ["Write about otters"]);
    }

    #[tokio::test]
    async fn generator_failures_are_retryable() {
        let node = AiResponseNode::new(Arc::new(crate::collaborators::NoGenerator));
        let config = StepConfig::AiResponse(AiResponseConfig {
            prompt: "hi".into(),
            model: None,
            max_tokens: None,
        });
        let err = node.execute(&config, &context(json!({}))).await.unwrap_err();
        assert!(matches!(err, NodeError::Retryable(_)));
    }
}
