//! Typed step configuration.
//!
//! Definitions arrive as `(type, config JSON)` pairs.  They are parsed into
//! a [`StepConfig`] once when a workflow or plan is prepared for execution,
//! so a malformed node is rejected before any step runs and handlers never
//! re-validate raw JSON per invocation.

use std::collections::BTreeMap;

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::{
    expr::{Expr, ExprError},
    ConfigError,
};

/// The built-in step types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Condition,
    AiResponse,
    ApiCall,
    Transform,
    Delay,
}

impl StepKind {
    pub const ALL: [StepKind; 5] = [
        StepKind::Condition,
        StepKind::AiResponse,
        StepKind::ApiCall,
        StepKind::Transform,
        StepKind::Delay,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Condition  => "condition",
            Self::AiResponse => "ai_response",
            Self::ApiCall    => "api_call",
            Self::Transform  => "transform",
            Self::Delay      => "delay",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluates `expression` and reports the branch label `"true"`/`"false"`.
/// The expression is parsed together with the config.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionConfig {
    expression: String,
    #[serde(skip_serializing)]
    expr: Expr,
}

impl ConditionConfig {
    pub fn new(expression: impl Into<String>) -> Result<Self, ExprError> {
        let expression = expression.into();
        let expr = Expr::parse(&expression)?;
        Ok(Self { expression, expr })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }
}

impl<'de> Deserialize<'de> for ConditionConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Raw {
            expression: String,
        }

        let raw = Raw::deserialize(deserializer)?;
        Self::new(raw.expression).map_err(de::Error::custom)
    }
}

/// Prompts the generation collaborator.  `prompt` may contain `{{path}}`
/// placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AiResponseConfig {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Calls the HTTP collaborator.  `url`, header values and `body` are
/// templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiCallConfig {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_owned()
}

/// Pure JSON templating over the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    pub template: Value,
}

/// Sleeps for `duration_ms`, capped by the delay node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DelayConfig {
    pub duration_ms: u64,
}

/// A validated step configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum StepConfig {
    Condition(ConditionConfig),
    AiResponse(AiResponseConfig),
    ApiCall(ApiCallConfig),
    Transform(TransformConfig),
    Delay(DelayConfig),
}

const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

impl StepConfig {
    /// Parse and validate the configuration of a step declared as `step_type`.
    pub fn parse(step_type: &str, config: &Value) -> Result<Self, ConfigError> {
        let tagged = json!({ "type": step_type, "config": config });
        let parsed: StepConfig = serde_json::from_value(tagged)
            .map_err(|e| ConfigError::new(step_type, e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Self::Condition(_)  => StepKind::Condition,
            Self::AiResponse(_) => StepKind::AiResponse,
            Self::ApiCall(_)    => StepKind::ApiCall,
            Self::Transform(_)  => StepKind::Transform,
            Self::Delay(_)      => StepKind::Delay,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let kind = self.kind().as_str();
        match self {
            Self::AiResponse(c) if c.prompt.trim().is_empty() => {
                return Err(ConfigError::new(kind, "prompt must not be empty"));
            }
            Self::ApiCall(c) => {
                if c.url.trim().is_empty() {
                    return Err(ConfigError::new(kind, "url must not be empty"));
                }
                if !HTTP_METHODS.contains(&c.method.to_ascii_uppercase().as_str()) {
                    return Err(ConfigError::new(kind, format!("unsupported method '{}'", c.method)));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_builtin_type() {
        let cases = [
            ("condition", json!({ "expression": "input.x > 1" }), StepKind::Condition),
            ("ai_response", json!({ "prompt": "Summarise {{ input.text }}" }), StepKind::AiResponse),
            ("api_call", json!({ "url": "https://example.test" }), StepKind::ApiCall),
            ("transform", json!({ "template": { "a": "{{ input.a }}" } }), StepKind::Transform),
            ("delay", json!({ "duration_ms": 250 }), StepKind::Delay),
        ];
        for (ty, cfg, kind) in cases {
            let parsed = StepConfig::parse(ty, &cfg).unwrap_or_else(|e| panic!("{ty}: {e}"));
            assert_eq!(parsed.kind(), kind);
        }
    }

    #[test]
    fn api_call_defaults_to_get() {
        match StepConfig::parse("api_call", &json!({ "url": "https://example.test" })).unwrap() {
            StepConfig::ApiCall(c) => {
                assert_eq!(c.method, "GET");
                assert!(c.headers.is_empty());
                assert!(c.body.is_none());
            }
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[test]
    fn condition_expression_is_parsed_with_the_config() {
        match StepConfig::parse("condition", &json!({ "expression": "steps.a.n >= 3" })).unwrap() {
            StepConfig::Condition(c) => {
                assert_eq!(c.expression(), "steps.a.n >= 3");
                assert_eq!(c.expr(), &Expr::parse("steps.a.n >= 3").unwrap());
                assert!(c.expr().eval(&json!({ "steps": { "a": { "n": 4 } } })));
            }
            other => panic!("unexpected config {other:?}"),
        }

        let err = StepConfig::parse("condition", &json!({ "expression": "a ==" })).unwrap_err();
        assert_eq!(err.step_type, "condition");
    }

    #[test]
    fn condition_serializes_only_its_source() {
        let config = StepConfig::Condition(ConditionConfig::new("input.ok").unwrap());
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            json!({ "type": "condition", "config": { "expression": "input.ok" } })
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = StepConfig::parse("send_fax", &json!({})).unwrap_err();
        assert_eq!(err.step_type, "send_fax");
    }

    #[test]
    fn schema_mismatches_are_rejected() {
        assert!(StepConfig::parse("delay", &json!({ "duration_ms": "soon" })).is_err());
        assert!(StepConfig::parse("delay", &json!({ "duration_ms": 5, "extra": true })).is_err());
        assert!(StepConfig::parse("condition", &json!({ "expression": "a ==" })).is_err());
        assert!(StepConfig::parse("api_call", &json!({ "url": "x", "method": "FETCH" })).is_err());
        assert!(StepConfig::parse("ai_response", &json!({ "prompt": "  " })).is_err());
    }
}
