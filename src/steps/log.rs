//! Log step - emit a message through the workflow logger.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::template::{resolve_template, resolve_value};
use super::types::{
    ConfigValidation, LogLevel, Step, StepBase, StepExecutionContext, StepResult,
};
use crate::error::Result;

const MAX_MESSAGE_CHARS: usize = 1000;

/// Log step that writes a templated message.
pub struct LogStep {
    base: StepBase,
}

impl LogStep {
    pub fn new(base: StepBase) -> Self {
        Self { base }
    }
}

#[derive(Debug, Deserialize)]
struct LogConfig {
    message: String,

    #[serde(default)]
    level: LogLevel,

    #[serde(default)]
    data: Option<Value>,
}

#[async_trait]
impl Step for LogStep {
    fn base(&self) -> &StepBase {
        &self.base
    }

    fn step_type(&self) -> &str {
        "log"
    }

    fn description(&self) -> &str {
        "Emit a structured log entry"
    }

    fn validate_config(&self) -> ConfigValidation {
        let mut result = ConfigValidation::ok();

        match self.base.get("message") {
            None => result.error("message is required"),
            Some(Value::String(message)) => {
                if message.chars().count() > MAX_MESSAGE_CHARS {
                    result.warn(format!(
                        "message is longer than {} characters",
                        MAX_MESSAGE_CHARS
                    ));
                }
            }
            Some(_) => result.error("message must be a string"),
        }

        if let Some(level) = self.base.get("level") {
            let known = level.as_str().and_then(LogLevel::parse).is_some();
            if !known {
                result.error("level must be one of: debug, info, warn, error");
            }
        }

        result
    }

    async fn execute_step(&self, ctx: &mut StepExecutionContext) -> Result<StepResult> {
        let config: LogConfig = self.base.parse_config("log")?;

        let message = resolve_template(&config.message, ctx);
        let data = config.data.as_ref().map(|d| resolve_value(d, ctx));

        ctx.logger.log(config.level, &message, data.as_ref());

        let mut outputs = Map::new();
        outputs.insert("message".into(), Value::String(message));
        outputs.insert("level".into(), Value::String(config.level.to_string()));
        outputs.insert("data".into(), data.unwrap_or(Value::Null));
        outputs.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));

        Ok(StepResult::success(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::types::test_support::{base, context, MemoryLogger};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_log_resolves_message_and_data() {
        let logger = Arc::new(MemoryLogger::default());
        let mut ctx = context().with_logger(logger.clone());
        ctx.variables.insert("who".into(), json!("world"));

        let step = LogStep::new(base(
            "greet",
            json!({"message": "hello ${who}", "level": "warn", "data": {"target": "${who}", "n": 2}}),
        ));
        let result = step.execute(&mut ctx).await;

        assert!(result.success);
        assert_eq!(result.outputs["message"], "hello world");
        assert_eq!(result.outputs["level"], "warn");
        assert_eq!(result.outputs["data"], json!({"target": "world", "n": 2}));

        let entries = logger.messages();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, LogLevel::Warn);
        assert_eq!(entries[0].1, "hello world");
    }

    #[test]
    fn test_log_validation() {
        let missing = LogStep::new(base("l", json!({})));
        assert!(!missing.validate_config().is_valid());

        let wrong_type = LogStep::new(base("l", json!({"message": 42})));
        assert!(!wrong_type.validate_config().is_valid());

        let bad_level = LogStep::new(base("l", json!({"message": "x", "level": "trace"})));
        assert!(!bad_level.validate_config().is_valid());

        let long = LogStep::new(base("l", json!({"message": "x".repeat(1001)})));
        let validation = long.validate_config();
        assert!(validation.is_valid());
        assert_eq!(validation.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_log_defaults_to_info() {
        let step = LogStep::new(base("l", json!({"message": "plain"})));
        let result = step.execute(&mut context()).await;
        assert_eq!(result.outputs["level"], "info");
        assert_eq!(result.outputs["data"], Value::Null);
    }
}
