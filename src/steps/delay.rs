//! Delay step - pause the workflow for a duration.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex_lite::Regex;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::template::resolve_template;
use super::types::{ConfigValidation, Step, StepBase, StepExecutionContext, StepResult};
use crate::error::{Error, Result};

const DAY_MS: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

fn duration_text_regex() -> &'static Regex {
    static DURATION_TEXT_REGEX: OnceLock<Regex> = OnceLock::new();
    DURATION_TEXT_REGEX
        .get_or_init(|| Regex::new(r"^(\d+(?:\.\d+)?)\s*([smhd])?$").expect("valid regex"))
}

/// Parse `<number><s|m|h|d>` into milliseconds. Unit defaults to seconds.
pub fn parse_duration_text(text: &str) -> Option<u64> {
    let caps = duration_text_regex().captures(text.trim())?;
    let amount: f64 = caps[1].parse().ok()?;
    let unit_ms = match caps.get(2).map(|m| m.as_str()) {
        None | Some("s") => 1_000.0,
        Some("m") => 60_000.0,
        Some("h") => 3_600_000.0,
        Some("d") => DAY_MS,
        Some(_) => return None,
    };
    Some((amount * unit_ms).round() as u64)
}

/// Delay step that suspends on a timer.
pub struct DelayStep {
    base: StepBase,
}

impl DelayStep {
    pub fn new(base: StepBase) -> Self {
        Self { base }
    }

    /// Effective delay in ms; `duration` wins over `durationText`.
    fn requested_ms(&self, ctx: Option<&StepExecutionContext>) -> Result<u64> {
        if let Some(duration) = self.base.get("duration") {
            return match duration.as_f64() {
                Some(ms) if ms >= 0.0 => Ok(ms.round() as u64),
                Some(_) => Err(Error::StepConfig("duration cannot be negative".to_string())),
                None => Err(Error::StepConfig(
                    "duration must be a number of milliseconds".to_string(),
                )),
            };
        }

        match self.base.get("durationText") {
            Some(Value::String(text)) => {
                let text = match ctx {
                    Some(ctx) => resolve_template(text, ctx),
                    None => text.clone(),
                };
                parse_duration_text(&text).ok_or_else(|| {
                    Error::StepConfig(format!(
                        "Invalid durationText '{}' (expected e.g. 30s, 5m, 2h, 1d)",
                        text
                    ))
                })
            }
            Some(_) => Err(Error::StepConfig("durationText must be a string".to_string())),
            None => Err(Error::StepConfig(
                "duration or durationText is required".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Step for DelayStep {
    fn base(&self) -> &StepBase {
        &self.base
    }

    fn step_type(&self) -> &str {
        "delay"
    }

    fn description(&self) -> &str {
        "Pause the workflow for a duration"
    }

    fn validate_config(&self) -> ConfigValidation {
        let mut result = ConfigValidation::ok();

        if self.base.get("duration").is_some() && self.base.get("durationText").is_some() {
            result.warn("both duration and durationText are set; duration takes precedence");
        }

        let templated = self
            .base
            .get("durationText")
            .and_then(Value::as_str)
            .is_some_and(|t| t.contains("${"));
        if templated && self.base.get("duration").is_none() {
            return result;
        }

        match self.requested_ms(None) {
            Ok(ms) if ms as f64 > DAY_MS => {
                result.warn(format!("delay of {}ms exceeds 24 hours", ms));
            }
            Ok(_) => {}
            Err(e) => result.error(match e {
                Error::StepConfig(message) => message,
                other => other.to_string(),
            }),
        }

        result
    }

    async fn execute_step(&self, ctx: &mut StepExecutionContext) -> Result<StepResult> {
        let requested = self.requested_ms(Some(ctx))?;
        if requested as f64 > DAY_MS {
            warn!(step_id = %self.base.id, requested_ms = requested, "Delay exceeds 24 hours");
        }

        info!(step_id = %self.base.id, requested_ms = requested, "Delaying");
        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(requested)).await;
        let actual = start.elapsed().as_millis() as u64;
        let difference = actual as i64 - requested as i64;

        let mut outputs = Map::new();
        outputs.insert("requestedDuration".into(), json!(requested));
        outputs.insert("actualDuration".into(), json!(actual));
        outputs.insert("difference".into(), json!(difference));

        Ok(StepResult::success(outputs).with_metadata_map(json!({
            "requestedDuration": requested,
            "actualDuration": actual,
            "difference": difference,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::types::test_support::{base, context};

    #[test]
    fn test_parse_duration_text() {
        assert_eq!(parse_duration_text("30"), Some(30_000));
        assert_eq!(parse_duration_text("1.5s"), Some(1_500));
        assert_eq!(parse_duration_text("2m"), Some(120_000));
        assert_eq!(parse_duration_text("1 h"), Some(3_600_000));
        assert_eq!(parse_duration_text("1d"), Some(86_400_000));
        assert_eq!(parse_duration_text("soon"), None);
        assert_eq!(parse_duration_text("5w"), None);
        assert_eq!(parse_duration_text("-5s"), None);
    }

    #[test]
    fn test_delay_validation() {
        let bad_text = DelayStep::new(base("d", json!({"durationText": "ten seconds"})));
        assert!(!bad_text.validate_config().is_valid());

        let missing = DelayStep::new(base("d", json!({})));
        assert!(!missing.validate_config().is_valid());

        let negative = DelayStep::new(base("d", json!({"duration": -1})));
        assert!(!negative.validate_config().is_valid());

        let both = DelayStep::new(base("d", json!({"duration": 10, "durationText": "1s"})));
        let validation = both.validate_config();
        assert!(validation.is_valid());
        assert_eq!(validation.warnings.len(), 1);

        let long = DelayStep::new(base("d", json!({"durationText": "2d"})));
        let validation = long.validate_config();
        assert!(validation.is_valid());
        assert!(validation.warnings[0].contains("24 hours"));
    }

    #[tokio::test]
    async fn test_delay_reports_actual_duration() {
        let step = DelayStep::new(base("d", json!({"duration": 1000})));
        let result = step.execute(&mut context()).await;

        assert!(result.success);
        assert_eq!(result.outputs["requestedDuration"], 1000);
        let actual = result.outputs["actualDuration"].as_u64().unwrap();
        assert!((1000..1250).contains(&actual), "actual {}", actual);
        assert!(result.metadata.contains_key("difference"));
    }

    #[tokio::test]
    async fn test_duration_takes_precedence() {
        let step = DelayStep::new(base("d", json!({"duration": 5, "durationText": "1h"})));
        let result = step.execute(&mut context()).await;
        assert_eq!(result.outputs["requestedDuration"], 5);
    }
}
