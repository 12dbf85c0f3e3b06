//! Validation step - check data against a JSON Schema and/or field rules.
//!
//! ## Example
//!
//! ```yaml
//! - id: check-order
//!   type: validation
//!   config:
//!     data: ${steps.fetch.body}
//!     schema:
//!       type: object
//!       required: [id, items]
//!     rules:
//!       required: [customer.email]
//!       patterns:
//!         customer.email: "^[^@]+@[^@]+$"
//!       ranges:
//!         total: { min: 0 }
//!     failOnError: true
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use jsonschema::validator_for;
use regex_lite::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::template::resolve_value;
use super::types::{ConfigValidation, Step, StepBase, StepExecutionContext, StepResult};
use crate::error::{Error, Result};
use crate::substitution::resolve_path;

/// Validation step.
pub struct ValidationStep {
    base: StepBase,
}

impl ValidationStep {
    pub fn new(base: StepBase) -> Self {
        Self { base }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidationConfig {
    #[serde(default)]
    data: Value,

    #[serde(default)]
    schema: Option<Value>,

    #[serde(default)]
    rules: Option<Rules>,

    #[serde(default = "default_true")]
    fail_on_error: bool,
}

fn default_true() -> bool {
    true
}

/// Field rules, each keyed by dotted path.
#[derive(Debug, Default, Deserialize)]
struct Rules {
    #[serde(default)]
    required: Vec<String>,

    #[serde(default)]
    types: BTreeMap<String, String>,

    #[serde(default)]
    patterns: BTreeMap<String, String>,

    #[serde(default)]
    ranges: BTreeMap<String, Bounds>,

    #[serde(default)]
    lengths: BTreeMap<String, Bounds>,
}

#[derive(Debug, Default, Deserialize)]
struct Bounds {
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
}

fn field<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    resolve_path(data, &segments).filter(|v| !v.is_null())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "any" => true,
        "number" => value.is_number(),
        "integer" => value.as_f64().is_some_and(|n| n.fract() == 0.0),
        other => type_name(value) == other,
    }
}

/// Check data against a JSON Schema, one message per violation.
fn check_schema(schema: &Value, data: &Value) -> Result<Vec<String>> {
    let validator = validator_for(schema)
        .map_err(|e| Error::StepConfig(format!("Invalid JSON Schema: {}", e)))?;

    Ok(validator
        .iter_errors(data)
        .map(|error| {
            let path = error.instance_path.to_string();
            if path.is_empty() || path == "/" {
                error.to_string()
            } else {
                format!("at '{}': {}", path, error)
            }
        })
        .collect())
}

fn check_rules(rules: &Rules, data: &Value) -> Result<Vec<String>> {
    let mut errors = Vec::new();

    for path in &rules.required {
        if field(data, path).is_none() {
            errors.push(format!("Field '{}' is required", path));
        }
    }

    for (path, expected) in &rules.types {
        if let Some(value) = field(data, path) {
            if !matches_type(value, expected) {
                errors.push(format!(
                    "Field '{}' must be of type {} (got {})",
                    path,
                    expected,
                    type_name(value)
                ));
            }
        }
    }

    for (path, pattern) in &rules.patterns {
        let regex = Regex::new(pattern).map_err(|e| {
            Error::StepConfig(format!("Invalid pattern for '{}': {}", path, e))
        })?;
        match field(data, path) {
            Some(Value::String(s)) if regex.is_match(s) => {}
            Some(Value::String(_)) => {
                errors.push(format!("Field '{}' does not match pattern {}", path, pattern));
            }
            Some(_) => errors.push(format!("Field '{}' must be a string to match a pattern", path)),
            None => {}
        }
    }

    for (path, bounds) in &rules.ranges {
        let Some(value) = field(data, path) else {
            continue;
        };
        let Some(n) = value.as_f64() else {
            errors.push(format!("Field '{}' must be a number", path));
            continue;
        };
        if let Some(min) = bounds.min.filter(|min| n < *min) {
            errors.push(format!("Field '{}' must be >= {} (got {})", path, min, n));
        }
        if let Some(max) = bounds.max.filter(|max| n > *max) {
            errors.push(format!("Field '{}' must be <= {} (got {})", path, max, n));
        }
    }

    for (path, bounds) in &rules.lengths {
        let Some(value) = field(data, path) else {
            continue;
        };
        let len = match value {
            Value::String(s) => s.chars().count(),
            Value::Array(items) => items.len(),
            _ => {
                errors.push(format!("Field '{}' must be a string or array", path));
                continue;
            }
        } as f64;
        if let Some(min) = bounds.min.filter(|min| len < *min) {
            errors.push(format!("Field '{}' length must be >= {} (got {})", path, min, len));
        }
        if let Some(max) = bounds.max.filter(|max| len > *max) {
            errors.push(format!("Field '{}' length must be <= {} (got {})", path, max, len));
        }
    }

    Ok(errors)
}

#[async_trait]
impl Step for ValidationStep {
    fn base(&self) -> &StepBase {
        &self.base
    }

    fn step_type(&self) -> &str {
        "validation"
    }

    fn description(&self) -> &str {
        "Validate data against a JSON Schema or field rules"
    }

    fn validate_config(&self) -> ConfigValidation {
        let mut result = ConfigValidation::ok();

        if self.base.get("data").is_none() {
            result.error("data is required");
        }

        let schema = self.base.get("schema");
        let rules = self.base.get("rules");
        if schema.is_none() && rules.is_none() {
            result.warn("neither schema nor rules is set; validation always passes");
        }

        if let Some(schema) = schema {
            if !schema.is_object() && !schema.is_boolean() {
                result.error("schema must be an object");
            } else if let Err(e) = validator_for(schema) {
                result.error(format!("schema is not a valid JSON Schema: {}", e));
            }
        }

        if let Some(rules) = rules {
            if let Err(e) = serde_json::from_value::<Rules>(rules.clone()) {
                result.error(format!("rules are malformed: {}", e));
            }
        }

        if let Some(flag) = self.base.get("failOnError") {
            if !flag.is_boolean() {
                result.error("failOnError must be a boolean");
            }
        }

        result
    }

    async fn execute_step(&self, ctx: &mut StepExecutionContext) -> Result<StepResult> {
        let config: ValidationConfig = self.base.parse_config("validation")?;
        let data = resolve_value(&config.data, ctx);

        let mut errors = Vec::new();
        if let Some(schema) = &config.schema {
            errors.extend(check_schema(schema, &data)?);
        }
        if let Some(rules) = &config.rules {
            errors.extend(check_rules(rules, &data)?);
        }

        let valid = errors.is_empty();
        let mut outputs = Map::new();
        outputs.insert("valid".into(), json!(valid));
        outputs.insert("errors".into(), json!(errors));
        outputs.insert("data".into(), data);

        if !valid && config.fail_on_error {
            return Ok(
                StepResult::failure(format!("Validation failed: {}", errors.join("; ")))
                    .with_outputs(outputs)
                    .with_metadata("errorCount", errors.len()),
            );
        }

        Ok(StepResult::success(outputs).with_metadata("errorCount", errors.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::types::test_support::{base, context};

    fn order() -> Value {
        json!({
            "id": "ORD-1",
            "total": 42.5,
            "items": [{"sku": "a"}],
            "customer": {"email": "ada@example.com", "name": "Ada"}
        })
    }

    #[tokio::test]
    async fn test_valid_data_passes_schema_and_rules() {
        let mut ctx = context();
        ctx.variables.insert("order".into(), order());

        let step = ValidationStep::new(base(
            "v",
            json!({
                "data": "${order}",
                "schema": {"type": "object", "required": ["id", "items"]},
                "rules": {
                    "required": ["customer.email"],
                    "types": {"total": "number", "items": "array"},
                    "patterns": {"id": "^ORD-[0-9]+$"},
                    "ranges": {"total": {"min": 0, "max": 100}},
                    "lengths": {"customer.name": {"min": 2}}
                }
            }),
        ));
        let result = step.execute(&mut ctx).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.outputs["valid"], true);
        assert_eq!(result.outputs["data"]["id"], "ORD-1");
    }

    #[tokio::test]
    async fn test_failures_are_combined() {
        let step = ValidationStep::new(base(
            "v",
            json!({
                "data": {"id": "bad", "total": -1},
                "schema": {"type": "object", "required": ["items"]},
                "rules": {
                    "required": ["customer.email"],
                    "patterns": {"id": "^ORD-"},
                    "ranges": {"total": {"min": 0}}
                }
            }),
        ));
        let result = step.execute(&mut context()).await;

        assert!(!result.success);
        let errors = result.outputs["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 4);
        let message = result.error.unwrap();
        assert!(message.contains("customer.email"));
        assert!(message.contains("pattern"));
    }

    #[tokio::test]
    async fn test_fail_on_error_false_annotates() {
        let step = ValidationStep::new(base(
            "v",
            json!({
                "data": {"name": "x"},
                "rules": {"lengths": {"name": {"min": 3}}},
                "failOnError": false
            }),
        ));
        let result = step.execute(&mut context()).await;

        assert!(result.success);
        assert_eq!(result.outputs["valid"], false);
        assert_eq!(result.outputs["errors"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_config_validation() {
        let missing = ValidationStep::new(base("v", json!({"rules": {}})));
        assert!(!missing.validate_config().is_valid());

        let bare = ValidationStep::new(base("v", json!({"data": 1})));
        let validation = bare.validate_config();
        assert!(validation.is_valid());
        assert_eq!(validation.warnings.len(), 1);

        let bad_rules =
            ValidationStep::new(base("v", json!({"data": 1, "rules": {"required": "x"}})));
        assert!(!bad_rules.validate_config().is_valid());
    }

    #[test]
    fn test_integer_type_rule() {
        let rules = Rules {
            types: [("count".to_string(), "integer".to_string())].into_iter().collect(),
            ..Default::default()
        };
        assert!(check_rules(&rules, &json!({"count": 3})).unwrap().is_empty());
        assert_eq!(check_rules(&rules, &json!({"count": 3.5})).unwrap().len(), 1);
    }
}
