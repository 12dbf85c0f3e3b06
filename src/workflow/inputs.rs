//! Workflow input resolution against declared parameters.

use serde_json::{Map, Value};

use super::types::{ParameterDefinition, WorkflowDefinition};
use crate::error::{Error, Result};

/// Resolve run inputs against the definition's declared `inputs`.
///
/// Missing optional inputs take their default (or are left out), missing
/// required inputs without a default are rejected, and type mismatches are
/// rejected. Undeclared extra inputs pass through untouched. Every problem
/// is reported at once.
pub fn resolve_inputs(
    workflow: &WorkflowDefinition,
    provided: &Value,
) -> Result<Map<String, Value>> {
    let provided = match provided {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(Error::Validation(format!(
                "Workflow input must be an object, got {}",
                json_type_name(other)
            )))
        }
    };

    let mut resolved = Map::new();
    let mut errors = Vec::new();

    for (name, def) in &workflow.inputs {
        match resolve_parameter(name, def, provided.get(name)) {
            Ok(Some(value)) => {
                resolved.insert(name.clone(), value);
            }
            Ok(None) => {}
            Err(e) => errors.push(e),
        }
    }

    if !errors.is_empty() {
        return Err(Error::Validation(format!(
            "Input validation failed:\n  - {}",
            errors.join("\n  - ")
        )));
    }

    for (key, value) in provided {
        resolved.entry(key).or_insert(value);
    }

    Ok(resolved)
}

fn resolve_parameter(
    name: &str,
    def: &ParameterDefinition,
    value: Option<&Value>,
) -> std::result::Result<Option<Value>, String> {
    match value {
        None | Some(Value::Null) => match &def.default {
            Some(default) => Ok(Some(default.clone())),
            None if def.required => Err(format!("Missing required input: {}", name)),
            None => Ok(None),
        },
        Some(v) if matches_type(&def.param_type, v) => Ok(Some(v.clone())),
        Some(v) => Err(format!(
            "Input '{}' expected type '{}', got '{}'",
            name,
            def.param_type,
            json_type_name(v)
        )),
    }
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow() -> WorkflowDefinition {
        serde_json::from_value(json!({
            "nameSpace": "ops",
            "name": "inputs",
            "version": "1.0.0",
            "inputs": {
                "region": {"type": "string", "required": true},
                "limit": {"type": "integer", "default": 10},
                "verbose": {"type": "boolean"}
            },
            "steps": [{"id": "a", "type": "log", "config": {"message": "x"}}]
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults_and_passthrough() {
        let inputs = resolve_inputs(&workflow(), &json!({"region": "eu", "extra": 1})).unwrap();
        assert_eq!(inputs["region"], "eu");
        assert_eq!(inputs["limit"], 10);
        assert_eq!(inputs["extra"], 1);
        assert!(!inputs.contains_key("verbose"));
    }

    #[test]
    fn test_all_problems_reported() {
        let err = resolve_inputs(&workflow(), &json!({"limit": 2.5, "verbose": "yes"}))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Missing required input: region"));
        assert!(err.contains("'limit' expected type 'integer'"));
        assert!(err.contains("'verbose' expected type 'boolean'"));
    }

    #[test]
    fn test_null_input_counts_as_empty() {
        let err = resolve_inputs(&workflow(), &Value::Null).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(resolve_inputs(&workflow(), &json!([1])).is_err());
    }
}
