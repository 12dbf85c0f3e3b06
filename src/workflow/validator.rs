//! Workflow validation.
//!
//! Three composable passes over an untyped document:
//! - schema: required fields, field types, step shape and per-type config
//! - semantics: conventions, version format, ids, dependencies, timeouts
//! - expressions (optional): every `${...}` evaluated against a context
//!
//! Passes never stop at the first problem; every issue is collected.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use regex_lite::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use super::parser::parse_document;
use super::report::{codes, ParseResult, ValidationIssue, ValidationResult};
use super::types::{StepType, WorkflowDefinition};
use crate::steps::StepRegistry;
use crate::substitution::{validate_expressions, SubstitutionContext};

const MIN_WORKFLOW_TIMEOUT_MS: f64 = 1000.0;
const MIN_STEP_TIMEOUT_MS: f64 = 100.0;

const REQUIRED_FIELDS: [&str; 4] = ["nameSpace", "name", "version", "steps"];

fn version_regex() -> &'static Regex {
    static VERSION_REGEX: OnceLock<Regex> = OnceLock::new();
    VERSION_REGEX.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("valid regex"))
}

fn namespace_regex() -> &'static Regex {
    static NAMESPACE_REGEX: OnceLock<Regex> = OnceLock::new();
    NAMESPACE_REGEX.get_or_init(|| Regex::new(r"^[a-z][a-zA-Z0-9._-]*$").expect("valid regex"))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key).filter(|v| !v.is_null())
}

fn steps_of(doc: &Value) -> &[Value] {
    doc.get("steps")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn step_id(step: &Value) -> Option<&str> {
    step.get("id").and_then(Value::as_str)
}

fn dependencies(step: &Value) -> Vec<&str> {
    match step.get("dependsOn") {
        Some(Value::String(id)) => vec![id.as_str()],
        Some(Value::Array(ids)) => ids.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

/// Validates workflow documents against the registered step types.
#[derive(Clone)]
pub struct WorkflowValidator {
    registry: Arc<StepRegistry>,
}

impl Default for WorkflowValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowValidator {
    /// Validator backed by a registry of the built-in steps.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(StepRegistry::new()))
    }

    pub fn with_registry(registry: Arc<StepRegistry>) -> Self {
        Self { registry }
    }

    /// Structural checks.
    pub fn validate_schema(&self, doc: &Value) -> ValidationResult {
        let mut result = ValidationResult::default();

        let Some(root) = doc.as_object() else {
            result.push(ValidationIssue::error(
                codes::INVALID_DOCUMENT,
                format!("Workflow must be a mapping, got {}", kind(doc)),
            ));
            return result;
        };

        for name in REQUIRED_FIELDS {
            if field(root, name).is_none() {
                result.push(
                    ValidationIssue::error(
                        codes::MISSING_REQUIRED_FIELD,
                        format!("Missing required field: {}", name),
                    )
                    .at(name),
                );
            }
        }

        let check_type = |result: &mut ValidationResult,
                          key: &str,
                          ok: fn(&Value) -> bool,
                          want: &str| {
            if let Some(value) = field(root, key) {
                if !ok(value) {
                    result.push(
                        ValidationIssue::error(
                            codes::INVALID_FIELD_TYPE,
                            format!("Field '{}' must be {}, got {}", key, want, kind(value)),
                        )
                        .at(key),
                    );
                }
            }
        };
        check_type(&mut result, "nameSpace", Value::is_string, "a string");
        check_type(&mut result, "name", Value::is_string, "a string");
        check_type(&mut result, "version", |v| v.is_string() || v.is_number(), "a string");
        check_type(&mut result, "description", Value::is_string, "a string");
        check_type(&mut result, "author", Value::is_string, "a string");
        check_type(&mut result, "tags", Value::is_array, "a list");
        check_type(&mut result, "metadata", Value::is_object, "a mapping");
        check_type(&mut result, "inputs", Value::is_object, "a mapping");
        check_type(&mut result, "outputs", Value::is_object, "a mapping");
        check_type(&mut result, "variables", Value::is_object, "a mapping");
        check_type(&mut result, "steps", Value::is_array, "a list");

        if let Some(Value::Object(metadata)) = field(root, "metadata") {
            if let Some(timeout) = field(metadata, "timeout").filter(|v| !v.is_number()) {
                result.push(
                    ValidationIssue::error(
                        codes::INVALID_FIELD_TYPE,
                        format!("metadata.timeout must be a number, got {}", kind(timeout)),
                    )
                    .at("metadata.timeout"),
                );
            }
        }

        if let Some(Value::Array(steps)) = field(root, "steps") {
            if steps.is_empty() {
                result.push(
                    ValidationIssue::error(
                        codes::EMPTY_STEPS,
                        "Workflow must have at least one step",
                    )
                    .at("steps"),
                );
            }
            for (index, step) in steps.iter().enumerate() {
                self.validate_step_shape(index, step, &mut result);
            }
        }

        result
    }

    fn validate_step_shape(&self, index: usize, step: &Value, result: &mut ValidationResult) {
        let path = format!("steps[{}]", index);
        let Some(step) = step.as_object() else {
            result.push(
                ValidationIssue::error(
                    codes::INVALID_STEP,
                    format!("Step {} must be a mapping, got {}", index, kind(step)),
                )
                .at(path),
            );
            return;
        };

        let id = match field(step, "id") {
            None => {
                result.push(
                    ValidationIssue::error(
                        codes::MISSING_STEP_ID,
                        format!("Step {} is missing an id", index),
                    )
                    .at(format!("{}.id", path)),
                );
                None
            }
            Some(Value::String(id)) if !id.trim().is_empty() => Some(id.as_str()),
            Some(other) => {
                result.push(
                    ValidationIssue::error(
                        codes::INVALID_FIELD_TYPE,
                        format!(
                            "Step {} id must be a non-empty string, got {}",
                            index,
                            kind(other)
                        ),
                    )
                    .at(format!("{}.id", path)),
                );
                None
            }
        };
        let label = id.map(str::to_string).unwrap_or_else(|| index.to_string());

        let step_type = match field(step, "type") {
            None => {
                result.push(
                    ValidationIssue::error(
                        codes::MISSING_STEP_TYPE,
                        format!("Step '{}' is missing a type", label),
                    )
                    .at(format!("{}.type", path)),
                );
                None
            }
            Some(value) => {
                let parsed = value.as_str().and_then(StepType::parse);
                if parsed.is_none() {
                    let allowed: Vec<&str> = StepType::ALL.iter().map(StepType::as_str).collect();
                    result.push(
                        ValidationIssue::error(
                            codes::INVALID_STEP_TYPE,
                            format!(
                                "Step '{}' has invalid type {} (allowed: {})",
                                label,
                                value,
                                allowed.join(", ")
                            ),
                        )
                        .at(format!("{}.type", path)),
                    );
                }
                parsed
            }
        };

        let field_types: [(&str, fn(&Value) -> bool, &str); 5] = [
            ("enabled", Value::is_boolean, "a boolean"),
            ("continueOnError", Value::is_boolean, "a boolean"),
            ("timeout", Value::is_number, "a number"),
            ("name", Value::is_string, "a string"),
            ("description", Value::is_string, "a string"),
        ];
        for (key, ok, want) in field_types {
            if let Some(value) = field(step, key).filter(|v| !ok(v)) {
                result.push(
                    ValidationIssue::error(
                        codes::INVALID_FIELD_TYPE,
                        format!("Step '{}' {} must be {}, got {}", label, key, want, kind(value)),
                    )
                    .at(format!("{}.{}", path, key)),
                );
            }
        }

        match field(step, "dependsOn") {
            None | Some(Value::String(_)) => {}
            Some(Value::Array(ids)) if ids.iter().all(Value::is_string) => {}
            Some(other) => result.push(
                ValidationIssue::error(
                    codes::INVALID_FIELD_TYPE,
                    format!(
                        "Step '{}' dependsOn must be a step id or a list of ids, got {}",
                        label,
                        kind(other)
                    ),
                )
                .at(format!("{}.dependsOn", path)),
            ),
        }

        let config = match field(step, "config") {
            None => Value::Object(Map::new()),
            Some(config @ Value::Object(_)) => config.clone(),
            Some(other) => {
                result.push(
                    ValidationIssue::error(
                        codes::INVALID_FIELD_TYPE,
                        format!("Step '{}' config must be a mapping, got {}", label, kind(other)),
                    )
                    .at(format!("{}.config", path)),
                );
                return;
            }
        };

        let Some(step_type) = step_type else {
            return;
        };
        let Some(check) = self
            .registry
            .validate_step_config(step_type.as_str(), &label, config)
        else {
            return;
        };
        for message in check.errors {
            result.push(
                ValidationIssue::error(
                    codes::INVALID_STEP_CONFIG,
                    format!("Step '{}' ({}): {}", label, step_type, message),
                )
                .at(format!("{}.config", path)),
            );
        }
        for message in check.warnings {
            result.push(
                ValidationIssue::warning(
                    codes::STEP_CONFIG_WARNING,
                    format!("Step '{}' ({}): {}", label, step_type, message),
                )
                .at(format!("{}.config", path)),
            );
        }
    }

    /// Cross-field checks. Tolerates malformed documents.
    pub fn validate_semantics(&self, doc: &Value) -> ValidationResult {
        let mut result = ValidationResult::default();

        match doc.get("nameSpace") {
            Some(Value::String(ns)) if !namespace_regex().is_match(ns) => result.push(
                ValidationIssue::warning(
                    codes::NAMESPACE_CONVENTION,
                    format!("Namespace '{}' should start with a lowercase letter", ns),
                )
                .at("nameSpace"),
            ),
            _ => {}
        }

        match doc.get("version") {
            Some(Value::String(v)) if version_regex().is_match(v) => {}
            Some(Value::String(v)) => result.push(
                ValidationIssue::error(
                    codes::INVALID_VERSION_FORMAT,
                    format!("Version '{}' must follow semantic versioning (x.y.z)", v),
                )
                .at("version"),
            ),
            Some(Value::Number(n)) => result.push(
                ValidationIssue::error(
                    codes::INVALID_VERSION_FORMAT,
                    format!("Version {} must be a quoted x.y.z string", n),
                )
                .at("version"),
            ),
            _ => {}
        }

        if let Some(timeout) = doc.pointer("/metadata/timeout").and_then(Value::as_f64) {
            if timeout < MIN_WORKFLOW_TIMEOUT_MS {
                result.push(
                    ValidationIssue::error(
                        codes::INVALID_TIMEOUT,
                        format!(
                            "Workflow timeout must be at least {}ms, got {}",
                            MIN_WORKFLOW_TIMEOUT_MS, timeout
                        ),
                    )
                    .at("metadata.timeout"),
                );
            }
        }

        let steps = steps_of(doc);

        // first declaration wins for positional checks
        let mut positions: HashMap<&str, usize> = HashMap::new();
        for (index, step) in steps.iter().enumerate() {
            let Some(id) = step_id(step) else {
                continue;
            };
            if positions.contains_key(id) {
                result.push(
                    ValidationIssue::error(
                        codes::DUPLICATE_STEP_ID,
                        format!("Duplicate step id: {}", id),
                    )
                    .at(format!("steps[{}].id", index)),
                );
            } else {
                positions.insert(id, index);
            }
        }

        for (index, step) in steps.iter().enumerate() {
            let label = step_id(step).map(str::to_string).unwrap_or_else(|| index.to_string());

            for dep in dependencies(step) {
                match positions.get(dep) {
                    None => result.push(
                        ValidationIssue::error(
                            codes::INVALID_DEPENDENCY,
                            format!("Step '{}' depends on non-existent step '{}'", label, dep),
                        )
                        .at(format!("steps[{}].dependsOn", index)),
                    ),
                    Some(&at) if at > index => result.push(
                        ValidationIssue::warning(
                            codes::FORWARD_DEPENDENCY,
                            format!(
                                "Step '{}' depends on '{}', which is declared after it and will not have run yet",
                                label, dep
                            ),
                        )
                        .at(format!("steps[{}].dependsOn", index)),
                    ),
                    Some(_) => {}
                }
            }

            if let Some(timeout) = step.get("timeout").and_then(Value::as_f64) {
                if timeout < MIN_STEP_TIMEOUT_MS {
                    result.push(
                        ValidationIssue::error(
                            codes::INVALID_STEP_TIMEOUT,
                            format!(
                                "Step '{}' timeout must be at least {}ms, got {}",
                                label, MIN_STEP_TIMEOUT_MS, timeout
                            ),
                        )
                        .at(format!("steps[{}].timeout", index)),
                    );
                }
            }

            if let Some(step_type) = step
                .get("type")
                .and_then(Value::as_str)
                .and_then(StepType::parse)
            {
                if !self.registry.has_step(step_type.as_str()) {
                    let reason = if step_type.is_reserved() {
                        "is reserved and has no implementation"
                    } else {
                        "is not registered"
                    };
                    result.push(
                        ValidationIssue::warning(
                            codes::UNSUPPORTED_STEP_TYPE,
                            format!("Step '{}' type '{}' {}", label, step_type, reason),
                        )
                        .at(format!("steps[{}].type", index)),
                    );
                }
            }
        }

        for cycle in find_cycles(steps) {
            result.push(
                ValidationIssue::error(
                    codes::CIRCULAR_DEPENDENCY,
                    format!("Circular dependency: {}", cycle.join(" -> ")),
                )
                .at("steps"),
            );
        }

        result
    }

    /// Schema then semantics, merged.
    pub fn validate(&self, doc: &Value) -> ValidationResult {
        let mut result = self.validate_schema(doc);
        result.merge(self.validate_semantics(doc));
        result
    }

    /// Validate an already-typed definition.
    pub fn validate_definition(&self, workflow: &WorkflowDefinition) -> ValidationResult {
        match serde_json::to_value(workflow) {
            Ok(doc) => self.validate(&doc),
            Err(e) => {
                let mut result = ValidationResult::default();
                result.push(ValidationIssue::error(codes::INVALID_DOCUMENT, e.to_string()));
                result
            }
        }
    }

    /// Full pipeline: parse, schema, semantics, optional expression check,
    /// then typed conversion.
    pub fn parse_and_validate(
        &self,
        yaml: &str,
        context: Option<&SubstitutionContext>,
    ) -> ParseResult {
        let doc = match parse_document(yaml) {
            Ok(doc) => doc,
            Err(issue) => return ParseResult::failed(issue),
        };

        let mut result = self.validate(&doc);

        if let Some(ctx) = context {
            for error in validate_expressions(&doc, ctx) {
                result.push(ValidationIssue::error(
                    error.code.as_str(),
                    format!("${{{}}}: {}", error.expression, error.message),
                ));
            }
        }

        let mut workflow = None;
        if result.valid {
            match serde_json::from_value::<WorkflowDefinition>(doc) {
                Ok(parsed) => workflow = Some(parsed),
                Err(e) => result.push(ValidationIssue::error(
                    codes::SCHEMA_VALIDATION_ERROR,
                    format!("Workflow does not match the definition shape: {}", e),
                )),
            }
        }

        debug!(
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "Workflow validated"
        );

        ParseResult {
            success: result.errors.is_empty(),
            workflow,
            errors: result.errors,
            warnings: result.warnings,
        }
    }
}

/// Validate a typed definition with the built-in step registry.
pub fn validate_workflow(workflow: &WorkflowDefinition) -> ValidationResult {
    WorkflowValidator::new().validate_definition(workflow)
}

/// Each distinct dependency cycle, as the ids along it.
fn find_cycles(steps: &[Value]) -> Vec<Vec<String>> {
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for step in steps {
        if let Some(id) = step_id(step) {
            if !edges.contains_key(id) {
                order.push(id);
            }
            edges.entry(id).or_default().extend(dependencies(step));
        }
    }

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        done: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        seen: &mut HashSet<Vec<&'a str>>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        if let Some(start) = stack.iter().position(|n| *n == node) {
            let members = &stack[start..];
            let mut key = members.to_vec();
            key.sort_unstable();
            if seen.insert(key) {
                let mut cycle: Vec<String> = members.iter().map(|s| s.to_string()).collect();
                cycle.push(node.to_string());
                cycles.push(cycle);
            }
            return;
        }
        if done.contains(node) {
            return;
        }

        stack.push(node);
        for next in edges.get(node).into_iter().flatten() {
            if edges.contains_key(next) {
                visit(*next, edges, done, stack, seen, cycles);
            }
        }
        stack.pop();
        done.insert(node);
    }

    let mut done = HashSet::new();
    let mut seen = HashSet::new();
    let mut cycles = Vec::new();
    for id in order {
        visit(id, &edges, &mut done, &mut Vec::new(), &mut seen, &mut cycles);
    }
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(steps: Value) -> Value {
        json!({
            "nameSpace": "ops",
            "name": "sample",
            "version": "1.0.0",
            "steps": steps
        })
    }

    fn log_step(id: &str) -> Value {
        json!({"id": id, "type": "log", "config": {"message": "hi"}})
    }

    fn codes_of(issues: &[ValidationIssue]) -> Vec<&str> {
        issues.iter().map(|i| i.code.as_str()).collect()
    }

    #[test]
    fn test_valid_document() {
        let result = WorkflowValidator::new().validate(&doc(json!([log_step("a"), log_step("b")])));
        assert!(result.valid, "{:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_one_error_per_missing_field() {
        let result = WorkflowValidator::new().validate_schema(&json!({"nameSpace": "ops"}));
        assert!(!result.valid);
        let messages: Vec<&str> = result.errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "Missing required field: name",
                "Missing required field: version",
                "Missing required field: steps",
            ]
        );
    }

    #[test]
    fn test_non_mapping_document() {
        let result = WorkflowValidator::new().validate(&json!(["a"]));
        assert_eq!(codes_of(&result.errors), vec![codes::INVALID_DOCUMENT]);
    }

    #[test]
    fn test_step_shape_errors_are_collected() {
        let result = WorkflowValidator::new().validate_schema(&doc(json!([
            "not a step",
            {"type": "log", "config": {"message": "x"}},
            {"id": "b"},
            {"id": "c", "type": "teleport"},
            {"id": "d", "type": "log", "config": {}},
            {"id": "e", "type": "log", "config": "oops"},
        ])));

        assert_eq!(
            codes_of(&result.errors),
            vec![
                codes::INVALID_STEP,
                codes::MISSING_STEP_ID,
                codes::MISSING_STEP_TYPE,
                codes::INVALID_STEP_TYPE,
                codes::INVALID_STEP_CONFIG,
                codes::INVALID_FIELD_TYPE,
            ]
        );
        assert_eq!(result.errors[4].path.as_deref(), Some("steps[4].config"));
        assert!(result.errors[3].message.contains("dataTransformation"));
    }

    #[test]
    fn test_empty_steps() {
        let result = WorkflowValidator::new().validate_schema(&doc(json!([])));
        assert_eq!(codes_of(&result.errors), vec![codes::EMPTY_STEPS]);
    }

    #[test]
    fn test_step_config_warnings_surface() {
        let long = "x".repeat(1200);
        let result = WorkflowValidator::new().validate_schema(&doc(json!([
            {"id": "a", "type": "log", "config": {"message": long}}
        ])));
        assert!(result.valid);
        assert_eq!(codes_of(&result.warnings), vec![codes::STEP_CONFIG_WARNING]);
    }

    #[test]
    fn test_version_format() {
        let validator = WorkflowValidator::new();
        let mut bad = doc(json!([log_step("a")]));
        bad["version"] = json!("1.0");
        let result = validator.validate_semantics(&bad);
        assert_eq!(codes_of(&result.errors), vec![codes::INVALID_VERSION_FORMAT]);

        bad["version"] = json!(1.0);
        assert!(validator.validate_semantics(&bad).has_code(codes::INVALID_VERSION_FORMAT));

        bad["version"] = json!("1.0.0-beta");
        assert!(validator.validate_semantics(&bad).has_code(codes::INVALID_VERSION_FORMAT));

        bad["version"] = json!("1.0.0");
        assert!(validator.validate_semantics(&bad).valid);
    }

    #[test]
    fn test_namespace_is_only_a_warning() {
        let mut workflow = doc(json!([log_step("a")]));
        workflow["nameSpace"] = json!("Billing");
        let result = WorkflowValidator::new().validate(&workflow);
        assert!(result.valid);
        assert_eq!(codes_of(&result.warnings), vec![codes::NAMESPACE_CONVENTION]);
    }

    #[test]
    fn test_duplicate_ids_flag_later_occurrences() {
        let result = WorkflowValidator::new()
            .validate_semantics(&doc(json!([log_step("a"), log_step("a"), log_step("a")])));
        assert_eq!(
            codes_of(&result.errors),
            vec![codes::DUPLICATE_STEP_ID, codes::DUPLICATE_STEP_ID]
        );
        assert_eq!(result.errors[0].path.as_deref(), Some("steps[1].id"));
    }

    #[test]
    fn test_dependencies() {
        let result = WorkflowValidator::new().validate_semantics(&doc(json!([
            {"id": "a", "type": "log", "dependsOn": "b", "config": {"message": "x"}},
            {"id": "b", "type": "log", "dependsOn": ["ghost"], "config": {"message": "x"}},
        ])));
        assert_eq!(codes_of(&result.errors), vec![codes::INVALID_DEPENDENCY]);
        assert_eq!(codes_of(&result.warnings), vec![codes::FORWARD_DEPENDENCY]);
    }

    #[test]
    fn test_cycles() {
        let result = WorkflowValidator::new().validate_semantics(&doc(json!([
            {"id": "a", "type": "log", "dependsOn": "c"},
            {"id": "b", "type": "log", "dependsOn": "a"},
            {"id": "c", "type": "log", "dependsOn": "b"},
            {"id": "d", "type": "log", "dependsOn": "d"},
        ])));
        let cycles: Vec<&ValidationIssue> = result
            .errors
            .iter()
            .filter(|e| e.code == codes::CIRCULAR_DEPENDENCY)
            .collect();
        assert_eq!(cycles.len(), 2);
        assert!(cycles[0].message.contains("a -> c -> b -> a"));
        assert!(cycles[1].message.contains("d -> d"));
    }

    #[test]
    fn test_timeout_bounds() {
        let mut workflow = doc(json!([
            {"id": "a", "type": "log", "timeout": 50, "config": {"message": "x"}},
            {"id": "b", "type": "log", "timeout": 100, "config": {"message": "x"}},
        ]));
        workflow["metadata"] = json!({"timeout": 999});
        let result = WorkflowValidator::new().validate_semantics(&workflow);
        assert_eq!(
            codes_of(&result.errors),
            vec![codes::INVALID_TIMEOUT, codes::INVALID_STEP_TIMEOUT]
        );
    }

    #[test]
    fn test_reserved_types_warn() {
        let result = WorkflowValidator::new().validate(&doc(json!([
            {"id": "loop", "type": "forEach", "config": {}}
        ])));
        assert!(result.valid);
        assert_eq!(codes_of(&result.warnings), vec![codes::UNSUPPORTED_STEP_TYPE]);
    }

    #[test]
    fn test_parse_and_validate_success() {
        let yaml = r#"
nameSpace: ops
name: greet
version: 1.0.0
inputs:
  who:
    type: string
steps:
  - id: hello
    type: log
    config:
      message: "hello ${input.who}"
"#;
        let ctx = SubstitutionContext::new().with_input(
            json!({"who": "Ada"}).as_object().cloned().unwrap_or_default(),
        );
        let parsed = WorkflowValidator::new().parse_and_validate(yaml, Some(&ctx));
        assert!(parsed.success, "{:?}", parsed.errors);
        let workflow = parsed.workflow.unwrap();
        assert_eq!(workflow.steps[0].id, "hello");
    }

    #[test]
    fn test_parse_and_validate_reports_unresolved_expressions() {
        let yaml = r#"
nameSpace: ops
name: greet
version: 1.0.0
steps:
  - id: hello
    type: log
    config:
      message: "${input.missing} and ${secrets.key}"
"#;
        let parsed =
            WorkflowValidator::new().parse_and_validate(yaml, Some(&SubstitutionContext::new()));
        assert!(!parsed.success);
        assert!(parsed.workflow.is_none());
        assert_eq!(
            codes_of(&parsed.errors),
            vec!["UNDEFINED_REFERENCE", "UNKNOWN_SOURCE"]
        );

        let without_context = WorkflowValidator::new().parse_and_validate(yaml, None);
        assert!(without_context.success);
    }

    #[test]
    fn test_parse_and_validate_yaml_error() {
        let parsed = WorkflowValidator::new().parse_and_validate("steps: [", None);
        assert!(!parsed.success);
        assert!(parsed.workflow.is_none());
        assert_eq!(codes_of(&parsed.errors), vec![codes::YAML_PARSE_ERROR]);
    }

    #[test]
    fn test_parse_and_validate_collects_across_passes() {
        let yaml = r#"
nameSpace: Ops
version: "1.0"
steps:
  - id: a
    type: log
    config: {}
  - id: a
    type: delay
    dependsOn: ghost
    config:
      duration: 10
"#;
        let parsed = WorkflowValidator::new().parse_and_validate(yaml, None);
        assert!(!parsed.success);
        let found = codes_of(&parsed.errors);
        for code in [
            codes::MISSING_REQUIRED_FIELD,
            codes::INVALID_STEP_CONFIG,
            codes::INVALID_VERSION_FORMAT,
            codes::DUPLICATE_STEP_ID,
            codes::INVALID_DEPENDENCY,
        ] {
            assert!(found.contains(&code), "missing {}", code);
        }
        assert_eq!(codes_of(&parsed.warnings), vec![codes::NAMESPACE_CONVENTION]);
    }

    #[test]
    fn test_validate_typed_definition() {
        let workflow: WorkflowDefinition =
            serde_json::from_value(doc(json!([log_step("a")]))).unwrap();
        assert!(validate_workflow(&workflow).valid);
    }
}
