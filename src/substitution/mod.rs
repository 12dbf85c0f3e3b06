//! Parameter substitution engine.
//!
//! Resolves `${source.path}` references against a [`SubstitutionContext`].
//! Sources are `env`, `workflow`, `input`, `variables`, `step` and `outputs`.
//!
//! Unresolved references are always reported. In strict mode the literal
//! expression is left in place; in lenient mode it is replaced with the
//! empty string. Callers decide whether a non-empty error list blocks.
//!
//! A literal `${` is protected by [`escape`] (`\${`), survives substitution
//! untouched, and is restored by [`unescape`].

mod context;

use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use regex_lite::{Captures, Regex};
use serde::Serialize;
use serde_json::{Map, Value};

pub use context::{CurrentStep, SubstitutionContext, WorkflowIdentity};

/// Regex matching `${...}`, with an optional leading backslash escape.
fn expression_regex() -> &'static Regex {
    static EXPRESSION_REGEX: OnceLock<Regex> = OnceLock::new();
    EXPRESSION_REGEX.get_or_init(|| Regex::new(r"(\\?)\$\{([^{}]*)\}").expect("valid regex"))
}

/// Machine-readable substitution failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubstitutionErrorCode {
    UnknownSource,
    UndefinedReference,
    SubstitutionError,
}

impl SubstitutionErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubstitutionErrorCode::UnknownSource => "UNKNOWN_SOURCE",
            SubstitutionErrorCode::UndefinedReference => "UNDEFINED_REFERENCE",
            SubstitutionErrorCode::SubstitutionError => "SUBSTITUTION_ERROR",
        }
    }
}

/// One failed reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubstitutionError {
    pub code: SubstitutionErrorCode,
    pub message: String,
    /// The raw path expression (without `${` `}`)
    pub expression: String,
}

impl SubstitutionError {
    fn new(code: SubstitutionErrorCode, expression: &str, message: String) -> Self {
        Self {
            code,
            message,
            expression: expression.to_string(),
        }
    }
}

impl fmt::Display for SubstitutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

/// Result of a substitution plus every reference that failed to resolve.
#[derive(Debug, Clone, PartialEq)]
pub struct Substituted<T> {
    pub result: T,
    pub errors: Vec<SubstitutionError>,
}

impl<T> Substituted<T> {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Expression source layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Env,
    Workflow,
    Input,
    Variables,
    Step,
    Outputs,
}

impl Source {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "env" => Some(Source::Env),
            "workflow" => Some(Source::Workflow),
            "input" => Some(Source::Input),
            "variables" => Some(Source::Variables),
            "step" => Some(Source::Step),
            "outputs" => Some(Source::Outputs),
            _ => None,
        }
    }
}

/// Substitute every expression inside a value.
///
/// Strings are substituted; sequences and mappings are walked recursively,
/// with mapping keys substituted too. Other scalars pass through.
pub fn substitute(value: &Value, ctx: &SubstitutionContext, strict: bool) -> Substituted<Value> {
    let mut errors = Vec::new();
    let result = substitute_value(value, ctx, strict, &mut errors);
    Substituted { result, errors }
}

fn substitute_value(
    value: &Value,
    ctx: &SubstitutionContext,
    strict: bool,
    errors: &mut Vec<SubstitutionError>,
) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_into(s, ctx, strict, errors)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute_value(v, ctx, strict, errors))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                let key = substitute_into(k, ctx, strict, errors);
                out.insert(key, substitute_value(v, ctx, strict, errors));
            }
            Value::Object(out)
        }
        _ => value.clone(),
    }
}

/// Substitute every expression inside a string.
pub fn substitute_string(
    text: &str,
    ctx: &SubstitutionContext,
    strict: bool,
) -> Substituted<String> {
    let mut errors = Vec::new();
    let result = substitute_into(text, ctx, strict, &mut errors);
    Substituted { result, errors }
}

fn substitute_into(
    text: &str,
    ctx: &SubstitutionContext,
    strict: bool,
    errors: &mut Vec<SubstitutionError>,
) -> String {
    if !text.contains("${") {
        return text.to_string();
    }

    expression_regex()
        .replace_all(text, |caps: &Captures| {
            let whole = &caps[0];
            if !caps[1].is_empty() {
                return whole.to_string();
            }

            match evaluate_expression(&caps[2], ctx) {
                Ok(value) => stringify(&value),
                Err(error) => {
                    errors.push(error);
                    if strict {
                        whole.to_string()
                    } else {
                        String::new()
                    }
                }
            }
        })
        .into_owned()
}

/// Evaluate one raw path expression (the text between `${` and `}`).
pub fn evaluate_expression(
    expression: &str,
    ctx: &SubstitutionContext,
) -> std::result::Result<Value, SubstitutionError> {
    let expr = expression.trim();
    if expr.is_empty() {
        return Err(SubstitutionError::new(
            SubstitutionErrorCode::SubstitutionError,
            expression,
            "Empty expression".to_string(),
        ));
    }

    let mut parts = expr.split('.');
    let source_name = parts.next().unwrap_or_default();
    let segments: Vec<&str> = parts.collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(SubstitutionError::new(
            SubstitutionErrorCode::SubstitutionError,
            expression,
            format!("Malformed path '{}'", expr),
        ));
    }

    let source = Source::parse(source_name).ok_or_else(|| {
        SubstitutionError::new(
            SubstitutionErrorCode::UnknownSource,
            expression,
            format!(
                "Unknown source '{}' in '{}' (expected env, workflow, input, variables, step, outputs)",
                source_name, expr
            ),
        )
    })?;

    let resolved = match source {
        Source::Env => lookup_map(&ctx.env, &segments),
        Source::Workflow => resolve_path(&ctx.workflow_value(), &segments).cloned(),
        Source::Input => lookup_map(&ctx.input, &segments),
        Source::Variables => lookup_map(&ctx.variables, &segments),
        Source::Outputs => lookup_map(&ctx.outputs, &segments),
        Source::Step => resolve_step_reference(ctx, &segments),
    };

    resolved.ok_or_else(|| {
        SubstitutionError::new(
            SubstitutionErrorCode::UndefinedReference,
            expression,
            format!("Undefined reference '{}'", expr),
        )
    })
}

/// `step.<stepId>.<output>[.<subpath>]` reads the current step's live outputs
/// when `stepId` is the executing step, otherwise a prior step's outputs.
/// Anything else addresses the current step layer (`step.id`, `step.type`).
fn resolve_step_reference(ctx: &SubstitutionContext, segments: &[&str]) -> Option<Value> {
    if segments.len() >= 2 {
        let step_id = segments[0];
        if let Some(current) = ctx.step.as_ref().filter(|s| s.id == step_id) {
            return lookup_map(&current.outputs, &segments[1..]);
        }
        if let Some(result) = ctx.step_results.get(step_id) {
            let outputs = result.get("outputs")?;
            return resolve_path(outputs, &segments[1..]).cloned();
        }
    }
    resolve_path(&ctx.step_value(), segments).cloned()
}

fn lookup_map(map: &Map<String, Value>, segments: &[&str]) -> Option<Value> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(Value::Object(map.clone()));
    };
    let head = map.get(*first)?;
    resolve_path(head, rest).cloned()
}

/// Walk dotted segments through objects and arrays. A null intermediate
/// resolves to `None`; a null leaf resolves to `Some(Null)`.
pub(crate) fn resolve_path<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Render a resolved value into text.
///
/// Strings are inserted raw, `null` as `"null"`, containers as compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        _ => value.to_string(),
    }
}

/// Whether the value contains any unescaped `${...}` expression.
pub fn has_substitution_patterns(value: &Value) -> bool {
    match value {
        Value::String(s) => string_has_patterns(s),
        Value::Array(items) => items.iter().any(has_substitution_patterns),
        Value::Object(map) => map
            .iter()
            .any(|(k, v)| string_has_patterns(k) || has_substitution_patterns(v)),
        _ => false,
    }
}

fn string_has_patterns(text: &str) -> bool {
    text.contains("${")
        && expression_regex()
            .captures_iter(text)
            .any(|caps| caps[1].is_empty())
}

/// Collect the distinct raw path expressions found anywhere in a value,
/// in first-seen order.
pub fn extract_expressions(value: &Value) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    collect_expressions(value, &mut seen, &mut out);
    out
}

fn collect_expressions(value: &Value, seen: &mut HashSet<String>, out: &mut Vec<String>) {
    match value {
        Value::String(s) => collect_from_str(s, seen, out),
        Value::Array(items) => {
            for item in items {
                collect_expressions(item, seen, out);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                collect_from_str(k, seen, out);
                collect_expressions(v, seen, out);
            }
        }
        _ => {}
    }
}

fn collect_from_str(text: &str, seen: &mut HashSet<String>, out: &mut Vec<String>) {
    if !text.contains("${") {
        return;
    }
    for caps in expression_regex().captures_iter(text) {
        if !caps[1].is_empty() {
            continue;
        }
        let expr = caps[2].trim().to_string();
        if seen.insert(expr.clone()) {
            out.push(expr);
        }
    }
}

/// Evaluate every expression in a value and return the failures.
pub fn validate_expressions(value: &Value, ctx: &SubstitutionContext) -> Vec<SubstitutionError> {
    extract_expressions(value)
        .iter()
        .filter_map(|expr| evaluate_expression(expr, ctx).err())
        .collect()
}

/// Protect literal `${` sequences from substitution.
pub fn escape(text: &str) -> String {
    text.replace("${", "\\${")
}

/// Restore escaped `${` sequences after substitution.
pub fn unescape(text: &str) -> String {
    text.replace("\\${", "${")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn ctx() -> SubstitutionContext {
        let mut env = std::collections::HashMap::new();
        env.insert("HOME_DIR".to_string(), "/home/ops".to_string());

        SubstitutionContext::new()
            .with_env(&env)
            .with_workflow(WorkflowIdentity {
                id: "billing.sync".into(),
                instance_id: "run-1".into(),
                name_space: "billing".into(),
                name: "sync".into(),
                version: "1.2.0".into(),
            })
            .with_input(obj(json!({
                "user": {"name": "Ada", "tags": ["a", "b"], "manager": null},
                "count": 3
            })))
            .with_variables(obj(json!({"region": "eu", "limits": {"max": 10}})))
            .with_current_step("transform", "dataTransformation", obj(json!({"partial": 7})))
            .with_step_result("fetch", json!({"status": 200, "body": {"items": [1, 2]}}))
    }

    #[test]
    fn test_plain_string_is_untouched() {
        let out = substitute_string("no expressions here", &ctx(), true);
        assert_eq!(out.result, "no expressions here");
        assert!(out.is_clean());
        assert!(!has_substitution_patterns(&json!("no expressions here")));
    }

    #[test]
    fn test_resolves_each_source() {
        let c = ctx();
        let cases = [
            ("${env.HOME_DIR}", "/home/ops"),
            ("${workflow.nameSpace}/${workflow.version}", "billing/1.2.0"),
            ("${input.user.name}", "Ada"),
            ("${input.user.tags.1}", "b"),
            ("${variables.limits.max}", "10"),
            ("${input.count} items", "3 items"),
        ];
        for (template, expected) in cases {
            let out = substitute_string(template, &c, true);
            assert_eq!(out.result, expected, "template {}", template);
            assert!(out.is_clean());
        }
    }

    #[test]
    fn test_step_references() {
        let c = ctx();
        // Prior step result
        assert_eq!(substitute_string("${step.fetch.status}", &c, true).result, "200");
        assert_eq!(
            substitute_string("${step.fetch.body.items}", &c, true).result,
            "[1,2]"
        );
        // Current step's live outputs
        assert_eq!(substitute_string("${step.transform.partial}", &c, true).result, "7");
        // Self-reference on the step layer
        assert_eq!(
            substitute_string("${step.id}:${step.type}", &c, true).result,
            "transform:dataTransformation"
        );
    }

    #[test]
    fn test_null_and_object_stringification() {
        let c = ctx();
        assert_eq!(substitute_string("${input.user.manager}", &c, true).result, "null");
        assert_eq!(
            substitute_string("${variables.limits}", &c, true).result,
            r#"{"max":10}"#
        );
    }

    #[test]
    fn test_null_intermediate_is_undefined() {
        let out = substitute_string("${input.user.manager.name}", &ctx(), true);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].code, SubstitutionErrorCode::UndefinedReference);
    }

    #[test]
    fn test_strict_keeps_literal_and_reports() {
        let out = substitute_string("${input.missing}", &ctx(), true);
        assert_eq!(out.result, "${input.missing}");
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].code, SubstitutionErrorCode::UndefinedReference);
    }

    #[test]
    fn test_lenient_blanks_and_still_reports() {
        let out = substitute_string("${input.missing}", &ctx(), false);
        assert_eq!(out.result, "");
        assert_eq!(out.errors.len(), 1);
    }

    #[test]
    fn test_unknown_source() {
        let out = substitute_string("x=${secrets.token}", &ctx(), false);
        assert_eq!(out.result, "x=");
        assert_eq!(out.errors[0].code, SubstitutionErrorCode::UnknownSource);
    }

    #[test]
    fn test_malformed_expression() {
        let out = substitute_string("${input..name} ${ }", &ctx(), true);
        assert_eq!(out.errors.len(), 2);
        assert!(out
            .errors
            .iter()
            .all(|e| e.code == SubstitutionErrorCode::SubstitutionError));
    }

    #[test]
    fn test_recursive_value_substitution_including_keys() {
        let value = json!({
            "${variables.region}-endpoint": "https://${variables.region}.example.com",
            "list": ["${input.user.name}", 5, true, null],
        });
        let out = substitute(&value, &ctx(), true);
        assert!(out.is_clean());
        assert_eq!(
            out.result,
            json!({
                "eu-endpoint": "https://eu.example.com",
                "list": ["Ada", 5, true, null],
            })
        );
    }

    #[test]
    fn test_substitution_is_idempotent_without_expressions() {
        let value = json!({"a": [1, "two", {"b": null}]});
        let once = substitute(&value, &ctx(), true);
        let twice = substitute(&once.result, &ctx(), true);
        assert_eq!(once.result, value);
        assert_eq!(twice.result, once.result);
    }

    #[test]
    fn test_extract_expressions_dedupes_and_recurses() {
        let value = json!({
            "a": "${input.user.name} and ${input.user.name}",
            "b": ["${variables.region}", {"c": "${ step.fetch.status }"}],
            "${env.HOME_DIR}": 1,
            "escaped": "\\${input.nope}"
        });
        let exprs = extract_expressions(&value);
        let set: HashSet<&str> = exprs.iter().map(String::as_str).collect();
        assert_eq!(exprs.len(), 4);
        assert_eq!(
            set,
            HashSet::from([
                "input.user.name",
                "variables.region",
                "step.fetch.status",
                "env.HOME_DIR"
            ])
        );
    }

    #[test]
    fn test_validate_expressions_collects_all_failures() {
        let value = json!(["${input.user.name}", "${input.nope}", "${bogus.x}"]);
        let errors = validate_expressions(&value, &ctx());
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].code, SubstitutionErrorCode::UndefinedReference);
        assert_eq!(errors[1].code, SubstitutionErrorCode::UnknownSource);
    }

    #[test]
    fn test_escape_survives_substitution() {
        let authored = format!("cost: {} and ${{input.count}}", escape("${price}"));
        assert!(!has_substitution_patterns(&json!(escape("${price}"))));

        let out = substitute_string(&authored, &ctx(), true);
        assert!(out.is_clean());
        assert_eq!(unescape(&out.result), "cost: ${price} and 3");
    }
}
