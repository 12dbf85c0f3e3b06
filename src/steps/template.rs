//! Step-local `${...}` resolution.
//!
//! Steps resolve placeholders in their own config against the execution
//! context. Lookup order for `${key}`:
//!
//! 1. workflow variables (dotted path, `variables.` prefix optional)
//! 2. environment snapshot (exact key, `env.` prefix optional)
//! 3. `steps.<id>.<path>` into a prior step's outputs
//! 4. `input.<path>` into the workflow inputs
//!
//! Unresolved placeholders are left in place verbatim.

use std::sync::OnceLock;

use regex_lite::{Captures, Regex};
use serde_json::{Map, Value};

use crate::substitution::{resolve_path, stringify};

use super::types::StepExecutionContext;

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER_REGEX.get_or_init(|| Regex::new(r"(\\?)\$\{([^{}]+)\}").expect("valid regex"))
}

fn whole_placeholder_regex() -> &'static Regex {
    static WHOLE_REGEX: OnceLock<Regex> = OnceLock::new();
    WHOLE_REGEX.get_or_init(|| Regex::new(r"^\$\{([^{}]+)\}$").expect("valid regex"))
}

/// Look up a single placeholder key.
pub fn lookup(key: &str, ctx: &StepExecutionContext) -> Option<Value> {
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let var_path = key.strip_prefix("variables.").unwrap_or(key);
    if let Some(value) = lookup_map(&ctx.variables, var_path) {
        return Some(value);
    }

    let env_key = key.strip_prefix("env.").unwrap_or(key);
    if let Some(value) = ctx.env.get(env_key) {
        return Some(Value::String(value.clone()));
    }

    if let Some(rest) = key.strip_prefix("steps.") {
        let (step_id, path) = rest.split_once('.').unwrap_or((rest, ""));
        if let Some(result) = ctx.step_results.get(step_id) {
            return lookup_map(&result.outputs, path);
        }
    }

    if let Some(path) = key.strip_prefix("input.") {
        return lookup_map(&ctx.inputs, path);
    }

    None
}

fn lookup_map(map: &Map<String, Value>, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(Value::Object(map.clone()));
    }
    let segments: Vec<&str> = path.split('.').collect();
    let (first, rest) = segments.split_first()?;
    let root = map.get(*first)?;
    resolve_path(root, rest).cloned()
}

/// Replace every resolvable placeholder in `text`.
pub fn resolve_template(text: &str, ctx: &StepExecutionContext) -> String {
    if !text.contains("${") {
        return text.to_string();
    }
    placeholder_regex()
        .replace_all(text, |caps: &Captures| {
            if !caps[1].is_empty() {
                return caps[0].to_string();
            }
            match lookup(&caps[2], ctx) {
                Some(value) => stringify(&value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Resolve placeholders throughout a JSON value.
///
/// A string that is exactly one placeholder resolves to the referenced value
/// with its type intact; anything else is rendered as text.
pub fn resolve_value(value: &Value, ctx: &StepExecutionContext) -> Value {
    match value {
        Value::String(s) => {
            if let Some(caps) = whole_placeholder_regex().captures(s) {
                if let Some(found) = lookup(&caps[1], ctx) {
                    return found;
                }
                return value.clone();
            }
            Value::String(resolve_template(s, ctx))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, ctx)).collect()),
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::types::test_support::context;
    use crate::steps::StepResult;
    use serde_json::json;

    fn ctx() -> StepExecutionContext {
        let mut ctx = context();
        ctx.variables.insert("user".into(), json!({"name": "Ada", "tags": ["x", "y"]}));
        ctx.variables.insert("HOME".into(), json!("from-variables"));
        ctx.env.insert("HOME".into(), "/home/ada".into());
        ctx.env.insert("REGION".into(), "eu-west-1".into());
        ctx.inputs.insert("limit".into(), json!(5));

        let mut outputs = Map::new();
        outputs.insert("body".into(), json!({"items": [1, 2, 3]}));
        ctx.add_step_result("fetch", StepResult::success(outputs));
        ctx
    }

    #[test]
    fn test_lookup_order() {
        let ctx = ctx();
        // variables shadow env
        assert_eq!(resolve_template("${HOME}", &ctx), "from-variables");
        assert_eq!(resolve_template("${env.HOME}", &ctx), "/home/ada");
        assert_eq!(resolve_template("${REGION}", &ctx), "eu-west-1");
        assert_eq!(resolve_template("${user.name}", &ctx), "Ada");
        assert_eq!(resolve_template("${variables.user.tags.1}", &ctx), "y");
        assert_eq!(resolve_template("${steps.fetch.body.items.0}", &ctx), "1");
        assert_eq!(resolve_template("${input.limit}", &ctx), "5");
    }

    #[test]
    fn test_unresolved_left_verbatim() {
        let ctx = ctx();
        assert_eq!(
            resolve_template("hi ${missing.key} and ${steps.nope.x}", &ctx),
            "hi ${missing.key} and ${steps.nope.x}"
        );
        assert_eq!(resolve_template("\\${user.name}", &ctx), "\\${user.name}");
    }

    #[test]
    fn test_resolve_value_preserves_types() {
        let ctx = ctx();
        let resolved = resolve_value(
            &json!({
                "items": "${steps.fetch.body.items}",
                "label": "count=${input.limit}",
                "nested": ["${user.name}", 7]
            }),
            &ctx,
        );
        assert_eq!(resolved["items"], json!([1, 2, 3]));
        assert_eq!(resolved["label"], "count=5");
        assert_eq!(resolved["nested"], json!(["Ada", 7]));
    }
}
