//! Data transformation step - run an ordered pipeline over a value.
//!
//! Each stage receives the previous stage's output. A failing stage stops
//! the pipeline; stats for the stages that completed are kept in metadata.
//!
//! ## Example
//!
//! ```yaml
//! - id: shape
//!   type: dataTransformation
//!   config:
//!     input: ${steps.fetch.body.users}
//!     outputVariable: activeUsers
//!     transformations:
//!       - type: filter
//!         condition: "status == 'active'"
//!       - type: sort
//!         field: age
//!         order: desc
//!       - type: map
//!         mapping:
//!           name: profile.name
//!           label: "${item.profile.name} (${item.age})"
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Instant;

use async_trait::async_trait;
use regex_lite::{Captures, Regex};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::template::resolve_value;
use super::types::{ConfigValidation, Step, StepBase, StepExecutionContext, StepResult};
use crate::error::{Error, Result};
use crate::substitution::{resolve_path, stringify};

/// Data transformation step.
pub struct DataTransformationStep {
    base: StepBase,
}

impl DataTransformationStep {
    pub fn new(base: StepBase) -> Self {
        Self { base }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransformationConfig {
    #[serde(default)]
    input: Value,

    #[serde(default)]
    transformations: Vec<Transformation>,

    #[serde(default)]
    output_variable: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Transformation {
    Filter {
        #[serde(default)]
        condition: Option<String>,
        #[serde(default)]
        field: Option<String>,
        #[serde(default)]
        operator: Option<String>,
        #[serde(default)]
        value: Value,
    },
    Map {
        #[serde(default)]
        mapping: Option<Map<String, Value>>,
        #[serde(default)]
        expression: Option<Value>,
    },
    Sort {
        #[serde(default)]
        field: Option<String>,
        #[serde(default)]
        order: SortOrder,
    },
    Group {
        field: String,
    },
    Aggregate {
        fields: BTreeMap<String, AggregateSpec>,
    },
    Merge {
        with: Value,
        #[serde(default)]
        on: Option<String>,
    },
    Extract {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        fields: Option<Vec<String>>,
    },
    Custom {
        function: String,
    },
}

impl Transformation {
    fn kind(&self) -> &'static str {
        match self {
            Transformation::Filter { .. } => "filter",
            Transformation::Map { .. } => "map",
            Transformation::Sort { .. } => "sort",
            Transformation::Group { .. } => "group",
            Transformation::Aggregate { .. } => "aggregate",
            Transformation::Merge { .. } => "merge",
            Transformation::Extract { .. } => "extract",
            Transformation::Custom { .. } => "custom",
        }
    }

    /// Static checks that do not need the data.
    fn check(&self) -> std::result::Result<(), String> {
        match self {
            Transformation::Filter {
                condition,
                field,
                operator,
                ..
            } => match (condition, field, operator) {
                (Some(condition), _, _) => parse_condition(condition).map(|_| ()),
                (None, Some(_), Some(op)) => Operator::parse(op)
                    .map(|_| ())
                    .ok_or_else(|| format!("unknown operator '{}'", op)),
                _ => Err("filter needs a condition or a field and operator".to_string()),
            },
            Transformation::Map {
                mapping,
                expression,
            } => {
                if mapping.is_none() && expression.is_none() {
                    Err("map needs a mapping or an expression".to_string())
                } else {
                    Ok(())
                }
            }
            Transformation::Aggregate { fields } => {
                if fields.is_empty() {
                    return Err("aggregate needs at least one field".to_string());
                }
                for (name, spec) in fields {
                    if spec.operation != AggregateOp::Count && spec.field.is_none() {
                        return Err(format!("aggregate '{}' needs a field", name));
                    }
                }
                Ok(())
            }
            Transformation::Extract { path, fields } => {
                if path.is_none() && fields.is_none() {
                    Err("extract needs a path or fields".to_string())
                } else {
                    Ok(())
                }
            }
            Transformation::Custom { function } => match function.as_str() {
                "unique" | "flatten" => Ok(()),
                other => Err(format!(
                    "unknown custom function '{}' (expected unique or flatten)",
                    other
                )),
            },
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Deserialize)]
struct AggregateSpec {
    operation: AggregateOp,
    #[serde(default)]
    field: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum AggregateOp {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// Comparison operators for filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Equals,
    StrictEquals,
    NotEquals,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Contains,
    StartsWith,
    EndsWith,
}

impl Operator {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "equals" | "==" => Some(Operator::Equals),
            "strict_equals" | "===" => Some(Operator::StrictEquals),
            "not_equals" | "!=" | "!==" => Some(Operator::NotEquals),
            "less_than" | "<" => Some(Operator::LessThan),
            "less_than_or_equal" | "<=" => Some(Operator::LessThanOrEqual),
            "greater_than" | ">" => Some(Operator::GreaterThan),
            "greater_than_or_equal" | ">=" => Some(Operator::GreaterThanOrEqual),
            "contains" => Some(Operator::Contains),
            "starts_with" | "startsWith" => Some(Operator::StartsWith),
            "ends_with" | "endsWith" => Some(Operator::EndsWith),
            _ => None,
        }
    }

    fn apply(self, left: &Value, right: &Value) -> bool {
        match self {
            Operator::Equals => loose_eq(left, right),
            Operator::StrictEquals => left == right,
            Operator::NotEquals => !loose_eq(left, right),
            Operator::LessThan => compare(left, right) == Some(Ordering::Less),
            Operator::LessThanOrEqual => {
                matches!(compare(left, right), Some(Ordering::Less | Ordering::Equal))
            }
            Operator::GreaterThan => compare(left, right) == Some(Ordering::Greater),
            Operator::GreaterThanOrEqual => {
                matches!(compare(left, right), Some(Ordering::Greater | Ordering::Equal))
            }
            Operator::Contains => match left {
                Value::String(s) => s.contains(&stringify(right)),
                Value::Array(items) => items.iter().any(|item| loose_eq(item, right)),
                Value::Object(map) => right.as_str().is_some_and(|k| map.contains_key(k)),
                _ => false,
            },
            Operator::StartsWith => left
                .as_str()
                .is_some_and(|s| s.starts_with(&stringify(right))),
            Operator::EndsWith => left
                .as_str()
                .is_some_and(|s| s.ends_with(&stringify(right))),
        }
    }
}

/// A parsed filter predicate.
#[derive(Debug, Clone)]
struct Condition {
    field: String,
    operator: Operator,
    value: Value,
}

fn condition_regex() -> &'static Regex {
    static CONDITION_REGEX: OnceLock<Regex> = OnceLock::new();
    CONDITION_REGEX.get_or_init(|| {
        Regex::new(
            r"^\s*([\w.]+)\s*(===|!==|==|!=|>=|<=|>|<|contains|startsWith|endsWith|starts_with|ends_with)\s*(.+?)\s*$",
        )
        .expect("valid regex")
    })
}

/// Parse `field op value`, e.g. `age >= 18` or `status == 'active'`.
fn parse_condition(text: &str) -> std::result::Result<Condition, String> {
    let caps = condition_regex()
        .captures(text)
        .ok_or_else(|| format!("cannot parse condition '{}'", text))?;
    let operator = Operator::parse(&caps[2])
        .ok_or_else(|| format!("unknown operator '{}'", &caps[2]))?;
    Ok(Condition {
        field: caps[1].to_string(),
        operator,
        value: parse_literal(&caps[3]),
    })
}

fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    for quote in ['\'', '"'] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Value::String(raw[1..raw.len() - 1].to_string());
        }
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Equality with number/string/bool coercion.
fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left, right) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (as_number(left), as_number(right)) {
                (Some(l), Some(r)) => l == r,
                _ => false,
            }
        }
        (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            s == if *b { "true" } else { "false" }
        }
        _ => false,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(l), Value::String(r)) => match (as_number(left), as_number(right)) {
            (Some(l), Some(r)) => l.partial_cmp(&r),
            _ => Some(l.cmp(r)),
        },
        _ => as_number(left)?.partial_cmp(&as_number(right)?),
    }
}

/// Ordering for sort: nulls last, numeric values compared as numbers.
fn sort_key_cmp(left: &Value, right: &Value) -> Ordering {
    match (left.is_null(), right.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l.partial_cmp(&r).unwrap_or(Ordering::Equal);
    }
    match (left, right) {
        (Value::String(l), Value::String(r)) => l.cmp(r),
        (Value::Bool(l), Value::Bool(r)) => l.cmp(r),
        (Value::Number(_), _) => Ordering::Less,
        (_, Value::Number(_)) => Ordering::Greater,
        _ => stringify(left).cmp(&stringify(right)),
    }
}

fn item_field<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix("item.").unwrap_or(path);
    if path.is_empty() || path == "item" {
        return Some(item);
    }
    let segments: Vec<&str> = path.split('.').collect();
    resolve_path(item, &segments)
}

fn item_placeholder_regex() -> &'static Regex {
    static ITEM_REGEX: OnceLock<Regex> = OnceLock::new();
    ITEM_REGEX.get_or_init(|| {
        Regex::new(r"\$\{\s*(item(?:\.[\w.]+)?|index)\s*\}").expect("valid regex")
    })
}

/// Render `${item.x}` / `${index}` templates against one element.
fn render_item(template: &Value, item: &Value, index: usize) -> Value {
    match template {
        Value::String(s) => {
            let lookup = |expr: &str| -> Value {
                if expr == "index" {
                    json!(index)
                } else {
                    item_field(item, expr).cloned().unwrap_or(Value::Null)
                }
            };

            if let Some(caps) = item_placeholder_regex().captures(s) {
                if caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len()) {
                    return lookup(&caps[1]);
                }
            }
            Value::String(
                item_placeholder_regex()
                    .replace_all(s, |caps: &Captures| match lookup(&caps[1]) {
                        Value::Null => String::new(),
                        other => stringify(&other),
                    })
                    .into_owned(),
            )
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|t| render_item(t, item, index))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, t)| (k.clone(), render_item(t, item, index)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn require_array<'a>(value: &'a Value, kind: &str) -> Result<&'a Vec<Value>> {
    value.as_array().ok_or_else(|| {
        Error::Execution(format!("{} requires an array input (got {})", kind, type_name(value)))
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn size_of(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        _ => 1,
    }
}

fn apply_filter(
    data: &Value,
    condition: &Option<String>,
    field: &Option<String>,
    operator: &Option<String>,
    value: &Value,
) -> Result<Value> {
    let items = require_array(data, "filter")?;
    let condition = match (condition, field, operator) {
        (Some(text), _, _) => parse_condition(text).map_err(Error::Execution)?,
        (None, Some(field), Some(op)) => Condition {
            field: field.clone(),
            operator: Operator::parse(op)
                .ok_or_else(|| Error::Execution(format!("unknown operator '{}'", op)))?,
            value: value.clone(),
        },
        _ => {
            return Err(Error::Execution(
                "filter needs a condition or a field and operator".to_string(),
            ))
        }
    };

    Ok(Value::Array(
        items
            .iter()
            .filter(|item| {
                let left = item_field(item, &condition.field).unwrap_or(&Value::Null);
                condition.operator.apply(left, &condition.value)
            })
            .cloned()
            .collect(),
    ))
}

fn apply_map(
    data: &Value,
    mapping: &Option<Map<String, Value>>,
    expression: &Option<Value>,
) -> Result<Value> {
    let items = require_array(data, "map")?;
    let mapped = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            if let Some(mapping) = mapping {
                let mut out = Map::new();
                for (target, source) in mapping {
                    let value = match source {
                        Value::String(path) if !path.contains("${") => {
                            item_field(item, path).cloned().unwrap_or(Value::Null)
                        }
                        other => render_item(other, item, index),
                    };
                    out.insert(target.clone(), value);
                }
                Value::Object(out)
            } else if let Some(expression) = expression {
                render_item(expression, item, index)
            } else {
                item.clone()
            }
        })
        .collect();
    Ok(Value::Array(mapped))
}

fn apply_sort(data: &Value, field: &Option<String>, order: SortOrder) -> Result<Value> {
    let mut items = require_array(data, "sort")?.clone();
    items.sort_by(|a, b| {
        let (left, right) = match field {
            Some(field) => (
                item_field(a, field).unwrap_or(&Value::Null),
                item_field(b, field).unwrap_or(&Value::Null),
            ),
            None => (a, b),
        };
        let ordering = sort_key_cmp(left, right);
        // nulls stay last in both directions
        if order == SortOrder::Desc && !left.is_null() && !right.is_null() {
            ordering.reverse()
        } else {
            ordering
        }
    });
    Ok(Value::Array(items))
}

fn apply_group(data: &Value, field: &str) -> Result<Value> {
    let items = require_array(data, "group")?;
    let mut groups = Map::new();
    for item in items {
        let key = item_field(item, field)
            .map(stringify)
            .unwrap_or_else(|| "undefined".to_string());
        if let Value::Array(bucket) = groups
            .entry(key)
            .or_insert_with(|| Value::Array(Vec::new()))
        {
            bucket.push(item.clone());
        }
    }
    Ok(Value::Object(groups))
}

fn apply_aggregate(data: &Value, fields: &BTreeMap<String, AggregateSpec>) -> Result<Value> {
    let items = require_array(data, "aggregate")?;
    let mut out = Map::new();

    for (name, spec) in fields {
        let values: Vec<f64> = match &spec.field {
            Some(field) => items
                .iter()
                .filter_map(|item| item_field(item, field))
                .filter_map(as_number)
                .collect(),
            None => Vec::new(),
        };

        let result = match spec.operation {
            AggregateOp::Count => match &spec.field {
                Some(field) => json!(items
                    .iter()
                    .filter(|item| item_field(item, field).is_some_and(|v| !v.is_null()))
                    .count()),
                None => json!(items.len()),
            },
            AggregateOp::Sum => json!(values.iter().sum::<f64>()),
            AggregateOp::Avg if values.is_empty() => Value::Null,
            AggregateOp::Avg => json!(values.iter().sum::<f64>() / values.len() as f64),
            AggregateOp::Min => values
                .iter()
                .copied()
                .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))))
                .map_or(Value::Null, |v| json!(v)),
            AggregateOp::Max => values
                .iter()
                .copied()
                .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
                .map_or(Value::Null, |v| json!(v)),
        };
        out.insert(name.clone(), result);
    }

    Ok(Value::Object(out))
}

fn apply_merge(data: &Value, with: &Value, on: &Option<String>) -> Result<Value> {
    match (data, with, on) {
        (Value::Array(left), Value::Array(right), None) => {
            Ok(Value::Array(left.iter().chain(right.iter()).cloned().collect()))
        }
        (Value::Array(left), Value::Array(right), Some(key)) => {
            let mut joined = Vec::new();
            for l in left {
                let Some(lk) = item_field(l, key).filter(|v| !v.is_null()) else {
                    continue;
                };
                for r in right {
                    if item_field(r, key).is_some_and(|rk| loose_eq(lk, rk)) {
                        let mut merged = l.as_object().cloned().unwrap_or_default();
                        if let Some(r) = r.as_object() {
                            merged.extend(r.clone());
                        }
                        joined.push(Value::Object(merged));
                    }
                }
            }
            Ok(Value::Array(joined))
        }
        (Value::Object(left), Value::Object(right), _) => {
            let mut merged = left.clone();
            merged.extend(right.clone());
            Ok(Value::Object(merged))
        }
        _ => Err(Error::Execution(format!(
            "merge requires two arrays or two objects (got {} and {})",
            type_name(data),
            type_name(with)
        ))),
    }
}

fn apply_extract(data: &Value, path: &Option<String>, fields: &Option<Vec<String>>) -> Value {
    if let Some(path) = path {
        let segments: Vec<&str> = path.split('.').collect();
        return resolve_path(data, &segments).cloned().unwrap_or(Value::Null);
    }

    let Some(fields) = fields else {
        return data.clone();
    };
    let pick = |item: &Value| -> Value {
        let mut out = Map::new();
        for field in fields {
            if let Some(value) = item_field(item, field) {
                out.insert(field.clone(), value.clone());
            }
        }
        Value::Object(out)
    };
    match data {
        Value::Array(items) => Value::Array(items.iter().map(pick).collect()),
        other => pick(other),
    }
}

fn apply_custom(data: &Value, function: &str) -> Result<Value> {
    let items = require_array(data, function)?;
    match function {
        "unique" => {
            let mut seen: Vec<&Value> = Vec::new();
            for item in items {
                if !seen.contains(&item) {
                    seen.push(item);
                }
            }
            Ok(Value::Array(seen.into_iter().cloned().collect()))
        }
        "flatten" => Ok(Value::Array(
            items
                .iter()
                .flat_map(|item| match item {
                    Value::Array(inner) => inner.clone(),
                    other => vec![other.clone()],
                })
                .collect(),
        )),
        other => Err(Error::Execution(format!("unknown custom function '{}'", other))),
    }
}

fn apply(stage: &Transformation, data: &Value, ctx: &StepExecutionContext) -> Result<Value> {
    match stage {
        Transformation::Filter {
            condition,
            field,
            operator,
            value,
        } => apply_filter(data, condition, field, operator, &resolve_value(value, ctx)),
        Transformation::Map {
            mapping,
            expression,
        } => apply_map(data, mapping, expression),
        Transformation::Sort { field, order } => apply_sort(data, field, *order),
        Transformation::Group { field } => apply_group(data, field),
        Transformation::Aggregate { fields } => apply_aggregate(data, fields),
        Transformation::Merge { with, on } => apply_merge(data, &resolve_value(with, ctx), on),
        Transformation::Extract { path, fields } => Ok(apply_extract(data, path, fields)),
        Transformation::Custom { function } => apply_custom(data, function),
    }
}

#[async_trait]
impl Step for DataTransformationStep {
    fn base(&self) -> &StepBase {
        &self.base
    }

    fn step_type(&self) -> &str {
        "dataTransformation"
    }

    fn description(&self) -> &str {
        "Run an ordered pipeline of data transformations"
    }

    fn validate_config(&self) -> ConfigValidation {
        let mut result = ConfigValidation::ok();

        if self.base.get("input").is_none() {
            result.error("input is required");
        }

        match self.base.get("transformations") {
            None => result.error("transformations is required"),
            Some(Value::Array(stages)) => {
                if stages.is_empty() {
                    result.warn("transformations is empty; input passes through unchanged");
                }
                for (index, stage) in stages.iter().enumerate() {
                    match serde_json::from_value::<Transformation>(stage.clone()) {
                        Ok(parsed) => {
                            if let Err(e) = parsed.check() {
                                result.error(format!("transformations[{}]: {}", index, e));
                            }
                        }
                        Err(e) => result.error(format!("transformations[{}]: {}", index, e)),
                    }
                }
            }
            Some(_) => result.error("transformations must be an array"),
        }

        if let Some(name) = self.base.get("outputVariable") {
            if !name.as_str().is_some_and(|n| !n.is_empty()) {
                result.error("outputVariable must be a non-empty string");
            }
        }

        result
    }

    async fn execute_step(&self, ctx: &mut StepExecutionContext) -> Result<StepResult> {
        let config: TransformationConfig = self.base.parse_config("dataTransformation")?;

        let input = resolve_value(&config.input, ctx);
        let input_size = size_of(&input);
        let mut data = input;
        let mut stages = Vec::with_capacity(config.transformations.len());

        for (index, stage) in config.transformations.iter().enumerate() {
            let started = Instant::now();
            let stage_input_size = size_of(&data);

            match apply(stage, &data, ctx) {
                Ok(next) => {
                    stages.push(json!({
                        "index": index,
                        "type": stage.kind(),
                        "inputSize": stage_input_size,
                        "outputSize": size_of(&next),
                        "durationMs": started.elapsed().as_millis() as u64,
                    }));
                    data = next;
                }
                Err(e) => {
                    let message = match e {
                        Error::Execution(message) => message,
                        other => other.to_string(),
                    };
                    return Ok(StepResult::failure(format!(
                        "Transformation {} ({}) failed: {}",
                        index,
                        stage.kind(),
                        message
                    ))
                    .with_metadata("failedStage", index)
                    .with_metadata("failedType", stage.kind())
                    .with_metadata("stages", Value::Array(stages)));
                }
            }
        }

        if let Some(name) = &config.output_variable {
            debug!(step_id = %self.base.id, variable = %name, "Storing transformation result");
            ctx.variables.insert(name.clone(), data.clone());
        }

        let mut outputs = Map::new();
        outputs.insert("inputSize".into(), json!(input_size));
        outputs.insert("outputSize".into(), json!(size_of(&data)));
        outputs.insert("result".into(), data);

        Ok(StepResult::success(outputs)
            .with_metadata("transformationCount", stages.len())
            .with_metadata("stages", Value::Array(stages)))
    }
}
