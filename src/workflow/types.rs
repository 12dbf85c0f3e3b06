//! Workflow type definitions.
//!
//! These mirror the YAML document one-to-one. Field names are camelCase on
//! the wire (`nameSpace`, `dependsOn`, `continueOnError`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A complete workflow definition.
///
/// # Example YAML
///
/// ```yaml
/// nameSpace: billing
/// name: invoice-sync
/// version: 1.0.0
/// metadata:
///   timeout: 60000
/// steps:
///   - id: fetch
///     type: apiCall
///     config:
///       url: https://api.example.com/invoices
///   - id: announce
///     type: log
///     dependsOn: fetch
///     config:
///       message: "Fetched ${steps.fetch.status}"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Owning namespace (lowercase-leading by convention)
    pub name_space: String,

    /// Workflow name, unique within its namespace
    pub name: String,

    /// Semantic version `x.y.z`
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Workflow-level execution settings
    #[serde(default)]
    pub metadata: WorkflowMetadata,

    /// Declared inputs, keyed by name
    #[serde(default)]
    pub inputs: BTreeMap<String, ParameterDefinition>,

    /// Declared outputs, keyed by name
    #[serde(default)]
    pub outputs: BTreeMap<String, ParameterDefinition>,

    /// Initial mutable variable bag
    #[serde(default)]
    pub variables: Map<String, Value>,

    /// Steps in declaration (execution) order
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    /// Get a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Fully qualified `nameSpace/name@version` identifier.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}@{}", self.name_space, self.name, self.version)
    }

    /// Get all step types used in this workflow.
    pub fn step_types(&self) -> Vec<StepType> {
        let mut types: Vec<StepType> = self.steps.iter().map(|s| s.step_type).collect();
        types.sort_by_key(|t| t.as_str());
        types.dedup();
        types
    }
}

/// Workflow-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    /// Whole-run timeout in milliseconds (>= 1000)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Retry policy applied by the runner to failed steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    /// Anything else authors attach to metadata
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Retry configuration for failed steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts in milliseconds
    #[serde(default = "default_retry_delay")]
    pub delay: u64,

    #[serde(default)]
    pub backoff: BackoffType,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_retry_delay() -> u64 {
    1000
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    /// Fixed delay between retries
    #[default]
    Fixed,
    /// Linearly increasing delay
    Linear,
    /// Exponentially increasing delay
    Exponential,
}

/// Declared input or output parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDefinition {
    /// Parameter type: string, number, integer, boolean, object, array, any
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub required: bool,

    /// Default value if not provided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Expression producing the value (outputs only), e.g. `${step.fetch.body}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

fn default_param_type() -> String {
    "any".to_string()
}

/// A step in the workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Unique step ID within this workflow
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "type")]
    pub step_type: StepType,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Step timeout in milliseconds (>= 100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Keep running the workflow when this step fails
    #[serde(default)]
    pub continue_on_error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOn>,

    /// Step-type specific configuration
    #[serde(default)]
    pub config: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl WorkflowStep {
    /// Step IDs this step depends on.
    pub fn dependencies(&self) -> Vec<&str> {
        self.depends_on
            .as_ref()
            .map(DependsOn::ids)
            .unwrap_or_default()
    }
}

/// `dependsOn` accepts a single ID or a list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum DependsOn {
    One(String),
    Many(Vec<String>),
}

impl DependsOn {
    pub fn ids(&self) -> Vec<&str> {
        match self {
            DependsOn::One(id) => vec![id.as_str()],
            DependsOn::Many(ids) => ids.iter().map(String::as_str).collect(),
        }
    }
}

/// The closed set of step kinds a definition may declare.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum StepType {
    Log,
    Delay,
    Validation,
    DataTransformation,
    ApiCall,
    CliCommand,
    FileOperation,
    Conditional,
    Parallel,
    ForEach,
    While,
}

impl StepType {
    pub const ALL: [StepType; 11] = [
        StepType::Log,
        StepType::Delay,
        StepType::Validation,
        StepType::DataTransformation,
        StepType::ApiCall,
        StepType::CliCommand,
        StepType::FileOperation,
        StepType::Conditional,
        StepType::Parallel,
        StepType::ForEach,
        StepType::While,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Log => "log",
            StepType::Delay => "delay",
            StepType::Validation => "validation",
            StepType::DataTransformation => "dataTransformation",
            StepType::ApiCall => "apiCall",
            StepType::CliCommand => "cliCommand",
            StepType::FileOperation => "fileOperation",
            StepType::Conditional => "conditional",
            StepType::Parallel => "parallel",
            StepType::ForEach => "forEach",
            StepType::While => "while",
        }
    }

    /// Parse a wire name.
    pub fn parse(name: &str) -> Option<StepType> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }

    /// Control-flow types that are declared but have no executing implementation.
    pub fn is_reserved(&self) -> bool {
        matches!(
            self,
            StepType::Conditional | StepType::Parallel | StepType::ForEach | StepType::While
        )
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_type_wire_names_round_trip() {
        for t in StepType::ALL {
            let encoded = serde_json::to_value(t).unwrap();
            assert_eq!(encoded, json!(t.as_str()));
            assert_eq!(StepType::parse(t.as_str()), Some(t));
        }
        assert_eq!(StepType::parse("shell"), None);
    }

    #[test]
    fn test_reserved_types() {
        assert!(StepType::ForEach.is_reserved());
        assert!(StepType::While.is_reserved());
        assert!(!StepType::ApiCall.is_reserved());
    }

    #[test]
    fn test_depends_on_single_or_list() {
        let step: WorkflowStep = serde_json::from_value(json!({
            "id": "b", "type": "log", "dependsOn": "a", "config": {"message": "hi"}
        }))
        .unwrap();
        assert_eq!(step.dependencies(), vec!["a"]);
        assert!(step.enabled);

        let step: WorkflowStep = serde_json::from_value(json!({
            "id": "c", "type": "log", "dependsOn": ["a", "b"], "enabled": false
        }))
        .unwrap();
        assert_eq!(step.dependencies(), vec!["a", "b"]);
        assert!(!step.enabled);
    }

    #[test]
    fn test_metadata_keeps_extra_fields() {
        let meta: WorkflowMetadata = serde_json::from_value(json!({
            "timeout": 5000,
            "owner": "ops",
            "retryPolicy": {"maxAttempts": 3, "backoff": "exponential"}
        }))
        .unwrap();
        assert_eq!(meta.timeout, Some(5000));
        assert_eq!(meta.extra["owner"], "ops");
        let policy = meta.retry_policy.unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, 1000);
        assert_eq!(policy.backoff, BackoffType::Exponential);
    }
}
