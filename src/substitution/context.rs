//! Layered resolution scope for `${source.path}` expressions.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Map, Value};

/// Identity of the workflow run being substituted against.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowIdentity {
    pub id: String,
    pub instance_id: String,
    pub name_space: String,
    pub name: String,
    pub version: String,
}

/// The step currently executing, addressable as `step.*`.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CurrentStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    pub outputs: Map<String, Value>,
}

/// Runtime resolution scope.
///
/// Rebuilt before each step; `variables` and `step_results` carry
/// accumulated run state forward.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubstitutionContext {
    pub env: Map<String, Value>,
    pub workflow: Option<WorkflowIdentity>,
    pub input: Map<String, Value>,
    pub variables: Map<String, Value>,
    pub step: Option<CurrentStep>,
    pub outputs: Map<String, Value>,
    /// Prior step results keyed by step ID; each entry has an `outputs` object.
    pub step_results: Map<String, Value>,
}

impl SubstitutionContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the host process environment.
    pub fn with_process_env(mut self) -> Self {
        self.env = std::env::vars()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        self
    }

    /// Use an explicit environment snapshot.
    pub fn with_env(mut self, env: &HashMap<String, String>) -> Self {
        self.env = env
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        self
    }

    pub fn with_workflow(mut self, identity: WorkflowIdentity) -> Self {
        self.workflow = Some(identity);
        self
    }

    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input = input;
        self
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_outputs(mut self, outputs: Map<String, Value>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Set the currently executing step.
    pub fn with_current_step(
        mut self,
        id: impl Into<String>,
        step_type: impl Into<String>,
        outputs: Map<String, Value>,
    ) -> Self {
        self.step = Some(CurrentStep {
            id: id.into(),
            step_type: step_type.into(),
            outputs,
        });
        self
    }

    /// Record a prior step's outputs.
    pub fn with_step_result(mut self, step_id: impl Into<String>, outputs: Value) -> Self {
        self.step_results
            .insert(step_id.into(), json!({ "outputs": outputs }));
        self
    }

    /// Record a prior step's full result document (must contain `outputs`).
    pub fn insert_step_result(&mut self, step_id: impl Into<String>, result: Value) {
        self.step_results.insert(step_id.into(), result);
    }

    /// The `workflow` layer as a JSON object.
    pub(crate) fn workflow_value(&self) -> Value {
        self.workflow
            .as_ref()
            .and_then(|w| serde_json::to_value(w).ok())
            .unwrap_or(Value::Null)
    }

    /// The `step` layer as a JSON object.
    pub(crate) fn step_value(&self) -> Value {
        self.step
            .as_ref()
            .and_then(|s| serde_json::to_value(s).ok())
            .unwrap_or(Value::Null)
    }
}
