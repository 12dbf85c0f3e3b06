//! Step trait, execution context, and result types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::substitution::{SubstitutionContext, WorkflowIdentity};

/// Result of step execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub success: bool,

    /// True when the step was disabled and did not run
    #[serde(default)]
    pub skipped: bool,

    /// Named outputs other steps can reference
    #[serde(default)]
    pub outputs: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Timing, sizes and other diagnostics
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StepResult {
    /// Successful result with outputs.
    pub fn success(outputs: Map<String, Value>) -> Self {
        Self {
            success: true,
            outputs,
            ..Default::default()
        }
    }

    /// Failed result with an error message and no outputs.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Successful no-op for a disabled step.
    pub fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            ..Default::default()
        }
    }

    /// Attach outputs (used by failures that still report partial data).
    pub fn with_outputs(mut self, outputs: Map<String, Value>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Merge a JSON object into metadata.
    pub fn with_metadata_map(mut self, metadata: Value) -> Self {
        if let Value::Object(map) = metadata {
            self.metadata.extend(map);
        }
        self
    }

    /// Get an output value.
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }
}

/// Outcome of a step's configuration check.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ConfigValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigValidation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            ..Default::default()
        }
    }

    /// Record a blocking problem.
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.valid = false;
    }

    /// Record an advisory problem.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn is_valid(&self) -> bool {
        self.valid && self.errors.is_empty()
    }
}

/// Log severity used by the step logger.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(level: &str) -> Option<Self> {
        match level {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logger handed to steps by the host.
pub trait StepLogger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, data: Option<&Value>);

    fn debug(&self, message: &str, data: Option<&Value>) {
        self.log(LogLevel::Debug, message, data);
    }

    fn info(&self, message: &str, data: Option<&Value>) {
        self.log(LogLevel::Info, message, data);
    }

    fn warn(&self, message: &str, data: Option<&Value>) {
        self.log(LogLevel::Warn, message, data);
    }

    fn error(&self, message: &str, data: Option<&Value>) {
        self.log(LogLevel::Error, message, data);
    }
}

/// Default logger that forwards to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingLogger {
    workflow: String,
    instance_id: String,
}

impl TracingLogger {
    pub fn new(workflow: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl StepLogger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str, data: Option<&Value>) {
        let data = data.map(Value::to_string).unwrap_or_default();
        match level {
            LogLevel::Debug => debug!(
                workflow = %self.workflow,
                instance_id = %self.instance_id,
                data = %data,
                "{}",
                message
            ),
            LogLevel::Info => info!(
                workflow = %self.workflow,
                instance_id = %self.instance_id,
                data = %data,
                "{}",
                message
            ),
            LogLevel::Warn => warn!(
                workflow = %self.workflow,
                instance_id = %self.instance_id,
                data = %data,
                "{}",
                message
            ),
            LogLevel::Error => error!(
                workflow = %self.workflow,
                instance_id = %self.instance_id,
                data = %data,
                "{}",
                message
            ),
        }
    }
}

/// Context passed to a step during execution.
pub struct StepExecutionContext {
    /// Identity of the running workflow
    pub workflow: WorkflowIdentity,

    /// Resolved workflow inputs
    pub inputs: Map<String, Value>,

    /// Workflow variables; steps may write here
    pub variables: Map<String, Value>,

    /// Environment snapshot taken when the run started
    pub env: HashMap<String, String>,

    /// Results of steps that already ran (keyed by step ID)
    pub step_results: HashMap<String, StepResult>,

    pub logger: Arc<dyn StepLogger>,
}

impl StepExecutionContext {
    /// Create a new context with a tracing logger and empty state.
    pub fn new(workflow: WorkflowIdentity) -> Self {
        let logger = Arc::new(TracingLogger::new(
            workflow.name.clone(),
            workflow.instance_id.clone(),
        ));
        Self {
            workflow,
            inputs: Map::new(),
            variables: Map::new(),
            env: HashMap::new(),
            step_results: HashMap::new(),
            logger,
        }
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Snapshot the host process environment.
    pub fn with_process_env(mut self) -> Self {
        self.env = std::env::vars().collect();
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn StepLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Record a finished step's result.
    pub fn add_step_result(&mut self, step_id: &str, result: StepResult) {
        self.step_results.insert(step_id.to_string(), result);
    }

    /// Get a previous step's result.
    pub fn get_step_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(step_id)
    }

    /// Build a substitution scope from this context.
    ///
    /// `current` names the executing step and its live outputs, if any.
    pub fn substitution_context(
        &self,
        current: Option<(&str, &str, Map<String, Value>)>,
    ) -> SubstitutionContext {
        let mut scope = SubstitutionContext::new()
            .with_env(&self.env)
            .with_workflow(self.workflow.clone())
            .with_input(self.inputs.clone())
            .with_variables(self.variables.clone());

        if let Some((id, step_type, outputs)) = current {
            scope = scope.with_current_step(id, step_type, outputs);
        }

        for (id, result) in &self.step_results {
            scope.insert_step_result(
                id.clone(),
                serde_json::to_value(result).unwrap_or_else(|_| json!({ "outputs": {} })),
            );
        }
        scope
    }
}

/// Identity and configuration every step is constructed from.
#[derive(Debug, Clone)]
pub struct StepBase {
    pub id: String,
    /// The step's `config` object
    pub config: Value,
    /// Engine defaults (timeouts, size caps)
    pub settings: Arc<EngineConfig>,
}

impl StepBase {
    pub fn new(id: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            config,
            settings: Arc::new(EngineConfig::default()),
        }
    }

    pub fn with_settings(mut self, settings: Arc<EngineConfig>) -> Self {
        self.settings = settings;
        self
    }

    /// Deserialize the config into a typed struct.
    pub fn parse_config<T: DeserializeOwned>(&self, step_type: &str) -> Result<T> {
        serde_json::from_value(self.config.clone())
            .map_err(|e| Error::StepConfig(format!("Invalid {} config: {}", step_type, e)))
    }

    /// Read a config field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }
}

/// Trait that all step types implement.
///
/// Implementors provide [`Step::execute_step`]; hosts call [`Step::execute`],
/// which adds the skip, timing and error-capture behavior shared by every
/// step type.
#[async_trait]
pub trait Step: Send + Sync {
    fn base(&self) -> &StepBase;

    /// The registered type name (e.g., "log", "apiCall").
    fn step_type(&self) -> &str;

    fn description(&self) -> &str {
        "A workflow step"
    }

    fn id(&self) -> &str {
        &self.base().id
    }

    fn config(&self) -> &Value {
        &self.base().config
    }

    /// Steps are enabled unless `config.enabled` is explicitly `false`.
    fn enabled(&self) -> bool {
        self.config().get("enabled").and_then(Value::as_bool) != Some(false)
    }

    /// Check the step's configuration. Accepts anything by default.
    fn validate_config(&self) -> ConfigValidation {
        ConfigValidation::ok()
    }

    /// Type-specific work.
    async fn execute_step(&self, ctx: &mut StepExecutionContext) -> Result<StepResult>;

    /// Run the step. Never returns an error: failures become
    /// `success: false` results.
    async fn execute(&self, ctx: &mut StepExecutionContext) -> StepResult {
        if !self.enabled() {
            debug!(step_id = %self.id(), step_type = %self.step_type(), "Step disabled, skipping");
            return StepResult::skipped()
                .with_metadata("stepId", self.id())
                .with_metadata("stepType", self.step_type())
                .with_metadata("skipped", true)
                .with_metadata("reason", "Step is disabled");
        }

        let started_at = Utc::now();
        let start = Instant::now();
        debug!(step_id = %self.id(), step_type = %self.step_type(), "Executing step");

        let result = match self.execute_step(ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    step_id = %self.id(),
                    step_type = %self.step_type(),
                    code = e.code(),
                    "Step failed: {}",
                    e
                );
                StepResult::failure(e.to_string())
                    .with_metadata("failed", true)
                    .with_metadata("errorCode", e.code())
            }
        };

        result
            .with_metadata("stepId", self.id())
            .with_metadata("stepType", self.step_type())
            .with_metadata("startedAt", started_at.to_rfc3339())
            .with_metadata("executionTime", start.elapsed().as_millis() as u64)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;

    /// Logger that records every call.
    #[derive(Default)]
    pub struct MemoryLogger {
        pub entries: Mutex<Vec<(LogLevel, String, Option<Value>)>>,
    }

    impl MemoryLogger {
        pub fn messages(&self) -> Vec<(LogLevel, String, Option<Value>)> {
            self.entries.lock().unwrap().clone()
        }
    }

    impl StepLogger for MemoryLogger {
        fn log(&self, level: LogLevel, message: &str, data: Option<&Value>) {
            self.entries
                .lock()
                .unwrap()
                .push((level, message.to_string(), data.cloned()));
        }
    }

    pub fn identity() -> WorkflowIdentity {
        WorkflowIdentity {
            id: "tests.unit".to_string(),
            instance_id: "instance-1".to_string(),
            name_space: "tests".to_string(),
            name: "unit".to_string(),
            version: "1.0.0".to_string(),
        }
    }

    pub fn context() -> StepExecutionContext {
        StepExecutionContext::new(identity())
    }

    pub fn base(id: &str, config: Value) -> StepBase {
        StepBase::new(id, config)
    }
}
