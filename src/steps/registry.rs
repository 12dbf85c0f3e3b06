//! Step registry - maps type names to step constructors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::types::{ConfigValidation, Step, StepBase};
use super::{
    ApiCallStep, CliCommandStep, DataTransformationStep, DelayStep, FileOperationStep, LogStep,
    ValidationStep,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::workflow::WorkflowStep;

/// Builds a step instance from its identity and config.
pub type StepConstructor = Arc<dyn Fn(StepBase) -> Box<dyn Step> + Send + Sync>;

fn constructor<S: Step + 'static>(build: fn(StepBase) -> S) -> StepConstructor {
    Arc::new(move |base| -> Box<dyn Step> { Box::new(build(base)) })
}

/// A registered step type.
#[derive(Clone)]
pub struct StepMetadata {
    pub step_type: String,
    pub constructor: StepConstructor,
    pub description: String,
    pub version: String,
    pub registered_at: DateTime<Utc>,
}

impl fmt::Debug for StepMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepMetadata")
            .field("step_type", &self.step_type)
            .field("description", &self.description)
            .field("version", &self.version)
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

/// Options for [`StepRegistry::register_step`].
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub description: Option<String>,
    pub version: Option<String>,
    /// Replace an existing registration instead of failing
    pub force: bool,
}

/// Snapshot of registry contents.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_steps: usize,
    pub step_types: Vec<String>,
}

/// Registry of available step types.
///
/// Not a process-wide singleton: hosts own their registry and pass it
/// where it is needed.
#[derive(Clone)]
pub struct StepRegistry {
    steps: HashMap<String, StepMetadata>,
    settings: Arc<EngineConfig>,
}

impl StepRegistry {
    /// Create a registry with the built-in steps and default settings.
    pub fn new() -> Self {
        Self::with_config(Arc::new(EngineConfig::default()))
    }

    /// Create a registry with the built-in steps and explicit settings.
    pub fn with_config(settings: Arc<EngineConfig>) -> Self {
        let mut registry = Self {
            steps: HashMap::new(),
            settings,
        };
        registry.register_builtins();
        registry
    }

    /// Create an empty registry (for testing).
    pub fn empty() -> Self {
        Self {
            steps: HashMap::new(),
            settings: Arc::new(EngineConfig::default()),
        }
    }

    fn register_builtins(&mut self) {
        let builtins: [(&str, &str, StepConstructor); 7] = [
            ("log", "Emit a structured log entry", constructor(LogStep::new)),
            ("delay", "Pause the workflow", constructor(DelayStep::new)),
            (
                "validation",
                "Validate data against a schema or rules",
                constructor(ValidationStep::new),
            ),
            (
                "dataTransformation",
                "Run a pipeline of data transformations",
                constructor(DataTransformationStep::new),
            ),
            ("apiCall", "Make an HTTP request", constructor(ApiCallStep::new)),
            (
                "cliCommand",
                "Run a command in a child process",
                constructor(CliCommandStep::new),
            ),
            (
                "fileOperation",
                "Perform a filesystem operation",
                constructor(FileOperationStep::new),
            ),
        ];

        for (step_type, description, constructor) in builtins {
            self.steps.insert(
                step_type.to_string(),
                StepMetadata {
                    step_type: step_type.to_string(),
                    constructor,
                    description: description.to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    registered_at: Utc::now(),
                },
            );
        }
    }

    /// Engine settings handed to every constructed step.
    pub fn settings(&self) -> &Arc<EngineConfig> {
        &self.settings
    }

    /// Register a step type.
    ///
    /// Fails if the type is already registered unless `options.force` is set.
    pub fn register_step<F>(
        &mut self,
        step_type: &str,
        constructor: F,
        options: RegisterOptions,
    ) -> Result<()>
    where
        F: Fn(StepBase) -> Box<dyn Step> + Send + Sync + 'static,
    {
        if step_type.trim().is_empty() {
            return Err(Error::Registry("Step type name cannot be empty".to_string()));
        }
        if self.steps.contains_key(step_type) && !options.force {
            return Err(Error::Registry(format!(
                "Step type '{}' is already registered (use force to replace it)",
                step_type
            )));
        }

        debug!(step_type = %step_type, force = options.force, "Registering step type");
        self.steps.insert(
            step_type.to_string(),
            StepMetadata {
                step_type: step_type.to_string(),
                constructor: Arc::new(constructor),
                description: options
                    .description
                    .unwrap_or_else(|| format!("{} step", step_type)),
                version: options.version.unwrap_or_else(|| "1.0.0".to_string()),
                registered_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Check if a step type is registered.
    pub fn has_step(&self, step_type: &str) -> bool {
        self.steps.contains_key(step_type)
    }

    /// Get a registration by type name.
    pub fn get_step(&self, step_type: &str) -> Option<&StepMetadata> {
        self.steps.get(step_type)
    }

    /// All registered type names, sorted.
    pub fn get_registered_steps(&self) -> Vec<String> {
        let mut names: Vec<String> = self.steps.keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove a registration. Returns whether one existed.
    pub fn unregister_step(&mut self, step_type: &str) -> bool {
        self.steps.remove(step_type).is_some()
    }

    /// Remove every registration, built-ins included.
    pub fn clear(&mut self) {
        self.steps.clear();
    }

    pub fn get_stats(&self) -> RegistryStats {
        RegistryStats {
            total_steps: self.steps.len(),
            step_types: self.get_registered_steps(),
        }
    }

    fn instantiate(&self, step_type: &str, id: &str, config: Value) -> Result<Box<dyn Step>> {
        let metadata = self.steps.get(step_type).ok_or_else(|| {
            Error::Registry(format!(
                "Unknown step type: {} (registered: {})",
                step_type,
                self.get_registered_steps().join(", ")
            ))
        })?;

        let base = StepBase::new(id, config).with_settings(self.settings.clone());
        Ok((metadata.constructor)(base))
    }

    /// Run a step type's config check without keeping the instance.
    ///
    /// Returns `None` when the type is not registered.
    pub fn validate_step_config(
        &self,
        step_type: &str,
        id: &str,
        config: Value,
    ) -> Option<ConfigValidation> {
        self.instantiate(step_type, id, config)
            .ok()
            .map(|step| step.validate_config())
    }

    /// Construct and validate a step.
    ///
    /// Invalid configuration fails here rather than at execution time.
    pub fn create(&self, step_type: &str, id: &str, config: Value) -> Result<Box<dyn Step>> {
        let step = self.instantiate(step_type, id, config)?;

        let validation = step.validate_config();
        for warning in &validation.warnings {
            warn!(step_id = %id, step_type = %step_type, "{}", warning);
        }
        if !validation.is_valid() {
            return Err(Error::StepConfig(format!(
                "Step '{}' ({}): {}",
                id,
                step_type,
                validation.errors.join("; ")
            )));
        }
        Ok(step)
    }

    /// Construct a step from its workflow declaration.
    pub fn create_step(&self, step: &WorkflowStep) -> Result<Box<dyn Step>> {
        let mut config = step.config.clone();
        if !step.enabled {
            config.insert("enabled".to_string(), Value::Bool(false));
        }
        self.create(step.step_type.as_str(), &step.id, Value::Object(config))
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::types::{StepExecutionContext, StepResult};
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoStep {
        base: StepBase,
    }

    #[async_trait]
    impl Step for EchoStep {
        fn base(&self) -> &StepBase {
            &self.base
        }

        fn step_type(&self) -> &str {
            "echo"
        }

        async fn execute_step(&self, _ctx: &mut StepExecutionContext) -> Result<StepResult> {
            Ok(StepResult::success(serde_json::Map::new()))
        }
    }

    #[test]
    fn test_registry_default_steps() {
        let registry = StepRegistry::new();
        assert_eq!(
            registry.get_registered_steps(),
            vec![
                "apiCall",
                "cliCommand",
                "dataTransformation",
                "delay",
                "fileOperation",
                "log",
                "validation"
            ]
        );
        assert!(!registry.has_step("forEach"));
        assert_eq!(registry.get_stats().total_steps, 7);
    }

    #[test]
    fn test_duplicate_registration_requires_force() {
        let mut registry = StepRegistry::empty();
        registry
            .register_step("echo", |b| Box::new(EchoStep { base: b }), RegisterOptions::default())
            .unwrap();

        let err = registry
            .register_step("echo", |b| Box::new(EchoStep { base: b }), RegisterOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), "REGISTRY_ERROR");

        registry
            .register_step(
                "echo",
                |b| Box::new(EchoStep { base: b }),
                RegisterOptions {
                    version: Some("2.0.0".into()),
                    force: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(registry.get_step("echo").unwrap().version, "2.0.0");
    }

    #[test]
    fn test_unregister_and_clear() {
        let mut registry = StepRegistry::new();
        assert!(registry.unregister_step("delay"));
        assert!(!registry.unregister_step("delay"));
        assert!(!registry.has_step("delay"));

        registry.clear();
        assert!(registry.get_registered_steps().is_empty());
    }

    #[test]
    fn test_create_unknown_type_fails() {
        let registry = StepRegistry::new();
        let err = registry.create("forEach", "loop", json!({})).err().unwrap();
        assert_eq!(err.code(), "REGISTRY_ERROR");
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let registry = StepRegistry::new();
        let err = registry.create("log", "greet", json!({})).err().unwrap();
        assert_eq!(err.code(), "STEP_CONFIG_ERROR");
        assert!(err.to_string().contains("greet"));
    }

    #[test]
    fn test_create_step_carries_enabled_flag() {
        let registry = StepRegistry::new();
        let declared: WorkflowStep = serde_json::from_value(json!({
            "id": "quiet",
            "type": "log",
            "enabled": false,
            "config": {"message": "never shown"}
        }))
        .unwrap();
        let step = registry.create_step(&declared).unwrap();
        assert_eq!(step.id(), "quiet");
        assert_eq!(step.step_type(), "log");
        assert!(!step.enabled());
    }
}
