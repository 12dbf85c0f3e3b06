//! Sequential workflow runner.
//!
//! Steps run one at a time in declaration order. Each step sees the
//! `variables` and step results accumulated by the steps before it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::steps::{StepExecutionContext, StepLogger, StepRegistry, StepResult, TracingLogger};
use crate::substitution::{
    evaluate_expression, substitute_string, SubstitutionContext, WorkflowIdentity,
};
use crate::workflow::{
    resolve_inputs, BackoffType, RetryPolicy, WorkflowDefinition, WorkflowStep,
};

/// One executed step, in run order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRun {
    pub step_id: String,
    pub attempts: u32,
    #[serde(flatten)]
    pub result: StepResult,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunResult {
    pub success: bool,
    pub instance_id: String,
    pub step_results: Vec<StepRun>,
    pub variables: Map<String, Value>,
    pub outputs: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl WorkflowRunResult {
    /// Result of a step by id, if it ran.
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results
            .iter()
            .find(|run| run.step_id == step_id)
            .map(|run| &run.result)
    }
}

/// Runs workflow definitions against a step registry.
pub struct WorkflowRunner {
    registry: Arc<StepRegistry>,
    logger: Option<Arc<dyn StepLogger>>,
    env: Option<HashMap<String, String>>,
}

impl WorkflowRunner {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self {
            registry,
            logger: None,
            env: None,
        }
    }

    /// Route step log output somewhere other than `tracing`.
    pub fn with_logger(mut self, logger: Arc<dyn StepLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Use a fixed environment instead of snapshotting the process.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Execute a workflow.
    ///
    /// Returns `Err` only when the inputs are rejected; step failures are
    /// reported in the result.
    pub async fn run(
        &self,
        workflow: &WorkflowDefinition,
        input: Value,
    ) -> Result<WorkflowRunResult> {
        let inputs = resolve_inputs(workflow, &input)?;
        let instance_id = Uuid::new_v4().to_string();
        let start = Instant::now();
        let deadline = workflow
            .metadata
            .timeout
            .map(|ms| (start + Duration::from_millis(ms), ms));

        let identity = WorkflowIdentity {
            id: format!("{}/{}", workflow.name_space, workflow.name),
            instance_id: instance_id.clone(),
            name_space: workflow.name_space.clone(),
            name: workflow.name.clone(),
            version: workflow.version.clone(),
        };
        let logger = self.logger.clone().unwrap_or_else(|| {
            Arc::new(TracingLogger::new(workflow.name.clone(), instance_id.clone()))
        });
        let env = self
            .env
            .clone()
            .unwrap_or_else(|| std::env::vars().collect());

        let mut ctx = StepExecutionContext::new(identity)
            .with_inputs(inputs)
            .with_variables(workflow.variables.clone())
            .with_env(env)
            .with_logger(logger);

        info!(
            workflow = %workflow.qualified_name(),
            instance_id = %instance_id,
            steps = workflow.steps.len(),
            "Starting workflow run"
        );

        let mut runs = Vec::with_capacity(workflow.steps.len());
        let mut error = None;

        for step in &workflow.steps {
            let remaining = match deadline {
                Some((at, ms)) => match remaining_until(at) {
                    Some(left) => Some((left, ms)),
                    None => {
                        let timeout = Error::Timeout(format!("Workflow timed out after {}ms", ms));
                        error = Some(timeout.to_string());
                        break;
                    }
                },
                None => None,
            };

            let (result, attempts) = self
                .run_step(step, &mut ctx, workflow.metadata.retry_policy.as_ref(), remaining)
                .await;

            ctx.add_step_result(&step.id, result.clone());
            let failed = !result.success;
            let message = result.error.clone();
            runs.push(StepRun {
                step_id: step.id.clone(),
                attempts,
                result,
            });

            if failed {
                let message = message.unwrap_or_else(|| "unknown error".to_string());
                if step.continue_on_error {
                    warn!(step_id = %step.id, "Step failed, continuing: {}", message);
                } else {
                    error = Some(format!("Step '{}' failed: {}", step.id, message));
                    break;
                }
            }
        }

        let outputs = resolve_outputs(workflow, &ctx.substitution_context(None));
        let duration_ms = start.elapsed().as_millis() as u64;
        let success = error.is_none();

        if success {
            info!(instance_id = %instance_id, duration_ms, "Workflow run completed");
        } else {
            warn!(instance_id = %instance_id, duration_ms, "Workflow run failed");
        }

        Ok(WorkflowRunResult {
            success,
            instance_id,
            step_results: runs,
            variables: ctx.variables,
            outputs,
            error,
            duration_ms,
        })
    }

    /// Build and execute one step, retrying failures per policy.
    async fn run_step(
        &self,
        step: &WorkflowStep,
        ctx: &mut StepExecutionContext,
        policy: Option<&RetryPolicy>,
        workflow_remaining: Option<(Duration, u64)>,
    ) -> (StepResult, u32) {
        let instance = match self.registry.create_step(step) {
            Ok(instance) => instance,
            Err(e) => {
                warn!(step_id = %step.id, code = e.code(), "Step could not be created: {}", e);
                let result = StepResult::failure(e.to_string())
                    .with_metadata("stepId", step.id.as_str())
                    .with_metadata("stepType", step.step_type.as_str())
                    .with_metadata("failed", true)
                    .with_metadata("errorCode", e.code());
                return (result, 0);
            }
        };

        info!("Executing step '{}' [{}]", step.id, step.step_type);

        let max_attempts = policy.map(|p| p.max_attempts).unwrap_or(1).max(1);
        let step_deadline = workflow_remaining.map(|(left, ms)| (Instant::now() + left, ms));
        let mut attempt = 0;

        loop {
            attempt += 1;

            let workflow_left = match step_deadline {
                Some((at, ms)) => match remaining_until(at) {
                    Some(left) => Some((left, ms)),
                    None => return (workflow_timeout(step, ms), attempt - 1),
                },
                None => None,
            };
            let step_limit = step.timeout.map(Duration::from_millis);
            let limit = match (step_limit, workflow_left) {
                (Some(s), Some((w, _))) => Some(s.min(w)),
                (Some(s), None) => Some(s),
                (None, Some((w, _))) => Some(w),
                (None, None) => None,
            };

            let result = match limit {
                Some(limit) => match tokio::time::timeout(limit, instance.execute(ctx)).await {
                    Ok(result) => result,
                    Err(_) => match (step_limit, workflow_left) {
                        (Some(s), _) if s <= limit => step_timeout(step, s),
                        (_, Some((_, ms))) => workflow_timeout(step, ms),
                        _ => step_timeout(step, limit),
                    },
                },
                None => instance.execute(ctx).await,
            };

            if result.success || attempt >= max_attempts {
                let result = if attempt > 1 {
                    result.with_metadata("attempts", attempt)
                } else {
                    result
                };
                return (result, attempt);
            }

            let delay = policy.map(|p| retry_delay(p, attempt)).unwrap_or_default();
            warn!(
                step_id = %step.id,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Step failed, retrying: {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
            if let Some((at, _)) = step_deadline {
                if remaining_until(at).map_or(true, |left| left <= delay) {
                    return (result.with_metadata("attempts", attempt), attempt);
                }
            }
            tokio::time::sleep(delay).await;
        }
    }
}

fn timed_out(step: &WorkflowStep, message: String) -> StepResult {
    StepResult::failure(message)
        .with_metadata("stepId", step.id.as_str())
        .with_metadata("stepType", step.step_type.as_str())
        .with_metadata("failed", true)
        .with_metadata("timedOut", true)
        .with_metadata("errorCode", "TIMEOUT")
}

fn step_timeout(step: &WorkflowStep, limit: Duration) -> StepResult {
    timed_out(
        step,
        Error::Timeout(format!(
            "Step '{}' exceeded its {}ms timeout",
            step.id,
            limit.as_millis()
        ))
        .to_string(),
    )
}

fn workflow_timeout(step: &WorkflowStep, workflow_ms: u64) -> StepResult {
    timed_out(
        step,
        Error::Timeout(format!(
            "Workflow timeout of {}ms reached while running step '{}'",
            workflow_ms, step.id
        ))
        .to_string(),
    )
}

fn remaining_until(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    if now >= deadline {
        None
    } else {
        Some(deadline.saturating_duration_since(now))
    }
}

fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.delay;
    let ms = match policy.backoff {
        BackoffType::Fixed => base,
        BackoffType::Linear => base.saturating_mul(attempt as u64),
        BackoffType::Exponential => {
            let shift = attempt.saturating_sub(1).min(20);
            base.saturating_mul(1u64 << shift)
        }
    };
    Duration::from_millis(ms)
}

/// Resolve declared outputs leniently. A value that is exactly one
/// expression keeps its JSON type.
fn resolve_outputs(
    workflow: &WorkflowDefinition,
    scope: &SubstitutionContext,
) -> Map<String, Value> {
    let mut outputs = Map::new();
    for (name, def) in &workflow.outputs {
        let value = match &def.value {
            Some(expr) => {
                let whole = expr
                    .trim()
                    .strip_prefix("${")
                    .and_then(|rest| rest.strip_suffix('}'))
                    .filter(|inner| !inner.contains("${"));
                match whole.map(|inner| evaluate_expression(inner, scope)) {
                    Some(Ok(value)) => value,
                    _ => {
                        let substituted = substitute_string(expr, scope, false);
                        for e in &substituted.errors {
                            warn!(output = %name, code = e.code.as_str(), "{}", e.message);
                        }
                        Value::String(substituted.result)
                    }
                }
            }
            None => match &def.default {
                Some(default) => default.clone(),
                None => continue,
            },
        };
        outputs.insert(name.clone(), value);
    }
    outputs
}
