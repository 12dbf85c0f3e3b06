//! Step runtime: the `Step` trait, the registry, and the core step types.
//!
//! Every step is built from a `StepBase` (id plus raw config) and driven
//! through `Step::execute`, which handles enable/disable, timing and error
//! capture uniformly.

mod api_call;
mod cli_command;
mod data_transformation;
mod delay;
mod file_operation;
mod log;
mod registry;
pub mod template;
mod types;
mod validation;

pub use api_call::ApiCallStep;
pub use cli_command::{shell_escape, CliCommandStep, TRUNCATION_MARKER};
pub use data_transformation::DataTransformationStep;
pub use delay::{parse_duration_text, DelayStep};
pub use file_operation::{glob_to_regex, FileOperationStep};
pub use log::LogStep;
pub use registry::{RegisterOptions, RegistryStats, StepConstructor, StepMetadata, StepRegistry};
pub use types::{
    ConfigValidation, LogLevel, Step, StepBase, StepExecutionContext, StepLogger, StepResult,
    TracingLogger,
};
pub use validation::ValidationStep;

#[cfg(test)]
pub(crate) use types::test_support;
