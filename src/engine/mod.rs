//! Execution engine for workflows.

mod runner;

pub use runner::{StepRun, WorkflowRunResult, WorkflowRunner};
