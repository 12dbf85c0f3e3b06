//! Workflow definition, parsing, and validation.
//!
//! Workflows are YAML documents made of:
//! - Identity: `nameSpace`, `name`, `version`
//! - Contracts: declared `inputs` and `outputs`, initial `variables`
//! - Steps: the ordered units of work, each with a `type` and `config`

mod inputs;
mod parser;
mod report;
mod types;
mod validator;

pub use inputs::resolve_inputs;
pub use parser::{parse_document, parse_workflow, parse_workflow_file};
pub use report::{codes, ParseResult, Severity, ValidationIssue, ValidationResult};
pub use types::*;
pub use validator::{validate_workflow, WorkflowValidator};
