//! Validation report types.
//!
//! Reports are plain data: document problems never surface as `Err`.

use serde::Serialize;

use super::types::WorkflowDefinition;

/// Stable issue codes.
pub mod codes {
    pub const YAML_PARSE_ERROR: &str = "YAML_PARSE_ERROR";
    pub const INVALID_DOCUMENT: &str = "INVALID_DOCUMENT";
    pub const MISSING_REQUIRED_FIELD: &str = "MISSING_REQUIRED_FIELD";
    pub const INVALID_FIELD_TYPE: &str = "INVALID_FIELD_TYPE";
    pub const EMPTY_STEPS: &str = "EMPTY_STEPS";
    pub const INVALID_STEP: &str = "INVALID_STEP";
    pub const MISSING_STEP_ID: &str = "MISSING_STEP_ID";
    pub const MISSING_STEP_TYPE: &str = "MISSING_STEP_TYPE";
    pub const INVALID_STEP_TYPE: &str = "INVALID_STEP_TYPE";
    pub const INVALID_STEP_CONFIG: &str = "INVALID_STEP_CONFIG";
    pub const STEP_CONFIG_WARNING: &str = "STEP_CONFIG_WARNING";
    pub const NAMESPACE_CONVENTION: &str = "NAMESPACE_CONVENTION";
    pub const INVALID_VERSION_FORMAT: &str = "INVALID_VERSION_FORMAT";
    pub const DUPLICATE_STEP_ID: &str = "DUPLICATE_STEP_ID";
    pub const INVALID_DEPENDENCY: &str = "INVALID_DEPENDENCY";
    pub const FORWARD_DEPENDENCY: &str = "FORWARD_DEPENDENCY";
    pub const CIRCULAR_DEPENDENCY: &str = "CIRCULAR_DEPENDENCY";
    pub const INVALID_TIMEOUT: &str = "INVALID_TIMEOUT";
    pub const INVALID_STEP_TIMEOUT: &str = "INVALID_STEP_TIMEOUT";
    pub const UNSUPPORTED_STEP_TYPE: &str = "UNSUPPORTED_STEP_TYPE";
    pub const SCHEMA_VALIDATION_ERROR: &str = "SCHEMA_VALIDATION_ERROR";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One problem found in a workflow document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            path: None,
            severity: Severity::Error,
        }
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(code, message)
        }
    }

    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Outcome of a schema and/or semantic pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl ValidationResult {
    /// Record an issue in the list matching its severity.
    pub fn push(&mut self, issue: ValidationIssue) {
        match issue.severity {
            Severity::Error => {
                self.valid = false;
                self.errors.push(issue);
            }
            Severity::Warning => self.warnings.push(issue),
        }
    }

    pub fn merge(&mut self, other: ValidationResult) {
        for issue in other.errors.into_iter().chain(other.warnings) {
            self.push(issue);
        }
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.errors
            .iter()
            .chain(&self.warnings)
            .any(|issue| issue.code == code)
    }
}

/// Outcome of the full parse and validation pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ParseResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowDefinition>,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ParseResult {
    pub(crate) fn failed(issue: ValidationIssue) -> Self {
        Self {
            success: false,
            workflow: None,
            errors: vec![issue],
            warnings: Vec::new(),
        }
    }
}
