//! Error types for stepwise.
//!
//! Every variant maps to a stable code so hosts can branch on the failure
//! kind instead of matching message text.

use thiserror::Error;

/// Result type alias for stepwise operations.
pub type Result<T> = std::result::Result<T, Error>;

/// stepwise error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Step error: {0}")]
    Step(String),

    #[error("Invalid step configuration: {0}")]
    StepConfig(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Substitution error: {0}")]
    Substitution(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Workflow(_) => "WORKFLOW_ERROR",
            Error::Step(_) => "STEP_ERROR",
            Error::StepConfig(_) => "STEP_CONFIG_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Substitution(_) => "SUBSTITUTION_ERROR",
            Error::Registry(_) => "REGISTRY_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(e) if e.is_timeout() => "TIMEOUT",
            Error::Http(_) => "HTTP_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Whether retrying the same operation could plausibly succeed.
    ///
    /// Network and timeout failures are transient (a request that could not
    /// even be built is not); everything else is a property of the input
    /// and will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Http(e) => !e.is_builder(),
            _ => false,
        }
    }

    /// Convert to a structured JSON error payload.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::StepConfig("x".into()).code(), "STEP_CONFIG_ERROR");
        assert_eq!(Error::Registry("x".into()).code(), "REGISTRY_ERROR");
        assert_eq!(Error::Timeout("x".into()).code(), "TIMEOUT");
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(Error::from(io).code(), "IO_ERROR");
    }

    #[test]
    fn test_to_json_shape() {
        let json = Error::Validation("bad input".into()).to_json();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("bad input"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout("slow".into()).is_transient());
        assert!(!Error::Validation("bad".into()).is_transient());
    }
}
