//! Workflow YAML parser.

use std::path::Path;

use serde_json::Value;

use super::report::{codes, ValidationIssue};
use super::types::WorkflowDefinition;
use crate::error::{Error, Result};

/// Parse YAML text into an untyped document.
///
/// Syntax failures become a single `YAML_PARSE_ERROR` issue.
pub fn parse_document(yaml: &str) -> std::result::Result<Value, ValidationIssue> {
    if yaml.trim().is_empty() {
        return Err(ValidationIssue::error(
            codes::YAML_PARSE_ERROR,
            "Empty workflow definition",
        ));
    }

    serde_yaml::from_str::<Value>(yaml).map_err(|e| {
        let issue = ValidationIssue::error(codes::YAML_PARSE_ERROR, format!("Invalid YAML: {}", e));
        match e.location() {
            Some(loc) => issue.at(format!("line {}, column {}", loc.line(), loc.column())),
            None => issue,
        }
    })
}

/// Parse a typed workflow without running validation.
pub fn parse_workflow(yaml: &str) -> Result<WorkflowDefinition> {
    if yaml.trim().is_empty() {
        return Err(Error::Parse("Empty workflow definition".to_string()));
    }

    serde_yaml::from_str(yaml).map_err(|e| {
        let msg = e.to_string();
        if let Some(field) = extract_missing_field(&msg) {
            Error::Parse(format!("Missing required field: {}", field))
        } else {
            Error::Parse(format!("Invalid YAML: {}", msg))
        }
    })
}

/// Parse a typed workflow from a file path.
pub fn parse_workflow_file(path: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow(&content)
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepType;

    #[test]
    fn test_parse_simple_workflow() {
        let yaml = r#"
nameSpace: ops
name: nightly-report
version: 1.2.0
description: Build the nightly report

steps:
  - id: fetch
    type: apiCall
    config:
      url: https://example.com/data
      method: GET

  - id: announce
    type: log
    dependsOn: fetch
    continueOnError: true
    config:
      message: "Fetched ${steps.fetch.status}"
"#;

        let workflow = parse_workflow(yaml).unwrap();
        assert_eq!(workflow.name, "nightly-report");
        assert_eq!(workflow.steps.len(), 2);
        assert_eq!(workflow.steps[0].step_type, StepType::ApiCall);
        assert_eq!(workflow.steps[1].dependencies(), vec!["fetch"]);
        assert!(workflow.steps[1].continue_on_error);
        assert_eq!(workflow.qualified_name(), "ops/nightly-report@1.2.0");
    }

    #[test]
    fn test_parse_inputs_and_metadata() {
        let yaml = r#"
nameSpace: inventory
name: with-inputs
version: 0.1.0
metadata:
  timeout: 30000
  retryPolicy:
    maxAttempts: 3
    delay: 200
    backoff: linear
inputs:
  threshold:
    type: number
    default: 10
    description: Stock threshold
variables:
  count: 0
steps:
  - id: check
    type: log
    config:
      message: "threshold ${input.threshold}"
"#;

        let workflow = parse_workflow(yaml).unwrap();
        let threshold = &workflow.inputs["threshold"];
        assert_eq!(threshold.param_type, "number");
        assert_eq!(threshold.default, Some(serde_json::json!(10)));
        assert_eq!(workflow.metadata.timeout, Some(30000));
        assert_eq!(workflow.metadata.retry_policy.unwrap().max_attempts, 3);
        assert_eq!(workflow.variables["count"], 0);
    }

    #[test]
    fn test_parse_empty_workflow() {
        let result = parse_workflow("");
        assert!(result
            .unwrap_err()
            .to_string()
            .to_lowercase()
            .contains("empty workflow"));
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = parse_workflow("name: [broken");
        assert!(result
            .unwrap_err()
            .to_string()
            .to_lowercase()
            .contains("invalid yaml"));
    }

    #[test]
    fn test_parse_missing_required_field_name() {
        let yaml = r#"
nameSpace: ops
version: 1.0.0
steps:
  - id: step1
    type: log
"#;
        let result = parse_workflow(yaml);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Missing required field: name"));
    }

    #[test]
    fn test_parse_document_reports_location() {
        let issue = parse_document("name: ok\nsteps: [unclosed").unwrap_err();
        assert_eq!(issue.code, codes::YAML_PARSE_ERROR);
        assert!(issue.path.is_some());

        let doc = parse_document("name: ok\nversion: 1.0\n").unwrap();
        assert_eq!(doc["name"], "ok");
        assert!(doc["version"].is_number());
    }

    #[test]
    fn test_parse_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.yaml");
        std::fs::write(
            &path,
            "nameSpace: a\nname: b\nversion: 1.0.0\nsteps:\n  - id: s\n    type: delay\n    config:\n      duration: 1\n",
        )
        .unwrap();
        let workflow = parse_workflow_file(&path).unwrap();
        assert_eq!(workflow.steps[0].step_type, StepType::Delay);
        assert!(parse_workflow_file(&dir.path().join("missing.yaml")).is_err());
    }
}
