//! stepwise - declarative YAML workflow core
//!
//! stepwise turns YAML workflow documents into validated definitions and
//! runs their steps in order:
//!
//! - **Definitions**: typed model of namespaces, inputs, outputs, variables and steps
//! - **Substitution**: `${source.path}` references resolved against a layered context
//! - **Validation**: schema and semantic passes that collect every problem at once
//! - **Steps**: a registry of executable step types with a uniform lifecycle
//!
//! ## Example
//!
//! ```yaml
//! nameSpace: billing
//! name: invoice-sync
//! version: 1.0.0
//!
//! steps:
//!   - id: fetch
//!     type: apiCall
//!     config:
//!       url: https://api.example.com/invoices
//!       method: GET
//!       retry:
//!         maxRetries: 2
//!         retryOnStatus: [502, 503]
//!
//!   - id: save
//!     type: fileOperation
//!     dependsOn: fetch
//!     config:
//!       operation: write
//!       path: /tmp/invoices.json
//!       content: ${steps.fetch.body}
//!       overwrite: true
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod steps;
pub mod substitution;
pub mod telemetry;
pub mod workflow;

pub use engine::{WorkflowRunResult, WorkflowRunner};
pub use error::{Error, Result};
pub use steps::StepRegistry;
pub use workflow::{WorkflowDefinition, WorkflowValidator};
