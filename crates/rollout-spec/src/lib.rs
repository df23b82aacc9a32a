//! Deployment specifications for Rollout
//!
//! This crate reads user-authored deployment specifications:
//!
//! 1. **Parsing**: YAML documents into [`DeploymentSpec`]
//! 2. **Validation**: structural rules the scheduler relies on
//! 3. **Schema**: JSON schema export, for editors and documentation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rollout_spec::parse_spec;
//!
//! let spec = parse_spec(&std::fs::read_to_string("deployment.yaml")?)?;
//! ```

pub mod parse;
pub mod schema;
pub mod validation;

pub use parse::*;
pub use schema::*;
pub use validation::*;

pub use rollout_core::spec::DeploymentSpec;

/// Errors reading a deployment specification.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid deployment spec: {}", format_issues(.0))]
    Invalid(Vec<ValidationIssue>),

    #[error("Schema error: {0}")]
    Schema(String),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<SpecError> for rollout_core::Error {
    fn from(err: SpecError) -> Self {
        match err {
            SpecError::Io(err) => rollout_core::Error::Io(err),
            SpecError::Schema(message) => rollout_core::Error::Serialization(message),
            other => rollout_core::Error::InvalidSpec(other.to_string()),
        }
    }
}
