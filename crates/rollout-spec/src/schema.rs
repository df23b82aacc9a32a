//! JSON schema export.

use crate::SpecError;
use rollout_core::spec::DeploymentSpec;
use schemars::schema::RootSchema;
use schemars::schema_for;

/// JSON schema of the deployment spec document.
pub fn deployment_spec_schema() -> RootSchema {
    schema_for!(DeploymentSpec)
}

/// JSON schema of the deployment spec document, pretty-printed.
pub fn deployment_spec_schema_json() -> Result<String, SpecError> {
    serde_json::to_string_pretty(&deployment_spec_schema())
        .map_err(|e| SpecError::Schema(e.to_string()))
}
