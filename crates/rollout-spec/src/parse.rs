//! YAML parsing of deployment specifications.

use crate::SpecError;
use crate::validation::validate;
use rollout_core::spec::DeploymentSpec;
use serde_yaml::with::singleton_map_recursive;
use std::path::Path;

/// Parse and validate a deployment spec from a YAML string.
pub fn parse_spec(yaml: &str) -> Result<DeploymentSpec, SpecError> {
    let spec = parse_unvalidated(yaml)?;
    validate(&spec)?;
    Ok(spec)
}

/// Parse a deployment spec from a YAML string, without validating it.
pub fn parse_unvalidated(yaml: &str) -> Result<DeploymentSpec, SpecError> {
    if yaml.trim().is_empty() {
        return Ok(DeploymentSpec::empty());
    }
    // Steps are written as one-entry maps, `- zone: {...}`, rather than YAML tags.
    singleton_map_recursive::deserialize(serde_yaml::Deserializer::from_str(yaml))
        .map_err(|e| SpecError::Parse(e.to_string()))
}

/// Load, parse and validate a deployment spec from a YAML file.
pub fn load_spec(path: &Path) -> Result<DeploymentSpec, SpecError> {
    let content = std::fs::read_to_string(path)?;
    parse_spec(&content)
}

/// Render a deployment spec as YAML.
pub fn to_yaml(spec: &DeploymentSpec) -> Result<String, SpecError> {
    let mut yaml = Vec::new();
    {
        let mut serializer = serde_yaml::Serializer::new(&mut yaml);
        singleton_map_recursive::serialize(spec, &mut serializer)
            .map_err(|e| SpecError::Parse(e.to_string()))?;
    }
    String::from_utf8(yaml).map_err(|e| SpecError::Parse(e.to_string()))
}
