//! Deployment specs and values shared by the scenario tests.

use chrono::{DateTime, TimeZone, Utc};
use rollout_core::application::Application;
use rollout_core::change::Versions;
use rollout_core::version::{RevisionId, Version};
use rollout_core::ApplicationId;

pub const TENANT: &str = "tenant";

/// The system version the tester starts with.
pub const SYSTEM_VERSION: &str = "7.0";

/// One instance deploying to two production regions, one after the other.
pub const TWO_REGIONS: &str = r#"
steps:
  - instance:
      name: default
      steps:
        - zone: { environment: prod, region: us-east-3 }
        - zone: { environment: prod, region: eu-west-1 }
"#;

/// Like [`TWO_REGIONS`], but each new revision replaces one in progress.
pub const TWO_REGIONS_LATEST: &str = r#"
steps:
  - instance:
      name: default
      revision_policy: latest
      steps:
        - zone: { environment: prod, region: us-east-3 }
        - zone: { environment: prod, region: eu-west-1 }
"#;

/// [`TWO_REGIONS`] with the given rollout policy for platform and revision changes.
pub fn two_regions_with_rollout(rollout: &str) -> String {
    format!(
        r#"
steps:
  - instance:
      name: default
      rollout: {rollout}
      steps:
        - zone: {{ environment: prod, region: us-east-3 }}
        - zone: {{ environment: prod, region: eu-west-1 }}
"#
    )
}

/// Declared tests, and a production test after the deployment to its region.
pub const WITH_PRODUCTION_TEST: &str = r#"
steps:
  - instance:
      name: default
      steps:
        - zone: { environment: test }
        - zone: { environment: staging }
        - zone: { environment: prod, region: us-east-3 }
        - test: { region: us-east-3 }
"#;

/// Two instances, the second following the first after a delay.
pub const TWO_INSTANCES: &str = r#"
steps:
  - instance:
      name: beta
      steps:
        - zone: { environment: prod, region: us-east-3 }
  - instance:
      name: main
      steps:
        - delay: { seconds: 3600 }
        - zone: { environment: prod, region: us-east-3 }
"#;

/// Monday, 2024-01-01, 12:00 UTC; outside the block windows the fixtures declare.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

pub fn version(version: &str) -> Version {
    version.parse().unwrap_or_else(|_| Version::new(0, 0, 0))
}

pub fn versions(platform: &str, revision: u64) -> Versions {
    Versions::new(version(platform), RevisionId::new(revision), None, None)
}

pub fn application_id(name: &str) -> ApplicationId {
    ApplicationId::new(TENANT, name)
}

/// An application built by the pipeline, with the given deployment spec.
pub fn application(name: &str, spec: &str) -> Result<Application, rollout_spec::SpecError> {
    let spec = rollout_spec::parse_spec(spec)?;
    Ok(Application::new(application_id(name))
        .with_deployment_spec(spec)
        .with_project_id(Some(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_are_valid() {
        for spec in [TWO_REGIONS, TWO_REGIONS_LATEST, WITH_PRODUCTION_TEST, TWO_INSTANCES] {
            let application = application("app", spec).unwrap();
            assert!(!application.instances.is_empty());
        }
        for rollout in ["separate", "leading", "simultaneous"] {
            assert!(application("app", &two_regions_with_rollout(rollout)).is_ok());
        }
        assert_eq!(version(SYSTEM_VERSION).to_string(), "7.0.0");
    }
}
