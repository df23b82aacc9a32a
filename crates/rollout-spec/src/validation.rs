//! Structural validation of deployment specifications.

use crate::SpecError;
use rollout_core::job::Environment;
use rollout_core::spec::{DeploymentSpec, InstanceSpec, Step};
use rollout_core::{InstanceName, RegionName};
use std::collections::HashSet;
use std::fmt;

/// One problem found in a deployment spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Location in the document, like `/steps/0/instance/steps/2`.
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate a deployment spec, reporting every issue found.
pub fn validate(spec: &DeploymentSpec) -> Result<(), SpecError> {
    let issues = issues(spec);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(SpecError::Invalid(issues))
    }
}

/// All issues with the given deployment spec, in document order.
pub fn issues(spec: &DeploymentSpec) -> Vec<ValidationIssue> {
    let mut validator = Validator::default();
    validator.top_level(&spec.steps, "/steps");
    validator.issues
}

#[derive(Default)]
struct Validator {
    instances: HashSet<InstanceName>,
    issues: Vec<ValidationIssue>,
}

/// What an instance has declared so far, in document order.
#[derive(Default)]
struct InstanceScope {
    deployed: HashSet<RegionName>,
    tested: HashSet<RegionName>,
    test_environments: HashSet<Environment>,
}

impl Validator {
    fn top_level(&mut self, steps: &[Step], path: &str) {
        for (i, step) in steps.iter().enumerate() {
            let path = format!("{path}/{i}");
            match step {
                Step::Instance(instance) => self.instance(instance, &format!("{path}/instance")),
                Step::Steps(nested) => self.top_level(nested, &format!("{path}/steps")),
                Step::Parallel(nested) => self.top_level(nested, &format!("{path}/parallel")),
                Step::Delay(_) => {}
                Step::Zone(_) | Step::Test(_) => self.issues.push(ValidationIssue::new(
                    &path,
                    "zones and tests must be declared within an instance",
                )),
            }
        }
    }

    fn instance(&mut self, instance: &InstanceSpec, path: &str) {
        if instance.name.as_str().is_empty() {
            self.issues
                .push(ValidationIssue::new(path, "instance name must not be empty"));
        }
        if !self.instances.insert(instance.name.clone()) {
            self.issues.push(ValidationIssue::new(
                path,
                format!("instance '{}' is declared more than once", instance.name),
            ));
        }

        for (i, blocker) in instance.change_blockers.iter().enumerate() {
            let path = format!("{path}/change_blockers/{i}");
            if !blocker.revision && !blocker.platform {
                self.issues.push(ValidationIssue::new(
                    &path,
                    "change blocker must block revisions, platform, or both",
                ));
            }
            if blocker.window.days.is_empty() || blocker.window.hours.is_empty() {
                self.issues.push(ValidationIssue::new(
                    &path,
                    "change blocker window must name at least one day and one hour",
                ));
            }
            if let Some(hour) = blocker.window.hours.iter().find(|hour| **hour > 23) {
                self.issues.push(ValidationIssue::new(
                    &path,
                    format!("hour {hour} is outside [0, 23]"),
                ));
            }
        }

        let mut scope = InstanceScope::default();
        self.instance_steps(&instance.steps, &format!("{path}/steps"), &mut scope);
    }

    fn instance_steps(&mut self, steps: &[Step], path: &str, scope: &mut InstanceScope) {
        for (i, step) in steps.iter().enumerate() {
            let path = format!("{path}/{i}");
            match step {
                Step::Instance(_) => self
                    .issues
                    .push(ValidationIssue::new(&path, "instances must not be nested")),
                Step::Steps(nested) => {
                    self.instance_steps(nested, &format!("{path}/steps"), scope)
                }
                Step::Parallel(nested) => {
                    self.instance_steps(nested, &format!("{path}/parallel"), scope)
                }
                Step::Delay(_) => {}
                Step::Zone(zone) => match (zone.environment, &zone.region) {
                    (Environment::Test | Environment::Staging, None) => {
                        if !scope.test_environments.insert(zone.environment) {
                            self.issues.push(ValidationIssue::new(
                                &path,
                                format!("{} is declared more than once", zone.environment),
                            ));
                        }
                    }
                    (Environment::Test | Environment::Staging, Some(_)) => {
                        self.issues.push(ValidationIssue::new(
                            &path,
                            format!("{} zones do not take a region", zone.environment),
                        ))
                    }
                    (Environment::Prod, Some(region)) => {
                        if !scope.deployed.insert(region.clone()) {
                            self.issues.push(ValidationIssue::new(
                                &path,
                                format!("production region '{region}' is declared more than once"),
                            ));
                        }
                    }
                    (Environment::Prod, None) => self.issues.push(ValidationIssue::new(
                        &path,
                        "production zones must name a region",
                    )),
                    (environment, _) => self.issues.push(ValidationIssue::new(
                        &path,
                        format!("{environment} zones are deployed manually, and cannot be declared"),
                    )),
                },
                Step::Test(test) => {
                    if !scope.deployed.contains(&test.region) {
                        self.issues.push(ValidationIssue::new(
                            &path,
                            format!(
                                "production test of '{}' must come after the deployment to that region",
                                test.region
                            ),
                        ));
                    }
                    if !scope.tested.insert(test.region.clone()) {
                        self.issues.push(ValidationIssue::new(
                            &path,
                            format!("production test of '{}' is declared more than once", test.region),
                        ));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rollout_core::spec::{ChangeBlocker, DeclaredTest, DeclaredZone, TimeWindow};

    fn instance(name: &str, steps: Vec<Step>) -> Step {
        Step::Instance(InstanceSpec::new(name, steps))
    }

    fn paths(spec: &DeploymentSpec) -> Vec<String> {
        issues(spec).into_iter().map(|issue| issue.path).collect()
    }

    #[test]
    fn test_valid_spec() {
        let spec = DeploymentSpec::new(vec![instance(
            "default",
            vec![
                Step::Zone(DeclaredZone::test()),
                Step::Zone(DeclaredZone::staging()),
                Step::Parallel(vec![
                    Step::Zone(DeclaredZone::prod("us-east-3")),
                    Step::Zone(DeclaredZone::prod("eu-west-1")),
                ]),
                Step::Test(DeclaredTest {
                    region: "us-east-3".into(),
                }),
            ],
        )]);
        assert!(validate(&spec).is_ok());
    }

    #[test]
    fn test_duplicate_instances_and_regions() {
        let spec = DeploymentSpec::new(vec![
            instance(
                "default",
                vec![
                    Step::Zone(DeclaredZone::prod("us-east-3")),
                    Step::Zone(DeclaredZone::prod("us-east-3")),
                ],
            ),
            instance("default", vec![]),
        ]);
        assert_eq!(
            paths(&spec),
            vec!["/steps/0/instance/steps/1", "/steps/1/instance"]
        );
    }

    #[test]
    fn test_production_test_before_deployment() {
        let spec = DeploymentSpec::new(vec![instance(
            "default",
            vec![
                Step::Test(DeclaredTest {
                    region: "us-east-3".into(),
                }),
                Step::Zone(DeclaredZone::prod("us-east-3")),
            ],
        )]);
        assert_eq!(paths(&spec), vec!["/steps/0/instance/steps/0"]);
    }

    #[test]
    fn test_orphaned_zone_and_bad_blocker() {
        let blocker = ChangeBlocker {
            revision: false,
            platform: false,
            window: TimeWindow {
                days: vec![],
                hours: vec![24],
            },
        };
        let spec = DeploymentSpec::new(vec![
            Step::Zone(DeclaredZone::test()),
            Step::Instance(InstanceSpec::new("default", vec![]).with_change_blocker(blocker)),
        ]);
        let issues = issues(&spec);
        assert_eq!(issues.len(), 4);
        assert_eq!(issues[0].path, "/steps/0");
        assert!(issues[3].message.contains("hour 24"));
    }
}
