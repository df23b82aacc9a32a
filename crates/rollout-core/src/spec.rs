//! Deployment specification types.
//!
//! These types represent the user-authored deployment pipeline: a tree of ordered and
//! parallel step groups, whose leaves are test or production zones, production tests and
//! delays, grouped under instances.

use crate::ids::{InstanceName, RegionName};
use crate::job::Environment;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeploymentSpec {
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl DeploymentSpec {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// All instances, in declaration order.
    pub fn instances(&self) -> Vec<&InstanceSpec> {
        fn collect<'a>(steps: &'a [Step], into: &mut Vec<&'a InstanceSpec>) {
            for step in steps {
                match step {
                    Step::Instance(instance) => into.push(instance),
                    Step::Steps(nested) | Step::Parallel(nested) => collect(nested, into),
                    _ => {}
                }
            }
        }
        let mut instances = Vec::new();
        collect(&self.steps, &mut instances);
        instances
    }

    pub fn instance_names(&self) -> Vec<InstanceName> {
        self.instances().into_iter().map(|instance| instance.name.clone()).collect()
    }

    pub fn instance(&self, name: &InstanceName) -> Option<&InstanceSpec> {
        self.instances().into_iter().find(|instance| &instance.name == name)
    }
}

/// One node of the deployment spec tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Steps for one instance of the application.
    Instance(InstanceSpec),
    /// Steps run one after the other.
    Steps(Vec<Step>),
    /// Steps run at the same time.
    Parallel(Vec<Step>),
    Delay(DelayStep),
    /// Deployment to a zone: test, staging, or a production region.
    Zone(DeclaredZone),
    /// Production test of a region, run after the deployment to that region.
    Test(DeclaredTest),
}

impl Step {
    /// Nested steps, empty for leaves.
    pub fn steps(&self) -> &[Step] {
        match self {
            Step::Instance(instance) => &instance.steps,
            Step::Steps(steps) | Step::Parallel(steps) => steps,
            _ => &[],
        }
    }

    /// Whether nested steps run in sequence. Instances run their steps in sequence.
    pub fn is_ordered(&self) -> bool {
        !matches!(self, Step::Parallel(_))
    }

    pub fn delay(&self) -> Duration {
        match self {
            Step::Delay(delay) => delay.duration(),
            _ => Duration::zero(),
        }
    }

    /// Whether this step, or any nested step, concerns the given environment.
    pub fn concerns(&self, environment: Environment) -> bool {
        match self {
            Step::Zone(zone) => zone.environment == environment,
            Step::Test(_) => environment == Environment::Prod,
            Step::Delay(_) => false,
            _ => self.steps().iter().any(|step| step.concerns(environment)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InstanceSpec {
    pub name: InstanceName,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub rollout: RolloutPolicy,
    #[serde(default)]
    pub revision_policy: RevisionPolicy,
    #[serde(default)]
    pub change_blockers: Vec<ChangeBlocker>,
}

impl InstanceSpec {
    pub fn new(name: impl Into<InstanceName>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
            rollout: RolloutPolicy::default(),
            revision_policy: RevisionPolicy::default(),
            change_blockers: vec![],
        }
    }

    pub fn with_rollout(mut self, rollout: RolloutPolicy) -> Self {
        self.rollout = rollout;
        self
    }

    pub fn with_revision_policy(mut self, policy: RevisionPolicy) -> Self {
        self.revision_policy = policy;
        self
    }

    pub fn with_change_blocker(mut self, blocker: ChangeBlocker) -> Self {
        self.change_blockers.push(blocker);
        self
    }

    /// Whether this instance has any production steps.
    pub fn concerns_production(&self) -> bool {
        self.steps.iter().any(|step| step.concerns(Environment::Prod))
    }
}

/// How platform upgrades and revision changes interleave when both are pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPolicy {
    /// Whichever part started rolling first stays ahead.
    #[default]
    Separate,
    /// The parts fuse when one catches up, and continue together.
    Leading,
    /// Revisions may run ahead of platform upgrades.
    Simultaneous,
}

/// Whether a new revision may join a revision change already in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RevisionPolicy {
    /// Wait for the current revision to complete first.
    #[default]
    Separate,
    /// Always roll out the latest revision.
    Latest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DelayStep {
    pub seconds: u64,
}

impl DelayStep {
    pub fn duration(&self) -> Duration {
        Duration::seconds(i64::try_from(self.seconds).unwrap_or(i64::MAX / 1000))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeclaredZone {
    pub environment: Environment,
    #[serde(default)]
    pub region: Option<RegionName>,
}

impl DeclaredZone {
    pub fn test() -> Self {
        Self {
            environment: Environment::Test,
            region: None,
        }
    }

    pub fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            region: None,
        }
    }

    pub fn prod(region: impl Into<RegionName>) -> Self {
        Self {
            environment: Environment::Prod,
            region: Some(region.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeclaredTest {
    pub region: RegionName,
}

/// Blocks platform upgrades and/or revision changes from starting during a time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChangeBlocker {
    #[serde(default)]
    pub revision: bool,
    #[serde(default)]
    pub platform: bool,
    pub window: TimeWindow,
}

impl ChangeBlocker {
    pub fn blocks_revisions(&self) -> bool {
        self.revision
    }

    pub fn blocks_platform(&self) -> bool {
        self.platform
    }
}

/// A weekly recurring window of whole hours, in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TimeWindow {
    pub days: Vec<Day>,
    pub hours: Vec<u32>,
}

impl TimeWindow {
    /// A window covering all hours of all days.
    pub fn always() -> Self {
        Self {
            days: Day::ALL.to_vec(),
            hours: (0..24).collect(),
        }
    }

    pub fn includes(&self, instant: DateTime<Utc>) -> bool {
        let weekday = instant.weekday();
        self.days.iter().any(|day| day.weekday() == weekday) && self.hours.contains(&instant.hour())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Day {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl Day {
    pub const ALL: [Day; 7] = [
        Day::Mon,
        Day::Tue,
        Day::Wed,
        Day::Thu,
        Day::Fri,
        Day::Sat,
        Day::Sun,
    ];

    pub fn weekday(&self) -> Weekday {
        match self {
            Day::Mon => Weekday::Mon,
            Day::Tue => Weekday::Tue,
            Day::Wed => Weekday::Wed,
            Day::Thu => Weekday::Thu,
            Day::Fri => Weekday::Fri,
            Day::Sat => Weekday::Sat,
            Day::Sun => Weekday::Sun,
        }
    }
}
