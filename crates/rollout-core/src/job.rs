//! Environments, zones and job types.

use crate::ids::RegionName;
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The environment a zone belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Test,
    Staging,
    Prod,
    Dev,
    Perf,
}

impl Environment {
    /// Whether this is one of the shared, pre-production test environments.
    pub fn is_test(&self) -> bool {
        matches!(self, Environment::Test | Environment::Staging)
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Prod)
    }

    /// Environments deployed to directly by users, outside any pipeline.
    pub fn is_manually_deployed(&self) -> bool {
        matches!(self, Environment::Dev | Environment::Perf)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Test => "test",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
            Environment::Dev => "dev",
            Environment::Perf => "perf",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A zone: one region of an environment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ZoneId {
    pub environment: Environment,
    pub region: RegionName,
}

impl ZoneId {
    /// Region used for the shared test and staging zones.
    pub const DEFAULT_REGION: &'static str = "default";

    pub fn new(environment: Environment, region: impl Into<RegionName>) -> Self {
        Self {
            environment,
            region: region.into(),
        }
    }

    pub fn prod(region: impl Into<RegionName>) -> Self {
        Self::new(Environment::Prod, region)
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.environment, self.region)
    }
}

impl TryFrom<String> for ZoneId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        let (environment, region) = value
            .split_once('.')
            .ok_or_else(|| Error::InvalidArgument(format!("invalid zone '{value}'")))?;
        let environment = match environment {
            "test" => Environment::Test,
            "staging" => Environment::Staging,
            "prod" => Environment::Prod,
            "dev" => Environment::Dev,
            "perf" => Environment::Perf,
            other => {
                return Err(Error::InvalidArgument(format!("unknown environment '{other}'")));
            }
        };
        Ok(Self::new(environment, region))
    }
}

impl From<ZoneId> for String {
    fn from(zone: ZoneId) -> Self {
        zone.to_string()
    }
}

/// The type of a job, i.e., what it does, and where.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum JobType {
    SystemTest,
    StagingTest,
    ProductionDeployment(RegionName),
    ProductionTest(RegionName),
    Dev(RegionName),
    Perf(RegionName),
}

impl JobType {
    /// The job type deploying to the given zone.
    pub fn deployment_to(zone: &ZoneId) -> Self {
        match zone.environment {
            Environment::Test => JobType::SystemTest,
            Environment::Staging => JobType::StagingTest,
            Environment::Prod => JobType::ProductionDeployment(zone.region.clone()),
            Environment::Dev => JobType::Dev(zone.region.clone()),
            Environment::Perf => JobType::Perf(zone.region.clone()),
        }
    }

    /// The production test verifying the deployment to the given production region.
    pub fn test_of(region: &RegionName) -> Self {
        JobType::ProductionTest(region.clone())
    }

    /// System, staging and production tests.
    pub fn is_test(&self) -> bool {
        matches!(
            self,
            JobType::SystemTest | JobType::StagingTest | JobType::ProductionTest(_)
        )
    }

    pub fn is_production(&self) -> bool {
        matches!(
            self,
            JobType::ProductionDeployment(_) | JobType::ProductionTest(_)
        )
    }

    /// Whether this job deploys something, rather than only verifying what is deployed.
    pub fn is_deployment(&self) -> bool {
        !matches!(self, JobType::ProductionTest(_))
    }

    pub fn environment(&self) -> Environment {
        match self {
            JobType::SystemTest => Environment::Test,
            JobType::StagingTest => Environment::Staging,
            JobType::ProductionDeployment(_) | JobType::ProductionTest(_) => Environment::Prod,
            JobType::Dev(_) => Environment::Dev,
            JobType::Perf(_) => Environment::Perf,
        }
    }

    /// The zone this job deploys to, or verifies. Production tests share the zone of their deployment.
    pub fn zone(&self) -> ZoneId {
        match self {
            JobType::SystemTest => ZoneId::new(Environment::Test, ZoneId::DEFAULT_REGION),
            JobType::StagingTest => ZoneId::new(Environment::Staging, ZoneId::DEFAULT_REGION),
            JobType::ProductionDeployment(region) | JobType::ProductionTest(region) => {
                ZoneId::prod(region.clone())
            }
            JobType::Dev(region) => ZoneId::new(Environment::Dev, region.clone()),
            JobType::Perf(region) => ZoneId::new(Environment::Perf, region.clone()),
        }
    }

    pub fn is_manually_deployed(&self) -> bool {
        self.environment().is_manually_deployed()
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::SystemTest => f.write_str("system-test"),
            JobType::StagingTest => f.write_str("staging-test"),
            JobType::ProductionDeployment(region) => write!(f, "production-{region}"),
            JobType::ProductionTest(region) => write!(f, "test-{region}"),
            JobType::Dev(region) => write!(f, "dev-{region}"),
            JobType::Perf(region) => write!(f, "perf-{region}"),
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "system-test" => return Ok(JobType::SystemTest),
            "staging-test" => return Ok(JobType::StagingTest),
            _ => {}
        }
        let (kind, region) = s
            .split_once('-')
            .filter(|(_, region)| !region.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("unknown job type '{s}'")))?;
        let region = RegionName::new(region);
        match kind {
            "production" => Ok(JobType::ProductionDeployment(region)),
            "test" => Ok(JobType::ProductionTest(region)),
            "dev" => Ok(JobType::Dev(region)),
            "perf" => Ok(JobType::Perf(region)),
            _ => Err(Error::InvalidArgument(format!("unknown job type '{s}'"))),
        }
    }
}

impl TryFrom<String> for JobType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<JobType> for String {
    fn from(job_type: JobType) -> Self {
        job_type.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_names() {
        let region = RegionName::new("us-east-3");
        for job_type in [
            JobType::SystemTest,
            JobType::StagingTest,
            JobType::ProductionDeployment(region.clone()),
            JobType::ProductionTest(region.clone()),
            JobType::Dev(region.clone()),
            JobType::Perf(region),
        ] {
            assert_eq!(job_type.to_string().parse::<JobType>().unwrap(), job_type);
        }
        assert!("production-".parse::<JobType>().is_err());
        assert!("canary-us-east-3".parse::<JobType>().is_err());
    }

    #[test]
    fn test_production_test_shares_deployment_zone() {
        let region = RegionName::new("eu-west-1");
        let test = JobType::test_of(&region);
        assert!(test.is_test());
        assert!(test.is_production());
        assert!(!test.is_deployment());
        assert_eq!(test.zone(), ZoneId::prod("eu-west-1"));
        assert_eq!(
            JobType::deployment_to(&test.zone()),
            JobType::ProductionDeployment(region)
        );
    }

    #[test]
    fn test_zone_serialization() {
        let zone = ZoneId::prod("us-west-1");
        let json = serde_json::to_string(&zone).unwrap();
        assert_eq!(json, "\"prod.us-west-1\"");
        let parsed: ZoneId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, zone);
    }
}
