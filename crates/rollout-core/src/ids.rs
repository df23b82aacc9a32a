//! Strongly-typed identifiers for domain entities.

use crate::job::JobType;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_name {
    ($name:ident) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self::new(name)
            }
        }

        impl From<String> for $name {
            fn from(name: String) -> Self {
                Self(name)
            }
        }
    };
}

define_name!(TenantName);
define_name!(ApplicationName);
define_name!(InstanceName);
define_name!(RegionName);

/// An application, owned by a tenant. Locks are keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApplicationId {
    pub tenant: TenantName,
    pub application: ApplicationName,
}

impl ApplicationId {
    pub fn new(tenant: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            tenant: TenantName::new(tenant),
            application: ApplicationName::new(application),
        }
    }

    /// The id of the given instance of this application.
    pub fn instance(&self, instance: impl Into<InstanceName>) -> InstanceId {
        InstanceId {
            tenant: self.tenant.clone(),
            application: self.application.clone(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.tenant, self.application)
    }
}

/// One instance of an application; jobs run per instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId {
    pub tenant: TenantName,
    pub application: ApplicationName,
    pub instance: InstanceName,
}

impl InstanceId {
    pub fn new(
        tenant: impl Into<String>,
        application: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            tenant: TenantName::new(tenant),
            application: ApplicationName::new(application),
            instance: InstanceName::new(instance),
        }
    }

    pub fn application(&self) -> ApplicationId {
        ApplicationId {
            tenant: self.tenant.clone(),
            application: self.application.clone(),
        }
    }

    pub fn instance(&self) -> &InstanceName {
        &self.instance
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.tenant, self.application, self.instance)
    }
}

impl std::str::FromStr for InstanceId {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [tenant, application, instance] if parts.iter().all(|part| !part.is_empty()) => {
                Ok(Self::new(*tenant, *application, *instance))
            }
            _ => Err(crate::Error::InvalidArgument(format!(
                "expected 'tenant.application.instance', got '{s}'"
            ))),
        }
    }
}

/// A job: one job type for one instance. Globally unique.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub instance: InstanceId,
    pub job_type: JobType,
}

impl JobId {
    pub fn new(instance: InstanceId, job_type: JobType) -> Self {
        Self { instance, job_type }
    }

    pub fn application(&self) -> ApplicationId {
        self.instance.application()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance, self.job_type)
    }
}

/// One run of a job. Run numbers start at 1 and increase by one per run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId {
    pub job: JobId,
    pub number: u64,
}

impl RunId {
    pub fn new(job: JobId, number: u64) -> Self {
        Self { job, number }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job, self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_display() {
        let id = InstanceId::new("tenant", "app", "default");
        assert_eq!(id.to_string(), "tenant.app.default");
        assert_eq!(id.application().to_string(), "tenant.app");
    }

    #[test]
    fn test_instance_id_parse() {
        let parsed: InstanceId = "tenant.app.beta".parse().unwrap();
        assert_eq!(parsed, ApplicationId::new("tenant", "app").instance("beta"));
        assert!("tenant.app".parse::<InstanceId>().is_err());
        assert!("tenant..beta".parse::<InstanceId>().is_err());
    }

    #[test]
    fn test_run_id_display() {
        let job = JobId::new(InstanceId::new("t", "a", "i"), JobType::SystemTest);
        assert_eq!(RunId::new(job, 3).to_string(), "t.a.i/system-test#3");
    }
}
