//! Applications, their instances, and what is deployed where.

use crate::change::Change;
use crate::ids::{ApplicationId, InstanceId, InstanceName};
use crate::job::{JobType, ZoneId};
use crate::spec::DeploymentSpec;
use crate::version::{RevisionId, Version};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A deployment of some platform and revision to a zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub zone: ZoneId,
    pub platform: Version,
    pub revision: RevisionId,
    pub at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(zone: ZoneId, platform: Version, revision: RevisionId, at: DateTime<Utc>) -> Self {
        Self {
            zone,
            platform,
            revision,
            at,
        }
    }
}

/// One instance of an application, with the change it is currently rolling out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    #[serde(default)]
    pub change: Change,
    #[serde(default)]
    pub deployments: BTreeMap<ZoneId, Deployment>,
    /// Jobs paused until the given instants.
    #[serde(default)]
    pub job_pauses: BTreeMap<JobType, DateTime<Utc>>,
    /// The latest revision to complete its roll-out through this instance.
    #[serde(default)]
    pub latest_deployed: Option<RevisionId>,
}

impl Instance {
    pub fn new(id: InstanceId) -> Self {
        Self {
            id,
            change: Change::empty(),
            deployments: BTreeMap::new(),
            job_pauses: BTreeMap::new(),
            latest_deployed: None,
        }
    }

    pub fn name(&self) -> &InstanceName {
        &self.id.instance
    }

    pub fn with_change(mut self, change: Change) -> Self {
        self.change = change;
        self
    }

    /// Pauses the given job until the given instant, or resumes it.
    pub fn with_job_pause(mut self, job_type: JobType, until: Option<DateTime<Utc>>) -> Self {
        match until {
            Some(until) => self.job_pauses.insert(job_type, until),
            None => self.job_pauses.remove(&job_type),
        };
        self
    }

    pub fn with_latest_deployed(mut self, revision: RevisionId) -> Self {
        self.latest_deployed = Some(revision);
        self
    }

    pub fn with_deployment(mut self, deployment: Deployment) -> Self {
        self.deployments.insert(deployment.zone.clone(), deployment);
        self
    }

    pub fn deployment(&self, zone: &ZoneId) -> Option<&Deployment> {
        self.deployments.get(zone)
    }

    pub fn production_deployments(&self) -> impl Iterator<Item = &Deployment> {
        self.deployments
            .values()
            .filter(|deployment| deployment.zone.environment.is_production())
    }
}

/// An application: its deployment spec, instances and submitted revisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    #[serde(default)]
    pub deployment_spec: DeploymentSpec,
    #[serde(default)]
    pub instances: BTreeMap<InstanceName, Instance>,
    /// The latest submitted revision, if any.
    #[serde(default)]
    pub latest_revision: Option<RevisionId>,
    /// Applications without a project id are not built by the pipeline, and never triggered.
    #[serde(default)]
    pub project_id: Option<u64>,
}

impl Application {
    pub fn new(id: ApplicationId) -> Self {
        Self {
            id,
            deployment_spec: DeploymentSpec::empty(),
            instances: BTreeMap::new(),
            latest_revision: None,
            project_id: None,
        }
    }

    /// Sets the deployment spec, adding any instance it declares which is not yet known.
    pub fn with_deployment_spec(mut self, spec: DeploymentSpec) -> Self {
        for name in spec.instance_names() {
            if !self.instances.contains_key(&name) {
                let instance = Instance::new(self.id.instance(name.clone()));
                self.instances.insert(name, instance);
            }
        }
        self.deployment_spec = spec;
        self
    }

    pub fn with_instance(mut self, instance: Instance) -> Self {
        self.instances.insert(instance.name().clone(), instance);
        self
    }

    pub fn with_project_id(mut self, project_id: Option<u64>) -> Self {
        self.project_id = project_id;
        self
    }

    pub fn with_new_submission(mut self, project_id: u64, revision: RevisionId) -> Self {
        self.project_id = Some(project_id);
        self.latest_revision = Some(revision);
        self
    }

    pub fn instance(&self, name: &InstanceName) -> Option<&Instance> {
        self.instances.get(name)
    }

    /// The named instance, or an error if this application has no such instance.
    pub fn require(&self, name: &InstanceName) -> Result<&Instance> {
        self.instance(name)
            .ok_or_else(|| Error::InstanceNotFound(self.id.instance(name.clone()).to_string()))
    }

    /// Whether any instance has a change with targets, or a pin.
    pub fn has_changes(&self) -> bool {
        self.instances.values().any(|instance| !instance.change.is_empty())
    }

    /// The oldest platform deployed to any production zone.
    pub fn oldest_deployed_platform(&self) -> Option<Version> {
        self.instances
            .values()
            .flat_map(Instance::production_deployments)
            .map(|deployment| deployment.platform.clone())
            .min()
    }

    /// The oldest revision deployed to any production zone.
    pub fn oldest_deployed_revision(&self) -> Option<RevisionId> {
        self.instances
            .values()
            .flat_map(Instance::production_deployments)
            .map(|deployment| deployment.revision)
            .min()
    }
}
