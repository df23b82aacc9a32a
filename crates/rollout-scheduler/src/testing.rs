//! Builders for applications and run histories used by the unit tests.

use crate::config::SchedulerConfig;
use crate::status::DeploymentStatus;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rollout_core::application::{Application, Instance};
use rollout_core::change::Versions;
use rollout_core::job::JobType;
use rollout_core::run::{JobStatus, Run, RunStatus};
use rollout_core::spec::{DeploymentSpec, InstanceSpec, Step};
use rollout_core::version::{RevisionId, Version};
use rollout_core::{ApplicationId, JobId, RunId};
use std::collections::BTreeMap;

pub const SYSTEM_VERSION: &str = "7.0";

pub fn application_id() -> ApplicationId {
    ApplicationId::new("tenant", "app")
}

pub fn instance(name: &str, steps: Vec<Step>) -> Step {
    Step::Instance(InstanceSpec::new(name, steps))
}

pub fn application_with(spec: DeploymentSpec) -> Application {
    Application::new(application_id())
        .with_deployment_spec(spec)
        .with_project_id(Some(1))
}

pub fn instance_of(name: &str) -> Instance {
    Instance::new(application_id().instance(name))
}

pub fn job(instance: &str, job_type: JobType) -> JobId {
    JobId::new(application_id().instance(instance), job_type)
}

pub fn prod_job(instance: &str, region: &str) -> JobId {
    job(instance, JobType::ProductionDeployment(region.into()))
}

pub fn test_job(instance: &str, region: &str) -> JobId {
    job(instance, JobType::ProductionTest(region.into()))
}

/// Minutes after midnight on Monday, 2024-01-01.
pub fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub fn v(version: &str) -> Version {
    version.parse().unwrap()
}

/// Versions targeting the given platform and revision, without sources.
pub fn target(platform: &str, revision: u64) -> Versions {
    Versions::new(v(platform), RevisionId::new(revision), None, None)
}

/// Run history, built one run at a time.
#[derive(Debug, Default)]
pub struct History {
    jobs: BTreeMap<JobId, Vec<Run>>,
}

impl History {
    pub fn run(&mut self, job: &JobId, versions: &Versions, status: RunStatus, start: i64, end: i64) {
        let runs = self.jobs.entry(job.clone()).or_default();
        let id = RunId::new(job.clone(), runs.len() as u64 + 1);
        let run = Run::new(id, versions.clone(), t(start), false);
        runs.push(run.finished(status, t(end)));
    }

    pub fn success(&mut self, job: &JobId, versions: &Versions, start: i64, end: i64) {
        self.run(job, versions, RunStatus::Success, start, end);
    }

    pub fn running(&mut self, job: &JobId, versions: &Versions, start: i64) {
        let runs = self.jobs.entry(job.clone()).or_default();
        let id = RunId::new(job.clone(), runs.len() as u64 + 1);
        runs.push(Run::new(id, versions.clone(), t(start), false));
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        self.jobs
            .iter()
            .map(|(job, runs)| JobStatus::new(job.clone(), runs.clone()))
            .collect()
    }

    pub fn status(&self, application: &Application, now: DateTime<Utc>) -> DeploymentStatus {
        DeploymentStatus::new(
            application.clone(),
            self.statuses(),
            v(SYSTEM_VERSION),
            now,
            &SchedulerConfig::default(),
        )
        .unwrap()
    }
}
