//! Drives deployments through a [`DeploymentTrigger`] wired to in-memory collaborators.

use crate::fixtures;
use crate::memory::{
    InMemoryApplicationStore, InMemoryHealthMonitor, InMemoryJobController,
    InMemoryRetriggerQueue, InMemorySystemVersion, ManualClock,
};
use chrono::Duration;
use rollout_core::application::{Application, Deployment, Instance};
use rollout_core::job::JobType;
use rollout_core::ports::Clock;
use rollout_core::run::{Run, RunStatus};
use rollout_core::version::RevisionId;
use rollout_core::{ApplicationId, Error, InstanceId, JobId, Result};
use rollout_scheduler::{DeploymentStatus, DeploymentTrigger, SchedulerConfig};
use std::sync::Arc;

/// Upper bound on sweeps in [`DeploymentTester::deploy`], so a stuck deployment fails instead of hanging.
const MAX_SWEEPS: usize = 100;

pub struct DeploymentTester {
    pub clock: Arc<ManualClock>,
    pub applications: Arc<InMemoryApplicationStore>,
    pub jobs: Arc<InMemoryJobController>,
    pub queue: Arc<InMemoryRetriggerQueue>,
    pub health: Arc<InMemoryHealthMonitor>,
    pub system_version: Arc<InMemorySystemVersion>,
    pub trigger: Arc<DeploymentTrigger>,
}

impl Default for DeploymentTester {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentTester {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        crate::init_test_logging();

        let clock = Arc::new(ManualClock::new(fixtures::start()));
        let applications = Arc::new(InMemoryApplicationStore::new());
        let jobs = Arc::new(InMemoryJobController::new(clock.clone()));
        let queue = Arc::new(InMemoryRetriggerQueue::new());
        let health = Arc::new(InMemoryHealthMonitor::new());
        let system_version = Arc::new(InMemorySystemVersion::new(fixtures::version(
            fixtures::SYSTEM_VERSION,
        )));
        let trigger = Arc::new(DeploymentTrigger::new(
            applications.clone(),
            jobs.clone(),
            queue.clone(),
            health.clone(),
            system_version.clone(),
            clock.clone(),
            config,
        ));

        Self {
            clock,
            applications,
            jobs,
            queue,
            health,
            system_version,
            trigger,
        }
    }

    /// Store a new application with the given YAML deployment spec.
    pub fn new_application(&self, name: &str, spec: &str) -> Result<ApplicationId> {
        let application = fixtures::application(name, spec)?;
        let id = application.id.clone();
        self.applications.put(application);
        Ok(id)
    }

    /// Submit the given revision of the application.
    pub async fn submit(&self, id: &ApplicationId, revision: u64) -> Result<()> {
        self.trigger
            .notify_of_submission(id, RevisionId::new(revision), 1)
            .await
    }

    pub fn application(&self, id: &ApplicationId) -> Result<Application> {
        self.applications
            .application(id)
            .ok_or_else(|| Error::ApplicationNotFound(id.to_string()))
    }

    pub fn instance(&self, id: &InstanceId) -> Result<Instance> {
        Ok(self.application(&id.application())?.require(id.instance())?.clone())
    }

    pub async fn status(&self, id: &ApplicationId) -> Result<DeploymentStatus> {
        self.trigger.deployment_status(&self.application(id)?).await
    }

    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Run one sweep, like the sweeper, but failing on errors. Returns the number of jobs triggered.
    pub async fn sweep(&self) -> Result<usize> {
        self.trigger.trigger_new_revisions().await?;
        let triggered = self.trigger.trigger_ready_jobs().await?;
        let retriggered = self.trigger.process_retrigger_queue().await?;
        Ok(triggered + retriggered)
    }

    /// Jobs currently running, in job order.
    pub fn running(&self) -> Vec<JobId> {
        self.jobs.running()
    }

    /// Job types currently running for the given instance.
    pub fn running_types(&self, instance: &InstanceId) -> Vec<JobType> {
        self.running()
            .into_iter()
            .filter(|job| job.instance == *instance)
            .map(|job| job.job_type)
            .collect()
    }

    /// End the running job with the given status, as the step runner would, and notify the trigger.
    ///
    /// A successful production deployment updates the instance's deployment in that zone.
    pub async fn finish(&self, job: &JobId, status: RunStatus) -> Result<Run> {
        let run = self.jobs.finish(job, status)?;
        if run.has_succeeded() && job.job_type.is_production() && job.job_type.is_deployment() {
            let id = job.instance.application();
            let application = self.application(&id)?;
            let deployment = Deployment::new(
                job.job_type.zone(),
                run.versions.target_platform.clone(),
                run.versions.target_revision,
                self.clock.now(),
            );
            let instance = application
                .require(job.instance.instance())?
                .clone()
                .with_deployment(deployment);
            self.applications.put(application.with_instance(instance));
        }
        self.trigger.notify_of_completion(&job.instance).await?;
        Ok(run)
    }

    pub async fn succeed(&self, job: &JobId) -> Result<Run> {
        self.finish(job, RunStatus::Success).await
    }

    /// Sweep, and let every running job succeed a minute later, until a sweep leaves nothing running.
    pub async fn deploy(&self) -> Result<()> {
        for _ in 0..MAX_SWEEPS {
            self.sweep().await?;
            let running = self.running();
            if running.is_empty() {
                return Ok(());
            }
            self.advance(Duration::minutes(1));
            for job in running {
                self.succeed(&job).await?;
            }
            self.advance(Duration::minutes(1));
        }
        Err(Error::Internal(format!(
            "deployment did not settle within {MAX_SWEEPS} sweeps"
        )))
    }
}
