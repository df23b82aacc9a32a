//! Triggering of jobs, and management of the changes instances roll out.
//!
//! The [`DeploymentTrigger`] is the only component with side effects: it reads applications and
//! run history through the ports, evaluates a [`DeploymentStatus`] snapshot, and starts or aborts
//! runs, and updates instance changes, under the per-application lock.

use crate::config::SchedulerConfig;
use crate::jobs::{JobsToRun, PlannedJob};
use crate::queue;
use crate::status::DeploymentStatus;
use chrono::{DateTime, Utc};
use rollout_core::application::{Application, Instance};
use rollout_core::change::{Change, Versions};
use rollout_core::job::{JobType, ZoneId};
use rollout_core::ports::{
    ApplicationStore, Clock, HealthMonitor, JobController, LockedApplication, RetriggerEntry,
    RetriggerQueue, SystemVersionSource,
};
use rollout_core::run::JobStatus;
use rollout_core::spec::RevisionPolicy;
use rollout_core::version::RevisionId;
use rollout_core::{ApplicationId, Error, InstanceId, InstanceName, JobId, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use rollout_trace::{instance_span, job_span};
use tracing::{Instrument, debug, info, warn};

/// Which parts of an instance's change to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangesToCancel {
    /// Everything, including any pin.
    All,
    Platform,
    Revision,
    /// Both platform and revision, leaving only a pin.
    Versions,
    Pin,
}

/// A job ready to be triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyJob {
    pub instance: InstanceId,
    pub job_type: JobType,
    pub versions: Versions,
    pub available_since: DateTime<Utc>,
    /// Whether the last run ran out of capacity.
    pub is_retry: bool,
    /// Whether the instance is rolling out a new revision.
    pub is_revision_change: bool,
}

impl ReadyJob {
    fn new(
        instance: &Instance,
        job_type: JobType,
        versions: Versions,
        status: Option<&JobStatus>,
        available_since: DateTime<Utc>,
    ) -> Self {
        Self {
            instance: instance.id.clone(),
            job_type,
            versions,
            available_since,
            is_retry: status.is_some_and(JobStatus::is_out_of_capacity),
            is_revision_change: instance.change.revision.is_some(),
        }
    }

    pub fn job(&self) -> JobId {
        JobId::new(self.instance.clone(), self.job_type.clone())
    }
}

impl fmt::Display for ReadyJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} for {} on ({}), ready since {}",
            self.job_type, self.instance, self.versions, self.available_since
        )
    }
}

/// Production jobs in order, grouped by instance, and the first test job of each type, by priority.
fn prioritized(ready: Vec<ReadyJob>) -> Vec<ReadyJob> {
    let (mut tests, production): (Vec<ReadyJob>, Vec<ReadyJob>) =
        ready.into_iter().partition(|job| job.job_type.is_test());

    let mut instances: Vec<InstanceId> = Vec::new();
    for job in &production {
        if !instances.contains(&job.instance) {
            instances.push(job.instance.clone());
        }
    }
    let mut ordered: Vec<ReadyJob> = Vec::with_capacity(production.len() + tests.len());
    for instance in instances {
        ordered.extend(
            production
                .iter()
                .filter(|job| job.instance == instance)
                .cloned(),
        );
    }

    // Test environments have limited capacity.
    tests.sort_by_key(|job| (!job.is_retry, !job.is_revision_change, job.available_since));
    let mut types = HashSet::new();
    ordered.extend(
        tests
            .into_iter()
            .filter(|job| types.insert(job.job_type.clone())),
    );
    ordered
}

/// Decides which jobs to run, and when, and manages the changes of instances.
pub struct DeploymentTrigger {
    applications: Arc<dyn ApplicationStore>,
    jobs: Arc<dyn JobController>,
    retrigger_queue: Arc<dyn RetriggerQueue>,
    health: Arc<dyn HealthMonitor>,
    versions: Arc<dyn SystemVersionSource>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl DeploymentTrigger {
    pub fn new(
        applications: Arc<dyn ApplicationStore>,
        jobs: Arc<dyn JobController>,
        retrigger_queue: Arc<dyn RetriggerQueue>,
        health: Arc<dyn HealthMonitor>,
        versions: Arc<dyn SystemVersionSource>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            applications,
            jobs,
            retrigger_queue,
            health,
            versions,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Evaluate the deployment status of the given application, as of now.
    pub async fn deployment_status(&self, application: &Application) -> Result<DeploymentStatus> {
        let job_statuses = self.jobs.job_statuses(&application.id).await?;
        let system_version = self.versions.system_version().await?;
        DeploymentStatus::new(
            application.clone(),
            job_statuses,
            system_version,
            self.clock.now(),
            &self.config,
        )
    }

    async fn require_application(&self, id: &ApplicationId) -> Result<Application> {
        self.applications
            .get(id)
            .await?
            .ok_or_else(|| Error::ApplicationNotFound(id.to_string()))
    }

    /// Record a new submission, and roll it out to instances ready for it.
    pub async fn notify_of_submission(
        &self,
        id: &ApplicationId,
        revision: RevisionId,
        project_id: u64,
    ) -> Result<()> {
        if self.applications.get(id).await?.is_none() {
            warn!(application = %id, project_id, "Ignoring submission from unknown application");
            return Ok(());
        }

        let locked = self.applications.lock(id).await?;
        let application = locked
            .application()
            .clone()
            .with_new_submission(project_id, revision);
        locked.store(application).await?;
        info!(application = %id, %revision, "Recorded new submission");

        self.trigger_new_revision(id).await
    }

    /// Propagate the latest revision to instances which are ready for it, and accept it.
    pub async fn trigger_new_revision(&self, id: &ApplicationId) -> Result<()> {
        let locked = match self.applications.lock(id).await {
            Err(Error::ApplicationNotFound(_)) => return Ok(()),
            locked => locked?,
        };
        let mut application = locked.application().clone();
        let status = self.deployment_status(&application).await?;
        let now = self.clock.now();

        for name in application.deployment_spec.instance_names() {
            let outstanding = status.outstanding_change(&name)?;
            let Some(revision) = outstanding.revision else {
                continue;
            };
            let ready = status
                .instance_step(&name)
                .and_then(|step| step.ready_at(&outstanding))
                .is_some_and(|ready_at| ready_at <= now);
            if ready && accept_new_revision(&status, &name, revision) {
                let change = status
                    .application()
                    .require(&name)?
                    .change
                    .clone()
                    .with_revision(revision);
                let instance = with_remaining_change(&status, &name, &change)?;
                info!(instance = %instance.id, change = %instance.change, "Rolling out new revision");
                application = application.with_instance(instance);
            }
        }
        locked.store(application).await
    }

    /// Propagate new revisions for every orchestrated application, so instances pick up what
    /// their upstream instances have completed.
    pub async fn trigger_new_revisions(&self) -> Result<()> {
        for id in self.applications.list().await? {
            let Some(application) = self.applications.get(&id).await? else {
                continue;
            };
            if application.project_id.is_none() || application.deployment_spec.is_empty() {
                continue;
            }
            if let Err(err) = self.trigger_new_revision(&id).await {
                warn!(application = %id, error = %err, "Failed to roll out new revision");
            }
        }
        Ok(())
    }

    /// Update the change of an instance after one of its jobs completed.
    pub async fn notify_of_completion(&self, instance: &InstanceId) -> Result<()> {
        let id = instance.application();
        let known = self
            .applications
            .get(&id)
            .await?
            .is_some_and(|application| application.instance(instance.instance()).is_some());
        if !known {
            warn!(%instance, "Ignoring completion of job of unknown instance");
            return Ok(());
        }

        let locked = self.applications.lock(&id).await?;
        let application = locked.application().clone();
        let status = self.deployment_status(&application).await?;
        let current = application.require(instance.instance())?.change.clone();
        let updated = with_remaining_change(&status, instance.instance(), &current)?;
        if updated.change != current {
            info!(%instance, change = %updated.change, "Remaining change after completion");
        }
        locked.store(application.with_instance(updated)).await
    }

    /// Trigger all jobs which are ready to run, and return how many were triggered.
    ///
    /// All ready production jobs are triggered, but at most one test job of each type.
    pub async fn trigger_ready_jobs(&self) -> Result<usize> {
        let ready = self.compute_ready_jobs().await?;
        let mut triggered = 0;
        for job in prioritized(ready) {
            if self.trigger(&job).await? {
                triggered += 1;
            }
        }
        Ok(triggered)
    }

    /// The jobs which are ready to run now, across all orchestrated applications.
    ///
    /// A ready job still running outdated versions has that run aborted, and is left for the next pass.
    pub async fn compute_ready_jobs(&self) -> Result<Vec<ReadyJob>> {
        let mut ready = Vec::new();
        for id in self.applications.list().await? {
            let Some(application) = self.applications.get(&id).await? else {
                continue;
            };
            // Only applications built by the pipeline are orchestrated.
            if application.project_id.is_none() || application.deployment_spec.is_empty() {
                continue;
            }
            let status = self.deployment_status(&application).await?;
            if !has_changes(&status)? {
                continue;
            }
            ready.extend(self.compute_ready_jobs_for(&status).await?);
        }
        Ok(ready)
    }

    async fn compute_ready_jobs_for(&self, status: &DeploymentStatus) -> Result<Vec<ReadyJob>> {
        let now = self.clock.now();
        let jobs = status.jobs_to_run()?;
        let mut ready = Vec::new();
        for (job, planned) in jobs.iter() {
            let Some(first) = planned.first() else {
                continue;
            };
            let Some(ready_at) = first.ready_at.filter(|ready_at| *ready_at <= now) else {
                continue;
            };
            if job.job_type.is_production()
                && self.is_unhealthy_in_another_zone(status.application(), job).await?
            {
                debug!(%job, "Not triggering, as deployments in other zones are unhealthy");
                continue;
            }
            if !self.abort_if_running(status, &jobs, job).await? {
                continue;
            }
            let instance = status.application().require(job.instance.instance())?;
            ready.push(ReadyJob::new(
                instance,
                job.job_type.clone(),
                first.versions.clone(),
                status.job(job),
                ready_at,
            ));
        }
        Ok(ready)
    }

    async fn is_unhealthy_in_another_zone(&self, application: &Application, job: &JobId) -> Result<bool> {
        let instance = application.require(job.instance.instance())?;
        let zone = job.job_type.zone();
        for deployment in instance.production_deployments() {
            if deployment.zone != zone && !self.health.is_healthy(&instance.id, &deployment.zone).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Abort the job's active run, if it runs versions none of its planned runs have.
    async fn abort_if_outdated(
        &self,
        status: &DeploymentStatus,
        jobs: &JobsToRun,
        job: &JobId,
    ) -> Result<()> {
        let Some(last) = status
            .job(job)
            .and_then(JobStatus::last_triggered)
            .filter(|run| !run.has_ended())
        else {
            return Ok(());
        };
        let Some(planned) = jobs.get(job) else {
            return Ok(());
        };
        let current = planned.iter().any(|planned| {
            planned.versions.targets_match(&last.versions)
                && planned.versions.sources_match_if_present(&last.versions)
        });
        if !current {
            info!(run = %last.id, versions = %last.versions, "Aborting outdated run");
            self.jobs.abort(&last.id, "outdated").await?;
        }
        Ok(())
    }

    /// Whether the job is free to start. Aborts its run, and that of its production test, if they
    /// run outdated versions; the job then starts on a later pass.
    async fn abort_if_running(
        &self,
        status: &DeploymentStatus,
        jobs: &JobsToRun,
        job: &JobId,
    ) -> Result<bool> {
        self.abort_if_outdated(status, jobs, job).await?;
        let mut blocked = status.job(job).is_some_and(JobStatus::is_running);

        if let JobType::ProductionDeployment(region) = &job.job_type {
            let test = JobId::new(job.instance.clone(), JobType::test_of(region));
            if status.job(&test).is_some() {
                self.abort_if_outdated(status, jobs, &test).await?;
                // Held back while the production test has other versions left to verify first.
                let next_test = jobs.get(&test).and_then(<[PlannedJob]>::first);
                let next_deployment = jobs.get(job).and_then(<[PlannedJob]>::first);
                if let (Some(next_test), Some(next_deployment)) = (next_test, next_deployment) {
                    if !next_test.versions.targets_match(&next_deployment.versions) {
                        blocked = true;
                    }
                }
            }
        }
        Ok(!blocked)
    }

    /// Start the given job, unless it is already running the same versions. Returns whether it started.
    pub async fn trigger(&self, job: &ReadyJob) -> Result<bool> {
        let id = job.job();
        self.trigger_job(&id, job)
            .instrument(job_span(&id, "trigger"))
            .await
    }

    async fn trigger_job(&self, id: &JobId, job: &ReadyJob) -> Result<bool> {
        let locked = self.applications.lock(&job.instance.application()).await?;

        let current = self.jobs.job_status(id).await?;
        let running_same = current.last_triggered().is_some_and(|run| {
            !run.has_ended()
                && run.versions.targets_match(&job.versions)
                && run.versions.sources_match_if_present(&job.versions)
        });
        if running_same {
            debug!(job = %id, "Already running with these versions");
            return Ok(false);
        }

        debug!(%job, "Triggering");
        self.jobs
            .start(&job.instance, &job.job_type, &job.versions, job.is_retry)
            .await?;

        let application = locked.application().clone();
        let instance = application
            .require(job.instance.instance())?
            .clone()
            .with_job_pause(job.job_type.clone(), None);
        locked.store(application.with_instance(instance)).await?;
        Ok(true)
    }

    /// Trigger the job again, with the versions of its last run.
    pub async fn re_trigger(&self, instance: &InstanceId, job_type: &JobType) -> Result<JobId> {
        let application = self.require_application(&instance.application()).await?;
        let owner = application.require(instance.instance())?;
        let job = JobId::new(instance.clone(), job_type.clone());
        let status = self.jobs.job_status(&job).await?;
        let versions = status
            .last_triggered()
            .ok_or_else(|| Error::InvalidArgument(format!("{job} has never been triggered")))?
            .versions
            .clone();
        let ready = ReadyJob::new(owner, job_type.clone(), versions, Some(&status), self.clock.now());
        self.trigger(&ready).await?;
        Ok(job)
    }

    /// Trigger the job with the instance's current change, and the tests it needs first, unless
    /// `require_tests` is false. Manually deployed jobs get the system platform with their last revision.
    pub async fn force_trigger(
        &self,
        instance: &InstanceId,
        job_type: &JobType,
        user: &str,
        require_tests: bool,
    ) -> Result<Vec<JobId>> {
        let application = self.require_application(&instance.application()).await?;
        let owner = application.require(instance.instance())?;
        let job = JobId::new(instance.clone(), job_type.clone());
        info!(%job, %user, require_tests, "Force triggering");
        if job_type.is_manually_deployed() {
            return self.force_trigger_manual_job(&job).await;
        }

        let status = self.deployment_status(&application).await?;
        let now = self.clock.now();
        let versions = Versions::from(
            &owner.change,
            &application,
            status.deployment_for(&job),
            status.system_version(),
        );
        let mut requested = JobsToRun::new();
        requested.insert(
            job.clone(),
            vec![PlannedJob::new(versions, Some(now), owner.change.clone())],
        );
        let tests = status.test_jobs(&requested);
        let to_trigger = if tests.is_empty() || !require_tests {
            requested
        } else {
            tests
        };

        let mut triggered = Vec::with_capacity(to_trigger.len());
        for (id, planned) in to_trigger {
            let Some(first) = planned.into_iter().next() else {
                continue;
            };
            let job_status = status.job(&JobId::new(instance.clone(), id.job_type.clone()));
            let ready = ReadyJob::new(owner, id.job_type.clone(), first.versions, job_status, now);
            self.trigger(&ready).await?;
            triggered.push(id);
        }
        Ok(triggered)
    }

    async fn force_trigger_manual_job(&self, job: &JobId) -> Result<Vec<JobId>> {
        let status = self.jobs.job_status(job).await?;
        let last = status
            .last_triggered()
            .ok_or_else(|| Error::InvalidArgument(format!("{job} has never been run")))?;
        let system_version = self.versions.system_version().await?;
        let versions = Versions::new(
            system_version,
            last.versions.target_revision,
            Some(last.versions.target_platform.clone()),
            Some(last.versions.target_revision),
        );
        self.jobs
            .start(&job.instance, &job.job_type, &versions, true)
            .await?;
        Ok(vec![job.clone()])
    }

    /// Trigger the deployment to the given zone again. If it is running, abort it, and queue a
    /// retrigger for when it has ended instead.
    pub async fn re_trigger_or_add_to_queue(
        &self,
        instance: &InstanceId,
        zone: &ZoneId,
    ) -> Result<Option<JobId>> {
        let job_type = JobType::deployment_to(zone);
        let active = self
            .jobs
            .active(instance)
            .await?
            .into_iter()
            .find(|run| run.id.job.job_type == job_type);

        let Some(run) = active else {
            return self.re_trigger(instance, &job_type).await.map(Some);
        };

        let locked = self.retrigger_queue.lock().await?;
        let required = RetriggerEntry::new(run.id.job.clone(), run.id.number + 1);
        let entries = queue::enqueue(locked.entries(), required);
        locked.write(entries).await?;
        info!(run = %run.id, "Aborting run, and queueing retrigger");
        self.jobs.abort(&run.id, "retriggered").await?;
        Ok(None)
    }

    /// Retrigger queued jobs which are no longer running, and drop satisfied entries.
    /// Returns the number of jobs triggered.
    pub async fn process_retrigger_queue(&self) -> Result<usize> {
        let locked = self.retrigger_queue.lock().await?;
        let entries = locked.entries().to_vec();
        let mut remaining = Vec::with_capacity(entries.len());
        let mut triggered = 0;

        for entry in entries {
            let status = self.jobs.job_status(&entry.job).await?;
            if !queue::needs_trigger(&entry, &status) {
                continue;
            }
            if status.is_running() {
                remaining.push(entry);
                continue;
            }
            match self.re_trigger(&entry.job.instance, &entry.job.job_type).await {
                Ok(job) => {
                    debug!(%job, "Retriggered queued job");
                    triggered += 1;
                }
                Err(
                    err @ (Error::ApplicationNotFound(_)
                    | Error::InstanceNotFound(_)
                    | Error::InvalidArgument(_)),
                ) => {
                    warn!(job = %entry.job, error = %err, "Dropping retrigger entry");
                }
                Err(err) => {
                    warn!(job = %entry.job, error = %err, "Failed to retrigger queued job");
                    remaining.push(entry);
                }
            }
        }
        locked.write(remaining).await?;
        Ok(triggered)
    }

    /// Prevent the job from starting until the given instant.
    pub async fn pause_job(
        &self,
        instance: &InstanceId,
        job_type: &JobType,
        until: DateTime<Utc>,
    ) -> Result<()> {
        let max_pause = self.config.max_pause();
        if until > self.clock.now() + max_pause {
            return Err(Error::InvalidArgument(format!(
                "pause only allowed for up to {} hours",
                max_pause.num_hours()
            )));
        }
        self.update_instance(instance, |instance| {
            instance.with_job_pause(job_type.clone(), Some(until))
        })
        .await?;
        info!(%instance, %job_type, %until, "Paused job");
        Ok(())
    }

    /// Let a paused job be triggered normally again.
    pub async fn resume_job(&self, instance: &InstanceId, job_type: &JobType) -> Result<()> {
        self.update_instance(instance, |instance| {
            instance.with_job_pause(job_type.clone(), None)
        })
        .await
    }

    async fn update_instance(
        &self,
        id: &InstanceId,
        update: impl FnOnce(Instance) -> Instance,
    ) -> Result<()> {
        let locked = self.applications.lock(&id.application()).await?;
        let application = locked.application().clone();
        let instance = update(application.require(id.instance())?.clone());
        locked.store(application.with_instance(instance)).await
    }

    /// Start rolling out the given change, unless the instance already has one.
    pub async fn trigger_change(&self, instance: &InstanceId, change: &Change) -> Result<()> {
        self.update_change(instance, |current| {
            (!current.has_targets()).then(|| change.on_top_of(current))
        })
        .await
    }

    /// Override the parts of the instance's change which the given change has.
    pub async fn force_change(&self, instance: &InstanceId, change: &Change) -> Result<()> {
        self.update_change(instance, |current| Some(change.on_top_of(current)))
            .await
    }

    /// Cancel the given parts of the instance's change.
    pub async fn cancel_change(&self, instance: &InstanceId, cancel: ChangesToCancel) -> Result<()> {
        self.update_change(instance, |current| {
            Some(match cancel {
                ChangesToCancel::All => Change::empty(),
                ChangesToCancel::Versions => Change::empty().with_pin(),
                ChangesToCancel::Platform => current.without_platform(),
                ChangesToCancel::Revision => current.without_revision(),
                ChangesToCancel::Pin => current.without_pin(),
            })
        })
        .await
    }

    /// Set the instance's change to what `update` returns for its current one, less what is done.
    async fn update_change(
        &self,
        id: &InstanceId,
        update: impl FnOnce(&Change) -> Option<Change>,
    ) -> Result<()> {
        self.update_change_locked(id, update)
            .instrument(instance_span(id, "update_change"))
            .await
    }

    async fn update_change_locked(
        &self,
        id: &InstanceId,
        update: impl FnOnce(&Change) -> Option<Change>,
    ) -> Result<()> {
        let locked = self.applications.lock(&id.application()).await?;
        let application = locked.application().clone();
        let current = &application.require(id.instance())?.change;
        let Some(change) = update(current) else {
            return Ok(());
        };
        let status = self.deployment_status(&application).await?;
        let instance = with_remaining_change(&status, id.instance(), &change)?;
        info!(instance = %id, change = %instance.change, "Updated change");
        locked.store(application.with_instance(instance)).await
    }
}

/// Whether any instance has a change to roll out, or an outstanding change.
fn has_changes(status: &DeploymentStatus) -> Result<bool> {
    for instance in status.application().instances.values() {
        if instance.change.has_targets() {
            return Ok(true);
        }
    }
    for name in status.application().deployment_spec.instance_names() {
        if status.outstanding_change(&name)?.has_targets() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether the instance should start rolling out the given revision now.
fn accept_new_revision(status: &DeploymentStatus, instance: &InstanceName, revision: RevisionId) -> bool {
    let Some(spec) = status.application().deployment_spec.instance(instance) else {
        return false;
    };
    // A new revision may fix failures of an earlier one.
    if status.has_failures_before(&revision) {
        return true;
    }
    let changing_revision = status
        .application()
        .instance(instance)
        .is_some_and(|instance| instance.change.revision.is_some());
    !changing_revision || spec.revision_policy != RevisionPolicy::Separate
}

/// The instance with the given change, less any part with no jobs left to run. A revision with
/// nothing left to run is recorded as the latest deployed.
fn with_remaining_change(
    status: &DeploymentStatus,
    name: &InstanceName,
    change: &Change,
) -> Result<Instance> {
    let mut instance = status.application().require(name)?.clone();
    let mut remaining = change.clone();
    if status
        .jobs_to_run_for(&[(name.clone(), change.without_revision())])?
        .is_empty()
    {
        remaining = remaining.without_platform();
    }
    if status
        .jobs_to_run_for(&[(name.clone(), change.without_platform())])?
        .is_empty()
    {
        remaining = remaining.without_revision();
        if let Some(revision) = change.revision {
            instance = instance.with_latest_deployed(revision);
        }
    }
    Ok(instance.with_change(remaining))
}
