//! The jobs which must run for the changes of an application to complete.

use crate::graph::StepKind;
use crate::status::DeploymentStatus;
use chrono::{DateTime, Utc};
use rollout_core::application::Deployment;
use rollout_core::change::{Change, Versions};
use rollout_core::job::JobType;
use rollout_core::version::RevisionId;
use rollout_core::{InstanceName, JobId, Result};

/// A run a job needs, with the versions to run, and when it may start. `None` if not yet known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedJob {
    pub versions: Versions,
    pub ready_at: Option<DateTime<Utc>>,
    pub change: Change,
}

impl PlannedJob {
    pub fn new(versions: Versions, ready_at: Option<DateTime<Utc>>, change: Change) -> Self {
        Self {
            versions,
            ready_at,
            change,
        }
    }
}

/// Jobs to run, each with its planned runs in order, iterated in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobsToRun {
    entries: Vec<(JobId, Vec<PlannedJob>)>,
}

impl JobsToRun {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, job: &JobId) -> Option<&[PlannedJob]> {
        self.entries
            .iter()
            .find(|(id, _)| id == job)
            .map(|(_, planned)| planned.as_slice())
    }

    pub fn contains(&self, job: &JobId) -> bool {
        self.get(job).is_some()
    }

    /// Set the planned runs of the job, keeping its position if already present.
    pub fn insert(&mut self, job: JobId, planned: Vec<PlannedJob>) {
        match self.entries.iter_mut().find(|(id, _)| *id == job) {
            Some((_, existing)) => *existing = planned,
            None => self.entries.push((job, planned)),
        }
    }

    /// Add planned runs to the job, skipping those it already has.
    pub fn merge(&mut self, job: JobId, planned: Vec<PlannedJob>) {
        match self.entries.iter_mut().find(|(id, _)| *id == job) {
            Some((_, existing)) => {
                for run in planned {
                    if !existing.contains(&run) {
                        existing.push(run);
                    }
                }
            }
            None => self.entries.push((job, planned)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&JobId, &[PlannedJob])> + '_ {
        self.entries
            .iter()
            .map(|(job, planned)| (job, planned.as_slice()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &JobId> + '_ {
        self.entries.iter().map(|(job, _)| job)
    }
}

impl IntoIterator for JobsToRun {
    type Item = (JobId, Vec<PlannedJob>);
    type IntoIter = std::vec::IntoIter<(JobId, Vec<PlannedJob>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// The deployment, as if the given change had been deployed.
fn with_change(deployment: Deployment, change: &Change) -> Deployment {
    Deployment {
        platform: change.platform.clone().unwrap_or(deployment.platform),
        revision: change.revision.unwrap_or(deployment.revision),
        ..deployment
    }
}

impl DeploymentStatus {
    /// The jobs which must run for the current changes of all instances to complete, and the
    /// test jobs any outstanding change will need later.
    pub fn jobs_to_run(&self) -> Result<JobsToRun> {
        let names = self.application().deployment_spec.instance_names();
        let mut changes = Vec::with_capacity(names.len());
        for name in &names {
            let change = self.application().require(name)?.change.clone();
            changes.push((name.clone(), change));
        }
        let mut jobs = self.jobs_to_run_with(&changes, false)?;

        let mut eager = Vec::with_capacity(names.len());
        for (name, current) in changes {
            let outstanding = self.outstanding_change(&name)?.on_top_of(&current);
            eager.push((name, outstanding));
        }
        for (job, planned) in self.jobs_to_run_with(&eager, true)? {
            if !job.job_type.is_production() {
                jobs.merge(job, planned);
            }
        }
        Ok(jobs)
    }

    /// The jobs which must run for the given changes to complete.
    pub fn jobs_to_run_for(&self, changes: &[(InstanceName, Change)]) -> Result<JobsToRun> {
        self.jobs_to_run_with(changes, false)
    }

    /// With `eager_tests`, production jobs assume any upgrade in progress succeeds, so tests for
    /// the revision part can run ahead of it.
    fn jobs_to_run_with(
        &self,
        changes: &[(InstanceName, Change)],
        eager_tests: bool,
    ) -> Result<JobsToRun> {
        let mut production = JobsToRun::new();
        for (instance, change) in changes {
            for (job, planned) in self.production_jobs(instance, change, eager_tests)? {
                production.insert(job, planned);
            }
        }

        let mut jobs = self.test_jobs(&production);
        for (job, planned) in production {
            jobs.insert(job, planned);
        }

        // Declared tests with nothing to verify still run once for their instance's change.
        let first_production_deployment = self.graph().job_steps().map(|(job, _)| job).find(|job| {
            job.job_type.is_production()
                && job.job_type.is_deployment()
                && self.deployment_for(job).is_some()
        });
        for (job, step) in self.job_steps() {
            if !step.is_declared() || jobs.contains(job) {
                continue;
            }
            let Some((_, change)) = changes
                .iter()
                .find(|(instance, _)| instance == job.instance.instance())
            else {
                continue;
            };
            if !change.has_targets() {
                continue;
            }
            let versions = Versions::from(
                change,
                self.application(),
                first_production_deployment.and_then(|first| self.deployment_for(first)),
                self.system_version(),
            );
            if step
                .completed_at_for(change, first_production_deployment)
                .is_none()
            {
                let planned = PlannedJob::new(versions, step.ready_at(change), change.clone());
                jobs.merge(job.clone(), vec![planned]);
            }
        }
        Ok(jobs)
    }

    fn production_jobs(
        &self,
        instance: &InstanceName,
        change: &Change,
        assume_upgrades_succeed: bool,
    ) -> Result<JobsToRun> {
        let mut jobs = JobsToRun::new();
        if !change.has_targets() {
            return Ok(jobs);
        }
        for (job, step) in self.job_steps() {
            if job.instance.instance() != instance || !job.job_type.is_production() {
                continue;
            }
            let changes = self.changes(job, change)?;
            if changes.is_empty() {
                continue;
            }

            let mut deployment = self.deployment_for(job).cloned().map(|existing| {
                if assume_upgrades_succeed {
                    with_change(existing, &change.without_revision())
                } else {
                    existing
                }
            });
            let mut planned = Vec::with_capacity(changes.len());
            for partial in changes {
                let versions = Versions::from(
                    &partial,
                    self.application(),
                    deployment.as_ref(),
                    self.system_version(),
                );
                let ready_at = step.ready_at_for(&partial, Some(job));
                // The first part is deployed before the second.
                deployment = deployment.map(|existing| with_change(existing, &partial));
                planned.push(PlannedJob::new(versions, ready_at, partial));
            }
            jobs.insert(job.clone(), planned);
        }
        Ok(jobs)
    }

    /// The system and staging tests which must succeed before the given production deployments.
    pub fn test_jobs(&self, jobs: &JobsToRun) -> JobsToRun {
        let mut tests = JobsToRun::new();
        let is_production_deployment =
            |job: &JobId| job.job_type.is_production() && job.job_type.is_deployment();
        let planned_test = |test: &JobId, production: &PlannedJob| {
            let ready_at = self
                .step(test)
                .and_then(|step| step.ready_at(&production.change));
            PlannedJob::new(production.versions.clone(), ready_at, production.change.clone())
        };

        for test_type in [JobType::SystemTest, JobType::StagingTest] {
            // An instance's own tests, if it declares them.
            for (job, planned) in jobs.iter() {
                if !is_production_deployment(job) {
                    continue;
                }
                let Some(test) = self.declared_test(&job.instance, &test_type) else {
                    continue;
                };
                for production in planned {
                    if !self.has_success_on(&test, &production.versions) {
                        tests.merge(test.clone(), vec![planned_test(&test, production)]);
                    }
                }
            }

            // Otherwise, any test of the right type will do.
            for (job, planned) in jobs.iter() {
                if !is_production_deployment(job) {
                    continue;
                }
                for production in planned {
                    let covered = tests.iter().any(|(test, planned)| {
                        test.job_type == test_type
                            && planned.iter().any(|run| run.versions == production.versions)
                    });
                    if covered || self.has_success_of_type_on(&test_type, &production.versions) {
                        continue;
                    }
                    if let Some(test) = self.first_declared_or_else_implicit_test(&test_type) {
                        tests.merge(test.clone(), vec![planned_test(&test, production)]);
                    }
                }
            }
        }
        tests
    }

    /// The latest submission, as a change to the given instance, if it upgrades the instance
    /// and has not yet started rolling out to it. Empty otherwise.
    pub fn outstanding_change(&self, instance: &InstanceName) -> Result<Change> {
        let Some(next) = self.next_revision(instance) else {
            return Ok(Change::empty());
        };
        let change = Change::of_revision(next);
        let current = self.application().require(instance)?.change.revision;
        if current.is_some_and(|current| !change.upgrades_revision(&current)) {
            return Ok(Change::empty());
        }
        if self
            .jobs_to_run_for(&[(instance.clone(), change.clone())])?
            .is_empty()
        {
            return Ok(Change::empty());
        }
        Ok(change)
    }

    /// The next revision to roll out to the instance: the oldest revision completed by all
    /// upstream instances, or the latest submission if there are none.
    pub(crate) fn next_revision(&self, instance: &InstanceName) -> Option<RevisionId> {
        let upstream = self
            .graph()
            .instance_step(instance)
            .map(|index| self.graph().all_dependencies(index))
            .unwrap_or_default();
        upstream
            .into_iter()
            .filter_map(|index| match &self.graph().node(index).kind {
                StepKind::Instance(spec) => self
                    .application()
                    .instance(&spec.name)
                    .and_then(|instance| instance.latest_deployed),
                _ => None,
            })
            .min()
            .or(self.application().latest_revision)
    }
}
