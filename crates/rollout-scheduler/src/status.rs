//! Readiness and completion of the steps of an application's deployment spec.
//!
//! A [`DeploymentStatus`] is a snapshot of an application, the run history of its jobs,
//! the system version and the current time. Everything computed from it is a pure function
//! of that snapshot, so it is rebuilt for every evaluation, and never cached.

use crate::config::SchedulerConfig;
use crate::graph::{StepGraph, StepKind, StepNode};
use chrono::{DateTime, Duration, DurationRound, Utc};
use petgraph::graph::NodeIndex;
use rollout_core::application::{Application, Deployment};
use rollout_core::change::{Change, Versions};
use rollout_core::job::JobType;
use rollout_core::run::{JobStatus, Run};
use rollout_core::spec::InstanceSpec;
use rollout_core::version::{RevisionId, Version};
use rollout_core::{InstanceId, InstanceName, JobId, Result};
use std::collections::BTreeMap;

/// Seconds after `now` reported for a step blocked past the search horizon.
const FAR_FUTURE_SECS: i64 = 1 << 30;

/// Deployment status of an application: its step graph, and the run history of its jobs.
#[derive(Debug)]
pub struct DeploymentStatus {
    application: Application,
    jobs: BTreeMap<JobId, JobStatus>,
    system_version: Version,
    now: DateTime<Utc>,
    config: SchedulerConfig,
    graph: StepGraph,
}

impl DeploymentStatus {
    pub fn new(
        application: Application,
        job_statuses: Vec<JobStatus>,
        system_version: Version,
        now: DateTime<Utc>,
        config: &SchedulerConfig,
    ) -> Result<Self> {
        let graph = StepGraph::build(&application)?;
        let mut jobs: BTreeMap<JobId, JobStatus> = job_statuses
            .into_iter()
            .map(|status| (status.id.clone(), status))
            .collect();
        for (job, _) in graph.job_steps() {
            jobs.entry(job.clone())
                .or_insert_with(|| JobStatus::empty(job.clone()));
        }
        Ok(Self {
            application,
            jobs,
            system_version,
            now,
            config: config.clone(),
            graph,
        })
    }

    pub fn application(&self) -> &Application {
        &self.application
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn system_version(&self) -> &Version {
        &self.system_version
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    /// Run history of all jobs of the application, including jobs in the spec which never ran.
    pub fn jobs(&self) -> &BTreeMap<JobId, JobStatus> {
        &self.jobs
    }

    pub fn job(&self, job: &JobId) -> Option<&JobStatus> {
        self.jobs.get(job)
    }

    /// Run history of the jobs of the given instance.
    pub fn instance_jobs(&self, instance: &InstanceName) -> impl Iterator<Item = &JobStatus> + '_ {
        let id = self.application.id.instance(instance.clone());
        self.jobs.values().filter(move |job| job.id.instance == id)
    }

    /// The step of the given job, if the spec has one.
    pub fn step(&self, job: &JobId) -> Option<StepStatus<'_>> {
        self.graph.job_step(job).map(|index| self.step_at(index))
    }

    pub(crate) fn step_at(&self, index: NodeIndex) -> StepStatus<'_> {
        StepStatus {
            status: self,
            index,
        }
    }

    /// Job steps, in declaration order.
    pub fn job_steps(&self) -> impl Iterator<Item = (&JobId, StepStatus<'_>)> + '_ {
        self.graph
            .job_steps()
            .map(|(job, index)| (job, self.step_at(index)))
    }

    pub fn instance_step(&self, instance: &InstanceName) -> Option<StepStatus<'_>> {
        self.graph
            .instance_step(instance)
            .map(|index| self.step_at(index))
    }

    /// Instance steps, in declaration order.
    pub fn instance_steps(&self) -> Vec<StepStatus<'_>> {
        self.graph
            .all_steps()
            .iter()
            .map(|index| self.step_at(*index))
            .filter(|step| matches!(step.node().kind, StepKind::Instance(_)))
            .collect()
    }

    /// Declared steps, and the system and staging tests which run when none are declared,
    /// in declaration order.
    pub fn all_steps(&self) -> Vec<StepStatus<'_>> {
        if self.graph.is_empty() {
            return vec![];
        }
        let first_tests: Vec<JobId> = [JobType::SystemTest, JobType::StagingTest]
            .iter()
            .filter_map(|test_type| self.first_declared_or_else_implicit_test(test_type))
            .collect();
        self.graph
            .all_steps()
            .iter()
            .map(|index| self.step_at(*index))
            .filter(|step| {
                step.is_declared() || step.job().is_some_and(|job| first_tests.contains(job))
            })
            .collect()
    }

    /// The current deployment in the zone of the given job, if any.
    pub fn deployment_for(&self, job: &JobId) -> Option<&Deployment> {
        self.application
            .instance(&job.instance.instance)
            .and_then(|instance| instance.deployment(&job.job_type.zone()))
    }

    /// Earliest instant the given job was triggered with the given versions, or both system and
    /// staging tests succeeded on them.
    pub fn verified_at(&self, job: &JobId, versions: &Versions) -> Option<DateTime<Utc>> {
        let triggered_at = self
            .jobs
            .get(job)
            .and_then(|status| status.runs().iter().find(|run| run.versions == *versions))
            .map(|run| run.start);
        let system_tested_at = self.tested_at(&job.instance, &JobType::SystemTest, versions);
        let staging_tested_at = self.tested_at(&job.instance, &JobType::StagingTest, versions);
        let (Some(system), Some(staging)) = (system_tested_at, staging_tested_at) else {
            return triggered_at;
        };
        let tested_at = system.max(staging);
        match triggered_at {
            Some(triggered) if triggered < tested_at => Some(triggered),
            _ => Some(tested_at),
        }
    }

    /// Earliest start of a successful test of the given type on the given versions. Only the
    /// instance's own test counts, if it declares one.
    fn tested_at(
        &self,
        instance: &InstanceId,
        test_type: &JobType,
        versions: &Versions,
    ) -> Option<DateTime<Utc>> {
        let declared = self.declared_test(instance, test_type).is_some();
        self.jobs
            .values()
            .filter(|job| job.id.job_type == *test_type)
            .filter(|job| !declared || job.id.instance == *instance)
            .flat_map(|job| job.runs().iter())
            .filter(|run| run.has_succeeded() && run.versions.targets_match(versions))
            .map(|run| run.start)
            .min()
    }

    /// Whether the given job has succeeded on the given versions.
    pub(crate) fn has_success_on(&self, job: &JobId, versions: &Versions) -> bool {
        self.jobs
            .get(job)
            .is_some_and(|status| has_success_on(status.runs(), versions))
    }

    /// Whether any job of the given type has succeeded on the given versions.
    pub(crate) fn has_success_of_type_on(&self, job_type: &JobType, versions: &Versions) -> bool {
        self.jobs
            .values()
            .filter(|job| job.id.job_type == *job_type)
            .any(|job| has_success_on(job.runs(), versions))
    }

    /// Whether any job is failing hard.
    pub fn has_failures(&self) -> bool {
        self.jobs.values().any(JobStatus::is_failing_hard)
    }

    /// Whether any job was last triggered with a revision older than the given one, and is failing hard.
    pub fn has_failures_before(&self, revision: &RevisionId) -> bool {
        self.jobs
            .values()
            .any(|job| job.is_failing_hard_before(revision))
    }

    /// Whether any job on a path from `dependency` to `dependent` is failing hard.
    pub(crate) fn has_failures_between(&self, dependency: NodeIndex, dependent: NodeIndex) -> bool {
        self.graph
            .steps_between(dependency, dependent)
            .into_iter()
            .filter_map(|index| self.graph.node(index).job.as_ref())
            .filter_map(|job| self.jobs.get(job))
            .any(JobStatus::is_failing_hard)
    }

    /// The given test job of the instance, if the instance declares it.
    pub fn declared_test(&self, instance: &InstanceId, test_type: &JobType) -> Option<JobId> {
        let job = JobId::new(instance.clone(), test_type.clone());
        self.graph
            .job_step(&job)
            .filter(|index| self.graph.node(*index).declared)
            .map(|_| job)
    }

    /// The first instance's declaration of the given test, or the first instance's implicit test.
    pub fn first_declared_or_else_implicit_test(&self, test_type: &JobType) -> Option<JobId> {
        let candidates: Vec<JobId> = self
            .application
            .deployment_spec
            .instance_names()
            .into_iter()
            .map(|name| JobId::new(self.application.id.instance(name), test_type.clone()))
            .filter(|job| self.graph.job_step(job).is_some())
            .collect();
        candidates
            .iter()
            .find(|job| self.declared_test(&job.instance, test_type).is_some())
            .or_else(|| candidates.first())
            .cloned()
    }
}

/// Whether any run succeeded on the target versions, from the same sources where both have them.
fn has_success_on(runs: &[Run], versions: &Versions) -> bool {
    runs.iter().any(|run| {
        run.has_succeeded()
            && run.versions.targets_match(versions)
            && run.versions.sources_match_if_present(versions)
    })
}

/// Whether the run targets each part present in the change.
fn targets_change(run: &Run, change: &Change) -> bool {
    change
        .platform
        .as_ref()
        .is_none_or(|platform| *platform == run.versions.target_platform)
        && change
            .revision
            .is_none_or(|revision| revision == run.versions.target_revision)
}

/// One step of the deployment spec, evaluated against a [`DeploymentStatus`].
///
/// Completion may be computed for a dependent job: when that job is the step's own job, the
/// strict criterion applies, which tells whether the job itself should run again.
#[derive(Debug, Clone, Copy)]
pub struct StepStatus<'a> {
    status: &'a DeploymentStatus,
    index: NodeIndex,
}

impl<'a> StepStatus<'a> {
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn node(&self) -> &'a StepNode {
        self.status.graph.node(self.index)
    }

    pub fn job(&self) -> Option<&'a JobId> {
        self.node().job.as_ref()
    }

    pub fn instance(&self) -> &'a InstanceName {
        &self.node().instance
    }

    pub fn is_declared(&self) -> bool {
        self.node().declared
    }

    pub fn dependencies(&self) -> Vec<StepStatus<'a>> {
        self.status
            .graph
            .dependencies(self.index)
            .map(|index| self.status.step_at(index))
            .collect()
    }

    /// When this step is, or was, complete on the given change.
    pub fn completed_at(&self, change: &Change) -> Option<DateTime<Utc>> {
        self.completed_at_for(change, None)
    }

    /// When this step is ready to run the given change.
    pub fn ready_at(&self, change: &Change) -> Option<DateTime<Utc>> {
        self.ready_at_for(change, None)
    }

    pub(crate) fn ready_at_for(
        &self,
        change: &Change,
        dependent: Option<&JobId>,
    ) -> Option<DateTime<Utc>> {
        let ready_at = self
            .dependencies_completed_at(change, dependent)
            .map(|ready| {
                [
                    self.blocked_until(change),
                    self.paused_until(),
                    self.cooling_down_until(change),
                ]
                .into_iter()
                .flatten()
                .fold(ready, DateTime::max)
            })?;

        if self.node().kind != StepKind::ProductionDeployment {
            return Some(ready_at);
        }
        let job = self.job()?;
        let versions = Versions::from(
            change,
            &self.status.application,
            self.status.deployment_for(job),
            &self.status.system_version,
        );
        let verified_at = self.status.verified_at(job, &versions)?;
        Some(ready_at.max(verified_at))
    }

    /// When all dependencies completed the given change; the epoch if there are none.
    pub(crate) fn dependencies_completed_at(
        &self,
        change: &Change,
        dependent: Option<&JobId>,
    ) -> Option<DateTime<Utc>> {
        let mut latest = DateTime::UNIX_EPOCH;
        for dependency in self.dependencies() {
            latest = latest.max(dependency.completed_at_for(change, dependent)?);
        }
        Some(latest)
    }

    pub(crate) fn completed_at_for(
        &self,
        change: &Change,
        dependent: Option<&JobId>,
    ) -> Option<DateTime<Utc>> {
        match &self.node().kind {
            StepKind::Instance(spec) => self.instance_completed_at(spec, change, dependent),
            StepKind::Delay(delay) => self
                .ready_at_for(change, dependent)
                .map(|ready| ready + *delay),
            StepKind::TestDeployment => self.test_completed_at(change, dependent),
            StepKind::ProductionTest => self.production_test_completed_at(change, dependent),
            StepKind::ProductionDeployment => self.deployment_completed_at(change, dependent),
        }
    }

    /// Complete when its dependencies are, if the instance has adopted every part of the change,
    /// or if the instance has no production steps.
    fn instance_completed_at(
        &self,
        spec: &InstanceSpec,
        change: &Change,
        dependent: Option<&JobId>,
    ) -> Option<DateTime<Utc>> {
        let current = &self.status.application.instance(&spec.name)?.change;
        let adopted = change
            .platform
            .as_ref()
            .is_none_or(|platform| current.platform.as_ref() == Some(platform))
            && change
                .revision
                .is_none_or(|revision| current.revision == Some(revision));
        if adopted || !spec.concerns_production() {
            self.dependencies_completed_at(change, dependent)
        } else {
            None
        }
    }

    /// Latest success of a system or staging test on the versions the change would have in the
    /// dependent's zone.
    fn test_completed_at(
        &self,
        change: &Change,
        dependent: Option<&JobId>,
    ) -> Option<DateTime<Utc>> {
        let job = self.status.jobs.get(self.job()?)?;
        let versions = Versions::from(
            change,
            &self.status.application,
            dependent.and_then(|dependent| self.status.deployment_for(dependent)),
            &self.status.system_version,
        );
        job.runs()
            .iter()
            .filter(|run| run.has_succeeded() && versions.targets_match(&run.versions))
            .filter_map(|run| run.end)
            .max()
    }

    fn production_test_completed_at(
        &self,
        change: &Change,
        dependent: Option<&JobId>,
    ) -> Option<DateTime<Utc>> {
        let id = self.job()?;
        let job = self.status.jobs.get(id)?;
        let versions = Versions::from(
            change,
            &self.status.application,
            self.status.deployment_for(id),
            &self.status.system_version,
        );

        if dependent != Some(id) {
            return job
                .runs()
                .iter()
                .find(|run| run.has_succeeded() && versions.targets_match(&run.versions))
                .and_then(|run| run.end);
        }

        // Strictly, only a success after the latest deployment in the same zone counts.
        let run = job
            .last_success()
            .filter(|run| versions.targets_match(&run.versions))?;
        let deployment = JobId::new(id.instance.clone(), JobType::deployment_to(&id.job_type.zone()));
        let deployed_before = self
            .status
            .jobs
            .get(&deployment)
            .and_then(JobStatus::last_completed)
            .and_then(|deployed| deployed.end)
            .is_some_and(|end| end <= run.start);
        if deployed_before { run.end } else { None }
    }

    fn deployment_completed_at(
        &self,
        change: &Change,
        dependent: Option<&JobId>,
    ) -> Option<DateTime<Utc>> {
        let id = self.job()?;
        let job = self.status.jobs.get(id)?;
        let existing = self.status.deployment_for(id);

        // Pinned platforms are complete only when actually deployed.
        if change.is_pinned()
            && change.platform.is_some()
            && existing.map(|deployment| &deployment.platform) != change.platform.as_ref()
        {
            return None;
        }

        // The job itself should run again for a revision not deployed, but other dependents need not wait.
        if change.revision.is_some()
            && existing.map(|deployment| deployment.revision) != change.revision
            && dependent == Some(id)
        {
            return None;
        }

        // Complete if the deployment is newer than the change, and the instance is not forcing a downgrade.
        let full_change = &self.status.application.instance(self.instance())?.change;
        if let Some(deployment) = existing {
            let upgrades = change.upgrades_platform(&deployment.platform)
                || change.upgrades_revision(&deployment.revision);
            let downgrades = full_change.downgrades_platform(&deployment.platform)
                || full_change.downgrades_revision(&deployment.revision);
            if !upgrades && downgrades {
                return job.last_completed().and_then(|run| run.end);
            }
        }

        let candidates: Vec<&Run> = if dependent == Some(id) {
            job.last_success().into_iter().collect()
        } else {
            job.runs().iter().filter(|run| run.has_succeeded()).collect()
        };
        candidates
            .into_iter()
            .filter(|run| targets_change(run, change))
            .filter_map(|run| run.end)
            .min()
    }

    /// Until when the change is blocked from starting in this instance by its change blockers.
    ///
    /// Looks for the end of the block one step at a time, up to the configured horizon; if the
    /// change is still blocked there, the step is blocked until far into the future.
    pub fn blocked_until(&self, change: &Change) -> Option<DateTime<Utc>> {
        let StepKind::Instance(spec) = &self.node().kind else {
            return None;
        };
        let now = self.status.now;
        let config = &self.status.config;
        let horizon = now + config.block_window_horizon();
        let step = config.block_window_step();

        let mut current = now;
        while current < horizon {
            let mut blocked = false;
            for blocker in &spec.change_blockers {
                while blocker.window.includes(current)
                    && current < horizon
                    && (change.platform.is_some() && blocker.blocks_platform()
                        || change.revision.is_some() && blocker.blocks_revisions())
                {
                    blocked = true;
                    current = next_step(current, step);
                }
            }
            if !blocked {
                return (current != now).then_some(current);
            }
        }
        Some(now + Duration::seconds(FAR_FUTURE_SECS))
    }

    /// Until when this job is paused by an operator.
    pub fn paused_until(&self) -> Option<DateTime<Utc>> {
        let job = self.job()?;
        self.status
            .application
            .instance(self.instance())?
            .job_pauses
            .get(&job.job_type)
            .copied()
    }

    /// Until when this job is cooling down after repeated failures on the given change.
    pub fn cooling_down_until(&self, change: &Change) -> Option<DateTime<Utc>> {
        let job = self.status.jobs.get(self.job()?)?;
        job.last_triggered()?;
        let last_completed = job.last_completed()?;
        let first_failing = job.first_failing()?;

        let last_versions = &last_completed.versions;
        if change
            .platform
            .as_ref()
            .is_some_and(|platform| *platform != last_versions.target_platform)
        {
            return None;
        }
        if change
            .revision
            .is_some_and(|revision| revision != last_versions.target_revision)
        {
            return None;
        }
        if job.id.job_type.environment().is_test() && job.is_out_of_capacity() {
            return None;
        }

        let first_end = first_failing.end?;
        let last_end = last_completed.end?;
        if first_end == last_end {
            return Some(last_end);
        }
        let until = last_end + self.status.config.cooldown_base() + (last_end - first_end) / 2;
        (until > self.status.now).then_some(until)
    }
}

/// The start of the step after the one containing `instant`.
fn next_step(instant: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let next = instant + step;
    next.duration_trunc(step).unwrap_or(next)
}
