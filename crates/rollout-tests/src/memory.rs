//! In-memory implementations of the scheduler's ports.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rollout_core::application::Application;
use rollout_core::change::Versions;
use rollout_core::job::{JobType, ZoneId};
use rollout_core::ports::{
    ApplicationStore, Clock, HealthMonitor, JobController, LockedApplication, LockedRetriggerQueue,
    RetriggerEntry, RetriggerQueue, SystemVersionSource,
};
use rollout_core::run::{JobStatus, Run, RunStatus};
use rollout_core::version::Version;
use rollout_core::{ApplicationId, Error, InstanceId, JobId, Result, RunId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A clock which only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *locked(&self.now) += duration;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *locked(&self.now) = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *locked(&self.now)
    }
}

/// Applications in memory, each with its own async lock.
#[derive(Default)]
pub struct InMemoryApplicationStore {
    applications: Arc<Mutex<BTreeMap<ApplicationId, Application>>>,
    locks: Mutex<HashMap<ApplicationId, Arc<AsyncMutex<()>>>>,
}

impl InMemoryApplicationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the application, without taking its lock.
    pub fn put(&self, application: Application) {
        locked(&self.applications).insert(application.id.clone(), application);
    }

    pub fn application(&self, id: &ApplicationId) -> Option<Application> {
        locked(&self.applications).get(id).cloned()
    }

    fn lock_for(&self, id: &ApplicationId) -> Arc<AsyncMutex<()>> {
        locked(&self.locks).entry(id.clone()).or_default().clone()
    }
}

#[async_trait]
impl ApplicationStore for InMemoryApplicationStore {
    async fn list(&self) -> Result<Vec<ApplicationId>> {
        Ok(locked(&self.applications).keys().cloned().collect())
    }

    async fn get(&self, id: &ApplicationId) -> Result<Option<Application>> {
        Ok(self.application(id))
    }

    async fn lock(&self, id: &ApplicationId) -> Result<Box<dyn LockedApplication>> {
        let guard = self.lock_for(id).lock_owned().await;
        let application = self
            .application(id)
            .ok_or_else(|| Error::ApplicationNotFound(id.to_string()))?;
        Ok(Box::new(InMemoryLockedApplication {
            _guard: guard,
            applications: self.applications.clone(),
            application,
        }))
    }
}

struct InMemoryLockedApplication {
    _guard: OwnedMutexGuard<()>,
    applications: Arc<Mutex<BTreeMap<ApplicationId, Application>>>,
    application: Application,
}

#[async_trait]
impl LockedApplication for InMemoryLockedApplication {
    fn application(&self) -> &Application {
        &self.application
    }

    async fn store(self: Box<Self>, application: Application) -> Result<()> {
        locked(&self.applications).insert(application.id.clone(), application);
        Ok(())
    }
}

/// Run history in memory. Started runs stay running until finished or aborted.
pub struct InMemoryJobController {
    runs: Mutex<BTreeMap<JobId, Vec<Run>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobController {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            runs: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    /// End the last run of the job with the given status, and return it.
    pub fn finish(&self, job: &JobId, status: RunStatus) -> Result<Run> {
        let mut runs = locked(&self.runs);
        let run = runs
            .get_mut(job)
            .and_then(|runs| runs.last_mut())
            .filter(|run| !run.has_ended())
            .ok_or_else(|| Error::InvalidArgument(format!("{job} is not running")))?;
        *run = run.clone().finished(status, self.clock.now());
        Ok(run.clone())
    }

    pub fn runs(&self, job: &JobId) -> Vec<Run> {
        locked(&self.runs).get(job).cloned().unwrap_or_default()
    }

    pub fn last_run(&self, job: &JobId) -> Option<Run> {
        locked(&self.runs).get(job).and_then(|runs| runs.last().cloned())
    }

    /// Jobs with a run which has not ended.
    pub fn running(&self) -> Vec<JobId> {
        locked(&self.runs)
            .iter()
            .filter(|(_, runs)| runs.last().is_some_and(|run| !run.has_ended()))
            .map(|(job, _)| job.clone())
            .collect()
    }
}

#[async_trait]
impl JobController for InMemoryJobController {
    async fn job_statuses(&self, application: &ApplicationId) -> Result<Vec<JobStatus>> {
        Ok(locked(&self.runs)
            .iter()
            .filter(|(job, _)| job.application() == *application)
            .map(|(job, runs)| JobStatus::new(job.clone(), runs.clone()))
            .collect())
    }

    async fn job_status(&self, job: &JobId) -> Result<JobStatus> {
        Ok(JobStatus::new(job.clone(), self.runs(job)))
    }

    async fn active(&self, instance: &InstanceId) -> Result<Vec<Run>> {
        Ok(locked(&self.runs)
            .iter()
            .filter(|(job, _)| job.instance == *instance)
            .filter_map(|(_, runs)| runs.last())
            .filter(|run| !run.has_ended())
            .cloned()
            .collect())
    }

    async fn start(
        &self,
        instance: &InstanceId,
        job_type: &JobType,
        versions: &Versions,
        is_retry: bool,
    ) -> Result<RunId> {
        let job = JobId::new(instance.clone(), job_type.clone());
        let mut runs = locked(&self.runs);
        let history = runs.entry(job.clone()).or_default();
        if history.last().is_some_and(|run| !run.has_ended()) {
            return Err(Error::StepRunner(format!("{job} is already running")));
        }
        let id = RunId::new(job, history.len() as u64 + 1);
        history.push(Run::new(id.clone(), versions.clone(), self.clock.now(), is_retry));
        Ok(id)
    }

    async fn abort(&self, run: &RunId, _reason: &str) -> Result<()> {
        let mut runs = locked(&self.runs);
        if let Some(existing) = runs
            .get_mut(&run.job)
            .and_then(|runs| runs.iter_mut().find(|existing| existing.id == *run))
            .filter(|existing| !existing.has_ended())
        {
            *existing = existing.clone().finished(RunStatus::Aborted, self.clock.now());
        }
        Ok(())
    }
}

/// The retrigger queue, in memory.
#[derive(Default)]
pub struct InMemoryRetriggerQueue {
    entries: Arc<AsyncMutex<Vec<RetriggerEntry>>>,
}

impl InMemoryRetriggerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<RetriggerEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl RetriggerQueue for InMemoryRetriggerQueue {
    async fn lock(&self) -> Result<Box<dyn LockedRetriggerQueue>> {
        Ok(Box::new(InMemoryLockedQueue {
            guard: self.entries.clone().lock_owned().await,
        }))
    }
}

struct InMemoryLockedQueue {
    guard: OwnedMutexGuard<Vec<RetriggerEntry>>,
}

#[async_trait]
impl LockedRetriggerQueue for InMemoryLockedQueue {
    fn entries(&self) -> &[RetriggerEntry] {
        &self.guard
    }

    async fn write(self: Box<Self>, entries: Vec<RetriggerEntry>) -> Result<()> {
        let mut queue = *self;
        *queue.guard = entries;
        Ok(())
    }
}

/// Deployments are healthy unless marked otherwise.
#[derive(Default)]
pub struct InMemoryHealthMonitor {
    unhealthy: Mutex<HashSet<(InstanceId, ZoneId)>>,
}

impl InMemoryHealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, instance: &InstanceId, zone: &ZoneId, healthy: bool) {
        let key = (instance.clone(), zone.clone());
        let mut unhealthy = locked(&self.unhealthy);
        if healthy {
            unhealthy.remove(&key);
        } else {
            unhealthy.insert(key);
        }
    }
}

#[async_trait]
impl HealthMonitor for InMemoryHealthMonitor {
    async fn is_healthy(&self, instance: &InstanceId, zone: &ZoneId) -> Result<bool> {
        Ok(!locked(&self.unhealthy).contains(&(instance.clone(), zone.clone())))
    }
}

/// A settable system version.
pub struct InMemorySystemVersion {
    version: Mutex<Version>,
}

impl InMemorySystemVersion {
    pub fn new(version: Version) -> Self {
        Self {
            version: Mutex::new(version),
        }
    }

    pub fn set(&self, version: Version) {
        *locked(&self.version) = version;
    }
}

#[async_trait]
impl SystemVersionSource for InMemorySystemVersion {
    async fn system_version(&self) -> Result<Version> {
        Ok(locked(&self.version).clone())
    }
}
