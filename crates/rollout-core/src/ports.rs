//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduling core and the collaborators
//! it drives: storage and locking, the step runner, health checks, and time.

use crate::application::Application;
use crate::change::Versions;
use crate::ids::*;
use crate::job::{JobType, ZoneId};
use crate::run::{JobStatus, Run};
use crate::version::Version;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storage of applications, with exclusive per-application locks.
#[async_trait]
pub trait ApplicationStore: Send + Sync {
    /// Ids of all stored applications.
    async fn list(&self) -> Result<Vec<ApplicationId>>;

    /// Read an application, without locking it.
    async fn get(&self, id: &ApplicationId) -> Result<Option<Application>>;

    /// Lock an application for a read-modify-write.
    ///
    /// Fails with `ApplicationNotFound` if there is no such application, and with `Lock`
    /// if the lock could not be acquired in time.
    async fn lock(&self, id: &ApplicationId) -> Result<Box<dyn LockedApplication>>;
}

/// An application snapshot, held under its lock until the guard is dropped or stored.
#[async_trait]
pub trait LockedApplication: Send {
    fn application(&self) -> &Application;

    /// Write the given application, then release the lock.
    async fn store(self: Box<Self>, application: Application) -> Result<()>;
}

/// Run history, and the step runner which executes runs.
#[async_trait]
pub trait JobController: Send + Sync {
    /// Run history of every job of the application which has ever run.
    async fn job_statuses(&self, application: &ApplicationId) -> Result<Vec<JobStatus>>;

    /// Run history of a single job; empty if it never ran.
    async fn job_status(&self, job: &JobId) -> Result<JobStatus>;

    /// Runs of the instance which have not yet ended.
    async fn active(&self, instance: &InstanceId) -> Result<Vec<Run>>;

    /// Start a new run of the given job, with the given versions.
    async fn start(
        &self,
        instance: &InstanceId,
        job_type: &JobType,
        versions: &Versions,
        is_retry: bool,
    ) -> Result<RunId>;

    /// Ask the step runner to stop the given run. Stopping an already ended run does nothing.
    async fn abort(&self, run: &RunId, reason: &str) -> Result<()>;
}

/// A request to run a job again, once its run with a lower number has ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetriggerEntry {
    pub job: JobId,
    pub required_run: u64,
}

impl RetriggerEntry {
    pub fn new(job: JobId, required_run: u64) -> Self {
        Self { job, required_run }
    }
}

/// A small, shared, persisted list of retrigger requests.
#[async_trait]
pub trait RetriggerQueue: Send + Sync {
    async fn lock(&self) -> Result<Box<dyn LockedRetriggerQueue>>;
}

#[async_trait]
pub trait LockedRetriggerQueue: Send {
    fn entries(&self) -> &[RetriggerEntry];

    /// Replace all entries, then release the lock.
    async fn write(self: Box<Self>, entries: Vec<RetriggerEntry>) -> Result<()>;
}

/// Health of deployments.
#[async_trait]
pub trait HealthMonitor: Send + Sync {
    async fn is_healthy(&self, instance: &InstanceId, zone: &ZoneId) -> Result<bool>;
}

/// The platform version the system currently runs, used when nothing else determines one.
#[async_trait]
pub trait SystemVersionSource: Send + Sync {
    async fn system_version(&self) -> Result<Version>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
