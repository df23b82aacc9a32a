//! Job runs and the per-job run history.

use crate::change::Versions;
use crate::ids::{JobId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    DeploymentFailed,
    InstallationFailed,
    TestFailure,
    OutOfCapacity,
    EndpointCertificateTimeout,
    /// Unexpected error, or transient errors which never resolved.
    Error,
    /// Stopped by the scheduler, typically because its versions became outdated.
    Aborted,
    /// Inconclusive; the job should simply run again.
    Reset,
}

impl RunStatus {
    /// Whether the run ended in a way which counts against the job.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            RunStatus::Running | RunStatus::Success | RunStatus::Aborted | RunStatus::Reset
        )
    }

    /// Whether the run is neither aborted nor reset, i.e., counts toward the job's status.
    pub fn is_conclusive(&self) -> bool {
        !matches!(self, RunStatus::Aborted | RunStatus::Reset)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::DeploymentFailed => "deployment_failed",
            RunStatus::InstallationFailed => "installation_failed",
            RunStatus::TestFailure => "test_failure",
            RunStatus::OutOfCapacity => "out_of_capacity",
            RunStatus::EndpointCertificateTimeout => "endpoint_certificate_timeout",
            RunStatus::Error => "error",
            RunStatus::Aborted => "aborted",
            RunStatus::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// One run of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub versions: Versions,
    pub status: RunStatus,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_retry: bool,
}

impl Run {
    pub fn new(id: RunId, versions: Versions, start: DateTime<Utc>, is_retry: bool) -> Self {
        Self {
            id,
            versions,
            status: RunStatus::Running,
            start,
            end: None,
            is_retry,
        }
    }

    /// This run, ended with the given status at the given instant.
    pub fn finished(mut self, status: RunStatus, end: DateTime<Utc>) -> Self {
        self.status = status;
        self.end = Some(end);
        self
    }

    pub fn has_ended(&self) -> bool {
        self.end.is_some()
    }

    pub fn has_succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn has_failed(&self) -> bool {
        self.status.is_failure()
    }
}

/// The run history of one job, ordered by run number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    #[serde(default)]
    pub runs: Vec<Run>,
}

impl JobStatus {
    pub fn new(id: JobId, runs: Vec<Run>) -> Self {
        Self { id, runs }
    }

    pub fn empty(id: JobId) -> Self {
        Self::new(id, vec![])
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn last_triggered(&self) -> Option<&Run> {
        self.runs.last()
    }

    /// The last run which ended conclusively.
    pub fn last_completed(&self) -> Option<&Run> {
        self.runs
            .iter()
            .rev()
            .find(|run| run.has_ended() && run.status.is_conclusive())
    }

    pub fn last_success(&self) -> Option<&Run> {
        self.runs.iter().rev().find(|run| run.has_succeeded())
    }

    /// The first run of the trailing streak of failures, if the job is currently failing.
    pub fn first_failing(&self) -> Option<&Run> {
        let mut first = None;
        for run in self
            .runs
            .iter()
            .rev()
            .filter(|run| run.has_ended() && run.status.is_conclusive())
        {
            if run.has_succeeded() {
                break;
            }
            first = Some(run);
        }
        first
    }

    pub fn is_running(&self) -> bool {
        self.last_triggered().is_some_and(|run| !run.has_ended())
    }

    pub fn is_success(&self) -> bool {
        self.last_completed().is_some_and(Run::has_succeeded)
    }

    pub fn is_out_of_capacity(&self) -> bool {
        self.last_completed()
            .is_some_and(|run| run.status == RunStatus::OutOfCapacity)
    }

    /// Whether the job is failing for reasons other than lack of capacity in a test zone.
    pub fn is_failing_hard(&self) -> bool {
        self.last_completed().is_some_and(Run::has_failed)
            && !(self.id.job_type.environment().is_test() && self.is_out_of_capacity())
    }

    /// Whether the job is failing hard, and was last triggered with a revision older than the given one.
    pub fn is_failing_hard_before(&self, revision: &crate::version::RevisionId) -> bool {
        self.is_failing_hard()
            && self
                .last_triggered()
                .is_some_and(|run| run.versions.target_revision < *revision)
    }

    /// The next run number for this job.
    pub fn next_number(&self) -> u64 {
        self.runs.last().map_or(1, |run| run.id.number + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::InstanceId;
    use crate::job::JobType;
    use crate::version::{RevisionId, Version};
    use chrono::{Duration, TimeZone};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn versions() -> Versions {
        Versions::new(Version::new(7, 0, 0), RevisionId::new(1), None, None)
    }

    fn history(job_type: JobType, statuses: &[RunStatus]) -> JobStatus {
        let id = JobId::new(InstanceId::new("t", "a", "default"), job_type);
        let runs = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let number = i as u64 + 1;
                let run = Run::new(RunId::new(id.clone(), number), versions(), t(i as i64 * 10), false);
                if *status == RunStatus::Running {
                    run
                } else {
                    run.finished(*status, t(i as i64 * 10 + 5))
                }
            })
            .collect();
        JobStatus::new(id, runs)
    }

    #[test]
    fn test_first_failing_is_start_of_trailing_streak() {
        use RunStatus::*;
        let job = history(JobType::SystemTest, &[TestFailure, Success, Error, Aborted, TestFailure]);
        assert_eq!(job.first_failing().map(|run| run.id.number), Some(3));
        assert_eq!(job.last_completed().map(|run| run.id.number), Some(5));
        assert_eq!(job.last_success().map(|run| run.id.number), Some(2));

        let healthy = history(JobType::SystemTest, &[TestFailure, Success, Reset]);
        assert!(healthy.first_failing().is_none());
        assert!(healthy.is_success());
    }

    #[test]
    fn test_running_and_next_number() {
        use RunStatus::*;
        let job = history(JobType::SystemTest, &[Success, Running]);
        assert!(job.is_running());
        assert_eq!(job.next_number(), 3);
        assert_eq!(job.last_completed().map(|run| run.id.number), Some(1));
        assert_eq!(JobStatus::empty(job.id.clone()).next_number(), 1);
    }

    #[test]
    fn test_out_of_capacity_in_test_zone_is_not_failing_hard() {
        use RunStatus::*;
        let system = history(JobType::SystemTest, &[OutOfCapacity]);
        assert!(system.is_out_of_capacity());
        assert!(!system.is_failing_hard());

        let production = history(JobType::ProductionDeployment("us-east-3".into()), &[OutOfCapacity]);
        assert!(production.is_failing_hard());
        assert!(production.is_failing_hard_before(&RevisionId::new(2)));
        assert!(!production.is_failing_hard_before(&RevisionId::new(1)));
    }
}
