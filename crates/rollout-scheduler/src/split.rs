//! Splitting of combined platform and revision changes.
//!
//! A change with both a platform and a revision may be rolled out by a production job as one,
//! or in two steps where one part goes first. Which, depends on how far each part has already
//! come, and on the rollout policy of the instance.

use crate::status::{DeploymentStatus, StepStatus};
use rollout_core::change::Change;
use rollout_core::job::JobType;
use rollout_core::spec::RolloutPolicy;
use rollout_core::{Error, JobId, Result};

impl DeploymentStatus {
    /// The changes to run with the given production job, in order. Empty if the job is done
    /// with the change; a single element if the change runs as one.
    pub fn changes(&self, job: &JobId, change: &Change) -> Result<Vec<Change>> {
        let step = self.step(job).ok_or_else(|| missing_step(job))?;

        if step.completed_at_for(change, Some(job)).is_some() {
            return Ok(vec![]);
        }

        if change.platform.is_none() || change.revision.is_none() || change.is_pinned() {
            return Ok(vec![change.clone()]);
        }

        let platform = change.without_revision();
        let revision = change.without_platform();
        if step.completed_at_for(&platform, Some(job)).is_some()
            || step.completed_at_for(&revision, Some(job)).is_some()
        {
            return Ok(vec![change.clone()]);
        }

        let both = || vec![change.clone()];
        let platform_first = || vec![platform.clone(), change.clone()];
        let revision_first = || vec![revision.clone(), change.clone()];

        let instance = job.instance.instance();
        let rollout = self
            .graph()
            .instance_spec(instance)
            .map(|spec| spec.rollout)
            .ok_or_else(|| {
                Error::InconsistentSpec(format!("no instance '{instance}' in the deployment spec"))
            })?;

        if job.job_type.is_test() {
            let deployment = JobId::new(
                job.instance.clone(),
                JobType::deployment_to(&job.job_type.zone()),
            );
            let deployment_step = self
                .step(&deployment)
                .ok_or_else(|| missing_step(&deployment))?;
            let platform_deployed = deployment_step
                .completed_at_for(&platform, Some(&deployment))
                .is_some();
            let revision_deployed = deployment_step
                .completed_at_for(&revision, Some(&deployment))
                .is_some();

            // Test what was deployed first.
            if !platform_deployed && revision_deployed {
                return Ok(revision_first());
            }

            if platform_deployed && !revision_deployed {
                // Once the revision is held back only by this test verifying the upgrade,
                // the rollout policy decides whether the test must give way.
                let revision_waiting = deployment_step
                    .ready_at_for(change, Some(&deployment))
                    .is_some_and(|ready| ready <= self.now());
                if revision_waiting {
                    return Ok(match rollout {
                        RolloutPolicy::Separate => {
                            if self.has_failures_between(deployment_step.index(), step.index()) {
                                both()
                            } else {
                                platform_first()
                            }
                        }
                        RolloutPolicy::Leading => both(),
                        RolloutPolicy::Simultaneous => revision_first(),
                    });
                }
                return Ok(platform_first());
            }
        }

        let platform_ready_at = step.dependencies_completed_at(&platform, Some(job));
        let revision_ready_at = step.dependencies_completed_at(&revision, Some(job));

        let (platform_ready_at, revision_ready_at) = match (platform_ready_at, revision_ready_at) {
            (None, None) => {
                return Ok(match rollout {
                    RolloutPolicy::Separate => platform_first(),
                    RolloutPolicy::Leading => both(),
                    RolloutPolicy::Simultaneous => revision_first(),
                });
            }
            (None, Some(_)) => return Ok(revision_first()),
            (Some(_), None) => return Ok(platform_first()),
            (Some(platform_ready_at), Some(revision_ready_at)) => {
                (platform_ready_at, revision_ready_at)
            }
        };

        let platform_ready_first = platform_ready_at < revision_ready_at;
        let revision_ready_first = revision_ready_at < platform_ready_at;
        Ok(match rollout {
            RolloutPolicy::Separate => {
                // Nothing has run yet when dependencies completed at the epoch.
                if platform_ready_first || platform_ready_at == chrono::DateTime::UNIX_EPOCH {
                    if is_failing(self, &step) {
                        both()
                    } else {
                        platform_first()
                    }
                } else if revision_ready_first {
                    revision_first()
                } else {
                    both()
                }
            }
            RolloutPolicy::Leading => both(),
            RolloutPolicy::Simultaneous => {
                if platform_ready_first {
                    both()
                } else {
                    revision_first()
                }
            }
        })
    }
}

fn is_failing(status: &DeploymentStatus, step: &StepStatus<'_>) -> bool {
    step.job()
        .and_then(|job| status.job(job))
        .and_then(|job| job.first_failing())
        .is_some()
}

fn missing_step(job: &JobId) -> Error {
    Error::InconsistentSpec(format!("{job} is not a step of the deployment spec"))
}
