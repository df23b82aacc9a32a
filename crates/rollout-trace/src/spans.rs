//! Spans for orchestration work.

use rollout_core::{InstanceId, JobId};
use tracing::{Level, Span, span};

/// Attribute keys on deployment spans.
pub struct DeploymentAttributes;

impl DeploymentAttributes {
    pub const TENANT: &'static str = "deployment.tenant";
    pub const APPLICATION: &'static str = "deployment.application";
    pub const INSTANCE: &'static str = "deployment.instance";
    pub const JOB_TYPE: &'static str = "deployment.job.type";
    pub const OPERATION: &'static str = "deployment.operation";
}

/// Create a span for one sweep over all applications.
pub fn sweep_span() -> Span {
    span!(Level::INFO, "deployment.sweep")
}

/// Create a span for an operation on an instance.
pub fn instance_span(instance: &InstanceId, operation: &str) -> Span {
    span!(
        Level::INFO,
        "deployment.instance",
        deployment.tenant = %instance.tenant,
        deployment.application = %instance.application,
        deployment.instance = %instance.instance,
        deployment.operation = operation,
    )
}

/// Create a span for triggering, or aborting, a job.
pub fn job_span(job: &JobId, operation: &str) -> Span {
    span!(
        Level::DEBUG,
        "deployment.job",
        deployment.tenant = %job.instance.tenant,
        deployment.application = %job.instance.application,
        deployment.instance = %job.instance.instance,
        deployment.job.type = %job.job_type,
        deployment.operation = operation,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollout_core::ApplicationId;
    use rollout_core::job::JobType;

    #[test]
    fn test_span_names() {
        let instance = ApplicationId::new("tenant", "app").instance("default");
        let job = JobId::new(instance.clone(), JobType::SystemTest);

        // Disabled without a subscriber, but they keep their metadata.
        let span = instance_span(&instance, "pause");
        assert_eq!(span.metadata().map(|m| m.name()), Some("deployment.instance"));
        let span = job_span(&job, "trigger");
        assert_eq!(span.metadata().map(|m| m.name()), Some("deployment.job"));
        assert_eq!(DeploymentAttributes::JOB_TYPE, "deployment.job.type");
    }
}
