//! Readiness evaluation and job triggering for the Rollout deployment orchestrator.
//!
//! An application's deployment spec is turned into a [`graph::StepGraph`], which is evaluated
//! against run history in a [`status::DeploymentStatus`] to decide which jobs should run, with
//! which versions, and when. The [`trigger::DeploymentTrigger`] acts on those decisions through
//! the ports in `rollout_core::ports`, and the [`sweeper::Sweeper`] drives it periodically.

pub mod config;
pub mod graph;
pub mod jobs;
pub mod queue;
pub mod split;
pub mod status;
pub mod sweeper;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, SchedulerConfig};
pub use graph::{StepGraph, StepKind, StepNode};
pub use jobs::{JobsToRun, PlannedJob};
pub use status::{DeploymentStatus, StepStatus};
pub use sweeper::Sweeper;
pub use trigger::{ChangesToCancel, DeploymentTrigger, ReadyJob};
