//! Logging and OpenTelemetry integration for Rollout.
//!
//! Initialises a `tracing` subscriber with an `EnvFilter`, pretty or JSON output, and optional OTLP
//! export, and provides spans carrying deployment attributes.

pub mod spans;
pub mod tracer;

pub use spans::{DeploymentAttributes, instance_span, job_span, sweep_span};
pub use tracer::{LogFormat, OtlpConfig, TracerError, TracingConfig, init_tracer, shutdown_tracer};
