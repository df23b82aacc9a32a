//! Rollout Core
//!
//! Core domain types, traits, and error handling for the Rollout deployment orchestrator.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates: identifiers, job types, versions, changes,
//! run history, deployment specifications and the ports to external collaborators.

pub mod application;
pub mod change;
pub mod error;
pub mod ids;
pub mod job;
pub mod ports;
pub mod run;
pub mod spec;
pub mod version;

pub use error::{Error, Result};
pub use ids::*;
