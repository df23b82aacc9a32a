//! Test infrastructure for Rollout.
//!
//! Provides in-memory implementations of the scheduler's ports, a [`DeploymentTester`] which
//! drives whole deployments against them with a manual clock, and testcontainers-based
//! PostgreSQL for the storage adapter.
//!
//! # Usage
//!
//! ```ignore
//! use rollout_tests::{DeploymentTester, fixtures};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let tester = DeploymentTester::new();
//!     let app = tester.new_application("app", fixtures::TWO_REGIONS).unwrap();
//!     tester.submit(&app, 1).await.unwrap();
//! }
//! ```

pub mod containers;
pub mod context;
pub mod fixtures;
pub mod memory;
pub mod tester;

pub use context::TestContext;
pub use memory::*;
pub use tester::DeploymentTester;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,rollout_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}
