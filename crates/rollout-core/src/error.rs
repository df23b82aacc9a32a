//! Error types for Rollout.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("Application not found: {0}")]
    ApplicationNotFound(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    // Caller errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Deployment spec errors
    #[error("Inconsistent deployment spec: {0}")]
    InconsistentSpec(String),

    #[error("Invalid deployment spec: {0}")]
    InvalidSpec(String),

    // Collaborator errors
    #[error("Failed to acquire lock: {0}")]
    Lock(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Step runner error: {0}")]
    StepRunner(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failed operation may succeed if simply retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Lock(_) | Error::Storage(_) | Error::StepRunner(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
