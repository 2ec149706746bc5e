//! Crate-wide error types.

use thiserror::Error;

use crate::engine::JobStatus;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Job not found: {id}")]
    NotFound { id: String },

    #[error("Job {id} is not ready (status: {status})")]
    NotReady { id: String, status: JobStatus },

    #[error("Job {id} failed: {reason}")]
    JobFailed { id: String, reason: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: JobStatus, to: JobStatus },

    #[error("Job engine has stopped")]
    EngineStopped,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
