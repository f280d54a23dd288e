//! Error types for jobfleet.

use std::path::PathBuf;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors from the orchestrator client.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Docker daemon is not available or not running.
    #[error("Docker not available: {reason}")]
    DockerNotAvailable { reason: String },

    #[error("Failed to create job {job_name}: {reason}")]
    JobCreationFailed { job_name: String, reason: String },

    #[error("Job already exists: {job_name}")]
    JobAlreadyExists { job_name: String },

    #[error("Job not found: {job_name}")]
    JobNotFound { job_name: String },

    #[error("Failed to read logs for {job_name}: {reason}")]
    LogReadFailed { job_name: String, reason: String },

    #[error("Orchestrator API error: {reason}")]
    Api { reason: String },

    /// Docker API error.
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// Errors from session persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session already exists: {id}")]
    AlreadyExists { id: String },

    #[error("Session not found: {id}")]
    NotFound { id: String },
}

/// Errors while building or submitting jobs for a session.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid session request: {0}")]
    InvalidRequest(String),

    #[error("Job {index} of {total} could not be created: {source}")]
    Submission {
        index: usize,
        total: usize,
        #[source]
        source: OrchestratorError,
    },
}

/// Errors from webhook notification.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Webhook queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("Webhook dispatcher has shut down")]
    Closed,

    #[error("Failed to persist webhook outbox: {0}")]
    Outbox(#[from] StoreError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Endpoint returned status {status}")]
    Status { status: u16 },
}

/// Result type for jobfleet operations.
pub type Result<T> = std::result::Result<T, Error>;
