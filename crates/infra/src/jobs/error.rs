use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use meetflow_core::JobId;

use super::store::JobStoreError;
use super::types::TransitionError;
use crate::config::ConfigError;

/// Errors surfaced by [`JobScheduler`](super::JobScheduler).
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// Caller exceeded its window; retry after `retry_after`.
    #[error("rate limited; retry after {retry_after:?} (window resets at {reset_at})")]
    RateLimited {
        retry_after: Duration,
        reset_at: DateTime<Utc>,
    },

    /// Payload malformed or oversized. Never retried.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// A collaborator call failed. Only ever recorded as a job's `last_error`.
    #[error("downstream failure: {0}")]
    DownstreamFailure(String),

    #[error("job {job_id} failed: {last_error}")]
    TerminalFailure { job_id: JobId, last_error: String },

    /// Job state could not be read or written.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The scheduler was dropped before the job finished.
    #[error("scheduler shut down")]
    Shutdown,
}

impl From<JobStoreError> for SchedulerError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::NotFound(id) => SchedulerError::JobNotFound(id),
            other => SchedulerError::PersistenceUnavailable(other.to_string()),
        }
    }
}
