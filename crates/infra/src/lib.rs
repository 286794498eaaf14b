//! `meetflow-infra`
//!
//! **Responsibility:** the job scheduling and resource-governance engine.
//!
//! - `persistence`: the key-value collaborator (in-memory, optional Redis)
//! - `config`: engine configuration with environment overrides
//! - `jobs`: rate limiting, result caching, batching, pools, retries and the
//!   scheduler that ties them together

pub mod config;
pub mod jobs;
pub mod persistence;

pub use config::{ConfigError, EngineConfig};
pub use jobs::{
    CallerTier, Collaborators, JobHandle, JobKind, JobPayload, JobScheduler, JobStatus, JobView,
    SchedulerError, Stats, Submission,
};
