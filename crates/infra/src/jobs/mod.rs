//! Job scheduling and resource governance.
//!
//! ## Design
//!
//! - Jobs are typed by kind (analysis, issue creation, metrics); the kind picks
//!   the pool, the retry policy and the downstream collaborator
//! - Admission control is a sliding-window rate limit per subject and action
//! - Identical payloads are served from a fingerprint-keyed result cache
//! - Queued jobs are grouped into similarity batches and dispatched to
//!   bounded per-kind pools
//! - Failures retry with exponential backoff and jitter, realized by timers
//!
//! ## Components
//!
//! - `JobScheduler`: orchestrator and public entry point
//! - `RateLimiter`, `ResultCache`, `RetryPolicy`: governance primitives
//! - `BatchAccumulator`, `ConcurrencyPool`: queueing and execution
//! - `JobStore`: persisted job records on the key-value collaborator

pub mod batch;
pub mod cache;
pub mod error;
pub mod pool;
pub mod rate_limit;
pub mod retry;
pub mod routing;
pub mod scheduler;
pub mod store;
pub mod timer;
pub mod types;

pub use batch::{Batch, BatchAccumulator, PendingJob};
pub use cache::ResultCache;
pub use error::SchedulerError;
pub use pool::{ConcurrencyPool, PoolStats, PoolTask, WorkUnit};
pub use rate_limit::{RateDecision, RateLimiter};
pub use retry::{RetryDecision, RetryPolicy};
pub use routing::{Load, Route, choose_route, priority_for};
pub use scheduler::{Collaborators, JobHandle, JobScheduler, JobSchedulerBuilder, Stats, Submission};
pub use store::{JobStore, JobStoreError};
pub use timer::{Clock, ManualClock, SystemClock, Timer, TokioTimer};
pub use types::{
    CallerTier, Fingerprint, Job, JobKind, JobOutput, JobPayload, JobStatus, JobView,
    TransitionError,
};
