//! Job scheduler: admission, routing, batching, dispatch and retries.
//!
//! ## Flow
//!
//! `submit` → rate limit → sanitize → result cache → persist `Queued` job →
//! route. The immediate route hands the job straight to its kind's
//! [`ConcurrencyPool`]; the queued route goes through the
//! [`BatchAccumulator`], which releases batches when they fill up or when a
//! flush timer fires.
//!
//! A pool task claims the job (`Queued → Processing`, one attempt), calls the
//! collaborator without holding any lock, then applies the outcome:
//! `Completed` (persisted, cached), `Retrying` (requeued by a timer after the
//! backoff delay) or `Failed`.
//!
//! ## State
//!
//! The [`JobStore`] is the source of truth. Read-modify-write of a job record
//! holds that job's record lock so a cancel cannot interleave with a claim or
//! with applying a result. A status change is pushed to the job's `watch`
//! channel, counted and acted on only once its write lands; a failed write is
//! retried from the in-memory record by a timer.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use chrono::{DateTime, Utc};
use tokio::sync::{MutexGuard, watch};
use tracing::{debug, error, info, instrument, warn};

use meetflow_ai::{AiError, IssueFields, IssueTracker, MetricsSink, TranscriptAnalyzer};
use meetflow_core::{BatchId, JobId, SubjectId};

use super::batch::{Batch, BatchAccumulator, PendingJob};
use super::cache::ResultCache;
use super::error::SchedulerError;
use super::pool::{ConcurrencyPool, PoolStats, PoolTask, WorkUnit};
use super::rate_limit::RateLimiter;
use super::retry::RetryDecision;
use super::routing::{Load, Route, choose_route, priority_for};
use super::store::JobStore;
use super::timer::{Clock, SystemClock, Timer, TokioTimer};
use super::types::{CallerTier, Job, JobKind, JobOutput, JobPayload, JobStatus, JobView};
use crate::config::{EngineConfig, PerKind};
use crate::persistence::KeyValueStore;

/// Downstream services the engine calls, one per job kind.
#[derive(Clone)]
pub struct Collaborators {
    pub analyzer: Arc<dyn TranscriptAnalyzer>,
    pub tracker: Arc<dyn IssueTracker>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// A caller's request.
#[derive(Debug, Clone)]
pub struct Submission {
    pub subject: SubjectId,
    pub tier: CallerTier,
    pub payload: JobPayload,
}

impl Submission {
    pub fn new(subject: SubjectId, payload: JobPayload) -> Self {
        Self {
            subject,
            tier: CallerTier::default(),
            payload,
        }
    }

    pub fn with_tier(mut self, tier: CallerTier) -> Self {
        self.tier = tier;
        self
    }
}

/// Caller's view of a submitted job.
///
/// Cache hits get a handle that is already `Completed` and has no job id.
#[derive(Debug, Clone)]
pub struct JobHandle {
    view: watch::Receiver<JobView>,
}

impl JobHandle {
    fn settled(view: JobView) -> Self {
        let (_tx, rx) = watch::channel(view);
        Self { view: rx }
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.view.borrow().id
    }

    pub fn is_cached(&self) -> bool {
        self.view.borrow().cached
    }

    pub fn status(&self) -> JobStatus {
        self.view.borrow().status
    }

    /// Latest published snapshot.
    pub fn view(&self) -> JobView {
        self.view.borrow().clone()
    }

    /// Wait until the job reaches a terminal status.
    ///
    /// `Failed` jobs resolve to [`SchedulerError::TerminalFailure`];
    /// `Cancelled` jobs resolve to their view.
    pub async fn wait(mut self) -> Result<JobView, SchedulerError> {
        let view = self
            .view
            .wait_for(|v| v.status.is_terminal())
            .await
            .map_err(|_| SchedulerError::Shutdown)?
            .clone();

        match (view.status, view.id) {
            (JobStatus::Failed, Some(job_id)) => Err(SchedulerError::TerminalFailure {
                job_id,
                last_error: view.last_error.unwrap_or_default(),
            }),
            _ => Ok(view),
        }
    }
}

/// Administrative snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    /// Jobs accumulated for batching plus tasks waiting for a pool slot
    pub queue_depth: usize,
    pub pending_batch_jobs: usize,
    /// Jobs sitting out a backoff delay
    pub retrying: usize,
    pub pools: Vec<PoolStats>,
    /// Active slots over total slots across all pools
    pub pool_utilization: f64,
    pub cache_hit_rate: f64,
    pub cache_entries: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub rate_limited: u64,
    pub cache_hits: u64,
    pub batches_released: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
    rate_limited: AtomicU64,
    cache_hits: AtomicU64,
    batches_released: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

const RECORD_LOCK_SHARDS: usize = 64;

/// Per-job record locks, striped over a fixed set of async mutexes.
struct RecordLocks {
    shards: Vec<tokio::sync::Mutex<()>>,
}

impl RecordLocks {
    fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| tokio::sync::Mutex::new(())).collect(),
        }
    }

    fn shard(&self, job_id: JobId) -> usize {
        let mut hasher = DefaultHasher::new();
        job_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    async fn lock(&self, job_id: JobId) -> MutexGuard<'_, ()> {
        self.shards[self.shard(job_id)].lock().await
    }
}

/// A status change whose effects wait for its record write.
#[derive(Debug, Clone)]
enum Transition {
    Completed(JobOutput),
    Retrying(Duration),
    Failed,
    Cancelled,
    Requeued,
}

pub struct JobSchedulerBuilder<S> {
    store: Arc<S>,
    collaborators: Collaborators,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    timer: Arc<dyn Timer>,
}

impl<S: KeyValueStore> JobSchedulerBuilder<S> {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    pub fn build(self) -> Result<JobScheduler<S>, SchedulerError> {
        self.config.validate()?;
        let config = self.config;

        let pool = |kind: JobKind| Arc::new(ConcurrencyPool::new(kind, *config.pools.get(kind)));
        let pools = PerKind {
            analysis: pool(JobKind::Analysis),
            issue_creation: pool(JobKind::IssueCreation),
            metrics: pool(JobKind::Metrics),
        };

        let inner = Inner {
            jobs: JobStore::new(self.store.clone(), config.job_retention),
            limiter: RateLimiter::new(self.store, self.clock.clone(), config.rate_limit.clone()),
            cache: ResultCache::new(config.cache.clone()),
            accumulator: BatchAccumulator::new(config.batch.clone()),
            pools,
            collaborators: self.collaborators,
            clock: self.clock,
            timer: self.timer,
            watchers: Mutex::new(HashMap::new()),
            cancel_requested: Mutex::new(HashSet::new()),
            record_locks: RecordLocks::new(RECORD_LOCK_SHARDS),
            backing_off: Mutex::new(HashSet::new()),
            counters: Counters::default(),
            config,
        };

        Ok(JobScheduler {
            inner: Arc::new(inner),
        })
    }
}

/// Single-process job engine. Cheap to clone.
pub struct JobScheduler<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for JobScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: KeyValueStore> JobScheduler<S> {
    /// Start building a scheduler over `store` with default config, the
    /// system clock and tokio timers.
    pub fn builder(store: Arc<S>, collaborators: Collaborators) -> JobSchedulerBuilder<S> {
        JobSchedulerBuilder {
            store,
            collaborators,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            timer: Arc::new(TokioTimer),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Admit a request.
    ///
    /// `RateLimited` and `ValidationFailed` are returned here and never create
    /// a job. A cache hit returns a completed handle without creating a job.
    #[instrument(skip(self, submission), fields(subject = %submission.subject, kind = %submission.payload.kind()))]
    pub async fn submit(&self, submission: Submission) -> Result<JobHandle, SchedulerError> {
        let inner = &self.inner;
        let kind = submission.payload.kind();

        let decision = inner
            .limiter
            .check(&submission.subject, kind.action_name(), 1)
            .await;
        if !decision.allowed {
            bump(&inner.counters.rate_limited);
            debug!(reset_at = %decision.reset_at, "submission rate limited");
            return Err(SchedulerError::RateLimited {
                retry_after: decision.retry_after.unwrap_or_default(),
                reset_at: decision.reset_at,
            });
        }

        let payload = submission
            .payload
            .sanitized(inner.config.max_payload_chars)
            .map_err(|e| SchedulerError::ValidationFailed(e.to_string()))?;

        inner.enqueue(submission.subject, submission.tier, payload).await
    }

    /// Current persisted state of a job.
    #[instrument(skip(self))]
    pub async fn get_status(&self, job_id: JobId) -> Result<JobView, SchedulerError> {
        Ok(self.inner.jobs.get(job_id).await?.view())
    }

    /// Re-attach to a job, e.g. after [`recover`](Self::recover).
    pub async fn handle(&self, job_id: JobId) -> Result<JobHandle, SchedulerError> {
        if let Some(rx) = self.inner.subscribe(job_id) {
            return Ok(JobHandle { view: rx });
        }
        let job = self.inner.jobs.get(job_id).await?;
        if job.status.is_terminal() {
            Ok(JobHandle::settled(job.view()))
        } else {
            Ok(JobHandle {
                view: self.inner.register(&job),
            })
        }
    }

    /// Best-effort cancel.
    ///
    /// A queued job is pulled from the accumulator or pool queue and marked
    /// `Cancelled`. For a job that is in flight or backing off, the intent is
    /// recorded and the outcome is discarded when it arrives. Returns `false`
    /// for jobs that already finished.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, SchedulerError> {
        let inner = &self.inner;
        let _record = inner.record_locks.lock(job_id).await;
        let mut job = inner.jobs.get(job_id).await?;

        match job.status {
            JobStatus::Queued => {
                job.mark_cancelled(inner.clock.now())?;
                inner.jobs.save(&job).await?;
                inner.accumulator.remove(job_id);
                inner.pools.get(job.kind).remove(job_id);
                bump(&inner.counters.cancelled);
                inner.publish(&job);
                info!(job_id = %job_id, "queued job cancelled");
                Ok(true)
            }
            JobStatus::Processing | JobStatus::Retrying => {
                inner.request_cancel(job_id);
                info!(job_id = %job_id, status = ?job.status, "cancel intent recorded");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn stats(&self) -> Stats {
        let inner = &self.inner;
        let pools: Vec<PoolStats> = JobKind::ALL
            .iter()
            .map(|kind| inner.pools.get(*kind).snapshot())
            .collect();
        let active: usize = pools.iter().map(|p| p.active).sum();
        let capacity: usize = pools.iter().map(|p| p.max_parallelism).sum();
        let c = &inner.counters;

        Stats {
            queue_depth: inner.queue_depth(),
            pending_batch_jobs: inner.accumulator.len(),
            retrying: inner.backing_off_len(),
            pool_utilization: if capacity == 0 {
                0.0
            } else {
                active as f64 / capacity as f64
            },
            pools,
            cache_hit_rate: inner.cache.hit_rate(),
            cache_entries: inner.cache.len(),
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            batches_released: c.batches_released.load(Ordering::Relaxed),
        }
    }

    /// Release every accumulated job now, regardless of batch age.
    pub fn flush_now(&self) {
        let batches = self.inner.accumulator.flush_all();
        self.inner.release_batches(batches);
    }

    /// Resume non-terminal jobs found in the store after a restart.
    ///
    /// `Queued` jobs are routed again, `Retrying` jobs get a fresh backoff
    /// timer, and `Processing` jobs (whose call was lost) count as a failed
    /// attempt. Returns how many jobs were resumed.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let inner = &self.inner;
        let ids = inner.jobs.active_ids().await?;
        let mut resumed = 0;

        for id in ids {
            let Some(mut job) = inner.jobs.load(id).await? else {
                continue;
            };
            let policy = inner.config.retry.get(job.kind);

            match job.status {
                JobStatus::Queued => {
                    inner.register(&job);
                    inner.route(&job);
                }
                JobStatus::Retrying => {
                    inner.register(&job);
                    inner.mark_backing_off(job.id, true);
                    inner.schedule_requeue(job.kind, job.id, policy.next_delay(job.attempts));
                }
                JobStatus::Processing => {
                    inner.register(&job);
                    let reason = "interrupted before completion".to_string();
                    let _record = inner.record_locks.lock(job.id).await;
                    let transition = match policy.decide(job.attempts, true) {
                        RetryDecision::Retry { delay } => {
                            job.mark_retrying(reason, inner.clock.now())?;
                            Transition::Retrying(delay)
                        }
                        RetryDecision::GiveUp => {
                            job.mark_failed(reason, inner.clock.now())?;
                            Transition::Failed
                        }
                    };
                    inner.commit(&job, &transition).await;
                }
                _ => continue,
            }
            resumed += 1;
        }

        info!(resumed, "job recovery finished");
        Ok(resumed)
    }
}

struct Inner<S> {
    config: EngineConfig,
    jobs: JobStore<Arc<S>>,
    limiter: RateLimiter<Arc<S>>,
    cache: ResultCache<JobOutput>,
    accumulator: BatchAccumulator,
    pools: PerKind<Arc<ConcurrencyPool>>,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    timer: Arc<dyn Timer>,
    watchers: Mutex<HashMap<JobId, watch::Sender<JobView>>>,
    cancel_requested: Mutex<HashSet<JobId>>,
    record_locks: RecordLocks,
    /// Jobs whose `Retrying` state is persisted and whose requeue is pending.
    backing_off: Mutex<HashSet<JobId>>,
    counters: Counters,
}

impl<S: KeyValueStore> Inner<S> {
    /// Cache lookup, job creation and routing for an admitted, sanitized payload.
    async fn enqueue(
        self: &Arc<Self>,
        subject: SubjectId,
        tier: CallerTier,
        payload: JobPayload,
    ) -> Result<JobHandle, SchedulerError> {
        let kind = payload.kind();

        if kind.is_cacheable() {
            if let Some(output) = self.cache.get(&payload.fingerprint()) {
                bump(&self.counters.cache_hits);
                debug!(kind = %kind, "served from result cache");
                return Ok(JobHandle::settled(JobView::cached(
                    kind,
                    output,
                    self.clock.now(),
                )));
            }
        }

        let priority = priority_for(tier, &payload, &self.config.routing);
        let max_attempts = self.config.retry.get(kind).max_attempts;
        let job = Job::new(subject, tier, payload, priority, max_attempts, self.clock.now());

        if let Err(e) = self.jobs.insert(&job).await {
            error!(job_id = %job.id, error = %e, "failed to persist new job");
            return Err(SchedulerError::PersistenceUnavailable(e.to_string()));
        }
        bump(&self.counters.submitted);

        let rx = self.register(&job);
        info!(job_id = %job.id, kind = %kind, priority, "job accepted");
        self.route(&job);
        Ok(JobHandle { view: rx })
    }

    fn queue_depth(&self) -> usize {
        let waiting: usize = JobKind::ALL
            .iter()
            .map(|kind| self.pools.get(*kind).waiting())
            .sum();
        self.accumulator.len() + waiting
    }

    fn route(self: &Arc<Self>, job: &Job) {
        let pool = self.pools.get(job.kind).snapshot();
        let load = Load {
            queue_depth: self.queue_depth(),
            pool_occupied: pool.active + pool.waiting,
            pool_capacity: pool.max_parallelism,
        };
        match choose_route(&job.payload, load, &self.config.routing) {
            Route::Immediate => {
                debug!(job_id = %job.id, "routing immediately");
                let task = self.task(job.kind, job.id, None);
                self.pools.get(job.kind).run(WorkUnit::single(task));
            }
            Route::Queued => {
                debug!(job_id = %job.id, "routing to batch accumulator");
                let full = self.accumulator.push(PendingJob::from_job(job));
                self.release_batches(full);
                self.schedule_flush();
            }
        }
    }

    fn release_batches(self: &Arc<Self>, batches: Vec<Batch>) {
        for batch in batches {
            bump(&self.counters.batches_released);
            let tasks = batch
                .jobs
                .iter()
                .map(|member| self.task(batch.kind, member.job_id, Some(batch.id)))
                .collect();
            self.pools.get(batch.kind).run(WorkUnit::batch(batch.id, tasks));
        }
    }

    fn schedule_flush(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.timer.schedule(
            self.config.batch.flush_interval,
            async move {
                if let Some(inner) = weak.upgrade() {
                    let due = inner.accumulator.flush_due();
                    inner.release_batches(due);
                }
            }
            .boxed(),
        );
    }

    fn schedule_requeue(self: &Arc<Self>, kind: JobKind, job_id: JobId, delay: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.timer.schedule(
            delay,
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.requeue(kind, job_id).await;
                }
            }
            .boxed(),
        );
    }

    fn schedule_redispatch(self: &Arc<Self>, kind: JobKind, job_id: JobId, batch_id: Option<BatchId>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.timer.schedule(
            self.config.retry.get(kind).base_delay,
            async move {
                if let Some(inner) = weak.upgrade() {
                    let task = inner.task(kind, job_id, batch_id);
                    inner.pools.get(kind).run(WorkUnit::single(task));
                }
            }
            .boxed(),
        );
    }

    /// Retry a failed record write from the in-memory job.
    fn schedule_commit(self: &Arc<Self>, job: Job, transition: Transition) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.timer.schedule(
            self.config.retry.get(job.kind).base_delay,
            async move {
                if let Some(inner) = weak.upgrade() {
                    let landed = {
                        let _record = inner.record_locks.lock(job.id).await;
                        inner.commit(&job, &transition).await
                    };
                    if landed {
                        inner.finish(&job, transition).await;
                    }
                }
            }
            .boxed(),
        );
    }

    fn task(self: &Arc<Self>, kind: JobKind, job_id: JobId, batch_id: Option<BatchId>) -> PoolTask {
        let inner = Arc::clone(self);
        PoolTask {
            job_id,
            fut: async move { inner.execute(kind, job_id, batch_id).await }.boxed(),
        }
    }

    /// One attempt: claim, call the collaborator, apply the outcome.
    async fn execute(self: &Arc<Self>, kind: JobKind, job_id: JobId, batch_id: Option<BatchId>) {
        let Some(job) = self.claim(kind, job_id, batch_id).await else {
            return;
        };

        debug!(job_id = %job_id, attempt = job.attempts, "calling collaborator");
        let outcome = AssertUnwindSafe(self.call_downstream(&job.payload))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(job_id = %job_id, "collaborator panicked");
                Err(AiError::Internal("collaborator panicked".to_string()))
            });
        self.apply_outcome(job, outcome).await;
    }

    async fn claim(self: &Arc<Self>, kind: JobKind, job_id: JobId, batch_id: Option<BatchId>) -> Option<Job> {
        let _record = self.record_locks.lock(job_id).await;

        let mut job = match self.jobs.load(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, "dispatched job missing from store");
                return None;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to load job; redispatching later");
                self.schedule_redispatch(kind, job_id, batch_id);
                return None;
            }
        };

        if job.status != JobStatus::Queued {
            debug!(job_id = %job_id, status = ?job.status, "skipping job that is no longer queued");
            return None;
        }

        if let Err(e) = job.mark_processing(batch_id, self.clock.now()) {
            warn!(job_id = %job_id, error = %e, "cannot claim job");
            return None;
        }
        if let Err(e) = self.jobs.save(&job).await {
            error!(job_id = %job_id, error = %e, "failed to persist claim; redispatching later");
            self.schedule_redispatch(kind, job_id, batch_id);
            return None;
        }
        self.publish(&job);
        Some(job)
    }

    async fn call_downstream(&self, payload: &JobPayload) -> Result<JobOutput, AiError> {
        let c = &self.collaborators;
        match payload {
            JobPayload::Analysis(transcript) => {
                let outcome = c.analyzer.analyze(transcript).await?;
                if !outcome.success {
                    return Err(AiError::InferenceFailed(
                        "analyzer reported an unsuccessful extraction".to_string(),
                    ));
                }
                Ok(JobOutput::Analysis(outcome))
            }
            JobPayload::IssueCreation(fields) => {
                let created = c.tracker.create_issue(fields).await?;
                if !created.success {
                    return Err(AiError::Unavailable(format!(
                        "tracker did not confirm issue in {}",
                        fields.project
                    )));
                }
                Ok(JobOutput::IssueCreated(created))
            }
            JobPayload::Metrics(sample) => {
                c.metrics.record(sample).await?;
                Ok(JobOutput::MetricsRecorded)
            }
        }
    }

    async fn apply_outcome(self: &Arc<Self>, mut job: Job, outcome: Result<JobOutput, AiError>) {
        let landed = {
            let _record = self.record_locks.lock(job.id).await;
            let now = self.clock.now();

            let transition = if self.take_cancel_intent(job.id) {
                if let Err(e) = job.mark_cancelled(now) {
                    warn!(job_id = %job.id, error = %e, "cannot cancel job");
                    return;
                }
                info!(job_id = %job.id, "discarding result of cancelled job");
                Transition::Cancelled
            } else {
                match outcome {
                    Ok(output) => {
                        if let Err(e) = job.mark_completed(output.clone(), now) {
                            warn!(job_id = %job.id, error = %e, "cannot complete job");
                            return;
                        }
                        Transition::Completed(output)
                    }
                    Err(e) => match self.failure_transition(&mut job, e, now) {
                        Some(transition) => transition,
                        None => return,
                    },
                }
            };

            let landed = self.commit(&job, &transition).await;
            landed.then_some(transition)
        };

        if let Some(transition) = landed {
            self.finish(&job, transition).await;
        }
    }

    /// Run the job through its retry policy after a failed call.
    fn failure_transition(&self, job: &mut Job, e: AiError, now: DateTime<Utc>) -> Option<Transition> {
        let retryable = e.is_retryable();
        let message = SchedulerError::DownstreamFailure(e.to_string()).to_string();
        let policy = self.config.retry.get(job.kind);

        let result = match policy.decide(job.attempts, retryable) {
            RetryDecision::Retry { delay } => job
                .mark_retrying(message, now)
                .map(|()| Transition::Retrying(delay)),
            RetryDecision::GiveUp => job.mark_failed(message, now).map(|()| Transition::Failed),
        };
        match result {
            Ok(transition) => {
                debug!(job_id = %job.id, attempt = job.attempts, retryable, error = %e, "downstream call failed");
                Some(transition)
            }
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "cannot record failure");
                None
            }
        }
    }

    /// Persist `job` and apply what its transition implies.
    ///
    /// Nothing is published, counted or scheduled until the write lands. A
    /// failed write is retried from the in-memory record after the kind's
    /// base delay. The caller holds the job's record lock. Returns whether the
    /// write landed.
    async fn commit(self: &Arc<Self>, job: &Job, transition: &Transition) -> bool {
        if let Err(e) = self.jobs.save(job).await {
            error!(job_id = %job.id, status = ?job.status, error = %e, "failed to persist job state; write will be retried");
            self.schedule_commit(job.clone(), transition.clone());
            return false;
        }

        self.mark_backing_off(job.id, matches!(transition, Transition::Retrying(_)));
        match transition {
            Transition::Completed(output) => {
                if job.kind.is_cacheable() {
                    self.cache.put(job.fingerprint.clone(), output.clone());
                }
                bump(&self.counters.completed);
                info!(job_id = %job.id, attempts = job.attempts, "job completed");
            }
            Transition::Retrying(delay) => {
                bump(&self.counters.retried);
                info!(job_id = %job.id, attempt = job.attempts, ?delay, "job will be retried");
                self.schedule_requeue(job.kind, job.id, *delay);
            }
            Transition::Failed => {
                bump(&self.counters.failed);
                warn!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    error = job.last_error.as_deref().unwrap_or_default(),
                    "job failed"
                );
            }
            Transition::Cancelled => {
                bump(&self.counters.cancelled);
                info!(job_id = %job.id, "job cancelled");
            }
            Transition::Requeued => {
                debug!(job_id = %job.id, attempts = job.attempts, "job requeued after backoff");
            }
        }

        if job.status.is_terminal() {
            self.take_cancel_intent(job.id);
        }
        self.publish(job);
        true
    }

    /// Follow-up work for a landed transition, run without the record lock.
    async fn finish(self: &Arc<Self>, job: &Job, transition: Transition) {
        match transition {
            Transition::Completed(output) => self.file_follow_ups(job, &output).await,
            Transition::Requeued => self.route(job),
            _ => {}
        }
    }

    async fn file_follow_ups(self: &Arc<Self>, job: &Job, output: &JobOutput) {
        for fields in follow_up_issues(&job.payload, output) {
            let payload = match fields.sanitized(self.config.max_payload_chars) {
                Ok(fields) => JobPayload::IssueCreation(fields),
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "skipping extracted issue");
                    continue;
                }
            };
            if let Err(e) = self.enqueue(job.subject.clone(), job.tier, payload).await {
                error!(job_id = %job.id, error = %e, "failed to submit issue follow-up");
            }
        }
    }

    /// Backoff elapsed: `Retrying → Queued` and route again.
    async fn requeue(self: &Arc<Self>, kind: JobKind, job_id: JobId) {
        let (job, transition) = {
            let _record = self.record_locks.lock(job_id).await;
            let mut job = match self.jobs.load(job_id).await {
                Ok(Some(job)) if job.status == JobStatus::Retrying => job,
                Ok(other) => {
                    debug!(job_id = %job_id, status = ?other.map(|j| j.status), "nothing to requeue");
                    self.mark_backing_off(job_id, false);
                    return;
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "failed to load retrying job; trying again later");
                    self.schedule_requeue(kind, job_id, self.config.retry.get(kind).base_delay);
                    return;
                }
            };

            let now = self.clock.now();
            if let Err(e) = job.mark_requeued(now) {
                warn!(job_id = %job_id, error = %e, "cannot requeue job");
                return;
            }
            let transition = if self.take_cancel_intent(job_id) && job.mark_cancelled(now).is_ok() {
                info!(job_id = %job_id, "cancelled job dropped before retry");
                Transition::Cancelled
            } else {
                Transition::Requeued
            };

            if !self.commit(&job, &transition).await {
                return;
            }
            (job, transition)
        };

        self.finish(&job, transition).await;
    }

    fn mark_backing_off(&self, job_id: JobId, backing_off: bool) {
        let mut set = self.backing_off.lock().unwrap_or_else(|e| e.into_inner());
        if backing_off {
            set.insert(job_id);
        } else {
            set.remove(&job_id);
        }
    }

    fn backing_off_len(&self) -> usize {
        self.backing_off.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn register(&self, job: &Job) -> watch::Receiver<JobView> {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        let tx = watchers
            .entry(job.id)
            .or_insert_with(|| watch::channel(job.view()).0);
        tx.send_replace(job.view());
        tx.subscribe()
    }

    fn subscribe(&self, job_id: JobId) -> Option<watch::Receiver<JobView>> {
        let watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        watchers.get(&job_id).map(watch::Sender::subscribe)
    }

    /// Push the job's new state to its handles; terminal states close the channel.
    fn publish(&self, job: &Job) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = watchers.get(&job.id) {
            tx.send_replace(job.view());
        }
        if job.status.is_terminal() {
            watchers.remove(&job.id);
        }
    }

    fn request_cancel(&self, job_id: JobId) {
        self.cancel_requested
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id);
    }

    fn take_cancel_intent(&self, job_id: JobId) -> bool {
        self.cancel_requested
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id)
    }
}

/// Issues to file after an analysis that asked for it.
fn follow_up_issues(payload: &JobPayload, output: &JobOutput) -> Vec<IssueFields> {
    match (payload, output) {
        (JobPayload::Analysis(transcript), JobOutput::Analysis(outcome)) if transcript.file_issues => {
            let Some(project) = transcript.project.as_deref() else {
                return Vec::new();
            };
            outcome
                .issues
                .iter()
                .map(|issue| IssueFields::from_extracted(project, issue))
                .collect()
        }
        _ => Vec::new(),
    }
}
