//! Similarity batching of queued jobs.
//!
//! Two jobs are compatible when they have the same kind, identical classifier
//! fields and a size ratio (`min/max`) at or above the similarity threshold.
//! Grouping is greedy: the oldest ungrouped job seeds a batch and later jobs
//! join in submission order while they are compatible with every member and
//! the batch has room.
//!
//! A batch is released when it is full, or once the flush interval has
//! elapsed since its seed was accumulated.

use std::sync::Mutex;

use tokio::time::Instant;
use tracing::debug;

use meetflow_core::{BatchId, JobId};

use super::types::{Job, JobKind};
use crate::config::BatchConfig;

/// The parts of a queued job that batching looks at.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingJob {
    pub job_id: JobId,
    pub kind: JobKind,
    pub classifier: Vec<String>,
    pub size: usize,
    pub priority: u32,
}

impl PendingJob {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            classifier: job
                .payload
                .classifier()
                .into_iter()
                .map(str::to_string)
                .collect(),
            size: job.payload.content_len(),
            priority: job.priority,
        }
    }
}

/// Symmetric compatibility rule.
pub fn compatible(a: &PendingJob, b: &PendingJob, similarity_threshold: f64) -> bool {
    if a.kind != b.kind || a.classifier != b.classifier {
        return false;
    }
    let (lo, hi) = if a.size <= b.size {
        (a.size, b.size)
    } else {
        (b.size, a.size)
    };
    if hi == 0 {
        return true;
    }
    (lo as f64 / hi as f64) >= similarity_threshold
}

/// Greedy grouping over jobs in submission order; returns index groups.
pub fn group(jobs: &[PendingJob], max_batch_size: usize, similarity_threshold: f64) -> Vec<Vec<usize>> {
    let mut grouped = vec![false; jobs.len()];
    let mut groups = Vec::new();

    for seed in 0..jobs.len() {
        if grouped[seed] {
            continue;
        }
        grouped[seed] = true;
        let mut members = vec![seed];

        for candidate in seed + 1..jobs.len() {
            if members.len() >= max_batch_size {
                break;
            }
            if grouped[candidate] {
                continue;
            }
            if members
                .iter()
                .all(|&m| compatible(&jobs[m], &jobs[candidate], similarity_threshold))
            {
                grouped[candidate] = true;
                members.push(candidate);
            }
        }
        groups.push(members);
    }

    groups
}

/// Transient group of compatible jobs, dispatched together.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub kind: JobKind,
    pub jobs: Vec<PendingJob>,
}

impl Batch {
    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|j| j.job_id).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Most urgent member priority.
    pub fn priority(&self) -> u32 {
        self.jobs.iter().map(|j| j.priority).min().unwrap_or(u32::MAX)
    }
}

struct Accumulated {
    job: PendingJob,
    accumulated_at: Instant,
}

pub struct BatchAccumulator {
    config: BatchConfig,
    pending: Mutex<Vec<Accumulated>>,
}

impl BatchAccumulator {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Accumulate a job; returns any batch that became full.
    pub fn push(&self, job: PendingJob) -> Vec<Batch> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(Accumulated {
            job,
            accumulated_at: Instant::now(),
        });
        self.release(&mut pending, |_, len| len >= self.config.max_batch_size)
    }

    /// Release full batches and batches whose seed waited a full flush interval.
    pub fn flush_due(&self) -> Vec<Batch> {
        let now = Instant::now();
        let interval = self.config.flush_interval;
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        self.release(&mut pending, |seed_at, len| {
            len >= self.config.max_batch_size || now.duration_since(seed_at) >= interval
        })
    }

    /// Release everything regardless of age.
    pub fn flush_all(&self) -> Vec<Batch> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        self.release(&mut pending, |_, _| true)
    }

    /// Drop a job that has not been released yet.
    pub fn remove(&self, job_id: JobId) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let before = pending.len();
        pending.retain(|a| a.job.job_id != job_id);
        pending.len() != before
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Regroup everything pending and take out the groups `ready` accepts.
    ///
    /// Released batches are ordered by their most urgent member, then by age.
    fn release<F>(&self, pending: &mut Vec<Accumulated>, ready: F) -> Vec<Batch>
    where
        F: Fn(Instant, usize) -> bool,
    {
        let jobs: Vec<PendingJob> = pending.iter().map(|a| a.job.clone()).collect();
        let groups = group(&jobs, self.config.max_batch_size, self.config.similarity_threshold);

        let mut taken = vec![false; pending.len()];
        let mut released: Vec<(Instant, Batch)> = Vec::new();
        for members in groups {
            let seed_at = pending[members[0]].accumulated_at;
            if !ready(seed_at, members.len()) {
                continue;
            }
            for &m in &members {
                taken[m] = true;
            }
            released.push((
                seed_at,
                Batch {
                    id: BatchId::new(),
                    kind: jobs[members[0]].kind,
                    jobs: members.iter().map(|&m| jobs[m].clone()).collect(),
                },
            ));
        }

        if released.is_empty() {
            return Vec::new();
        }

        let mut index = 0;
        pending.retain(|_| {
            let keep = !taken[index];
            index += 1;
            keep
        });

        released.sort_by_key(|(seed_at, batch)| (batch.priority(), *seed_at));
        for (_, batch) in &released {
            debug!(batch_id = %batch.id, kind = %batch.kind, size = batch.len(), "batch released");
        }
        released.into_iter().map(|(_, batch)| batch).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    fn pending(kind: JobKind, classifier: &[&str], size: usize) -> PendingJob {
        PendingJob {
            job_id: JobId::new(),
            kind,
            classifier: classifier.iter().map(|s| s.to_string()).collect(),
            size,
            priority: 10,
        }
    }

    fn config(max: usize) -> BatchConfig {
        BatchConfig {
            max_batch_size: max,
            flush_interval: Duration::from_secs(2),
            similarity_threshold: 0.5,
        }
    }

    #[test]
    fn compatibility_rules() {
        let a = pending(JobKind::Analysis, &["standup", "task"], 500);
        let b = pending(JobKind::Analysis, &["standup", "task"], 480);
        let c = pending(JobKind::Analysis, &["retro", "task"], 500);
        let d = pending(JobKind::Analysis, &["standup", "task"], 200);
        let e = pending(JobKind::Metrics, &["standup", "task"], 500);

        assert!(compatible(&a, &b, 0.5));
        assert!(compatible(&b, &a, 0.5));
        assert!(!compatible(&a, &c, 0.5));
        assert!(!compatible(&a, &d, 0.5));
        assert!(!compatible(&a, &e, 0.5));
    }

    #[test]
    fn greedy_grouping_respects_size_bound() {
        let jobs: Vec<_> = (0..5)
            .map(|_| pending(JobKind::Analysis, &["standup", "task"], 100))
            .collect();
        assert_eq!(group(&jobs, 2, 0.5), vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn grouping_skips_incompatible_jobs() {
        let jobs = vec![
            pending(JobKind::Analysis, &["standup", "task"], 100),
            pending(JobKind::Analysis, &["retro", "task"], 100),
            pending(JobKind::Analysis, &["standup", "task"], 90),
        ];
        assert_eq!(group(&jobs, 5, 0.5), vec![vec![0, 2], vec![1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_batches_release_on_push() {
        let acc = BatchAccumulator::new(config(2));
        assert!(acc.push(pending(JobKind::Analysis, &["standup", "task"], 500)).is_empty());

        let released = acc.push(pending(JobKind::Analysis, &["standup", "task"], 480));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].len(), 2);
        assert!(acc.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lone_job_flushes_after_interval() {
        let acc = BatchAccumulator::new(config(5));
        acc.push(pending(JobKind::Analysis, &["standup", "task"], 500));

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(acc.flush_due().is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        let released = acc.flush_due();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].len(), 1);
        assert!(acc.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_orders_by_priority_then_age() {
        let acc = BatchAccumulator::new(config(5));
        let mut old = pending(JobKind::Analysis, &["retro", "task"], 100);
        old.priority = 20;
        let mut urgent = pending(JobKind::Analysis, &["incident", "bug"], 100);
        urgent.priority = 0;
        acc.push(old.clone());
        tokio::time::advance(Duration::from_millis(10)).await;
        acc.push(urgent.clone());

        let released = acc.flush_all();
        assert_eq!(released[0].job_ids(), vec![urgent.job_id]);
        assert_eq!(released[1].job_ids(), vec![old.job_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_jobs_are_not_released() {
        let acc = BatchAccumulator::new(config(5));
        let job = pending(JobKind::Analysis, &["standup", "task"], 500);
        acc.push(job.clone());
        assert!(acc.remove(job.job_id));
        assert!(!acc.remove(job.job_id));
        assert!(acc.flush_all().is_empty());
    }

    fn arb_pending() -> impl Strategy<Value = PendingJob> {
        (
            prop::sample::select(vec![JobKind::Analysis, JobKind::IssueCreation]),
            prop::sample::select(vec!["standup", "retro", "incident"]),
            0usize..2_000,
        )
            .prop_map(|(kind, category, size)| pending(kind, &[category, "task"], size))
    }

    proptest! {
        #[test]
        fn groups_are_pairwise_compatible(
            jobs in prop::collection::vec(arb_pending(), 0..40),
            max in 1usize..8,
            threshold in 0.1f64..1.0,
        ) {
            let groups = group(&jobs, max, threshold);

            let mut seen = vec![0usize; jobs.len()];
            for members in &groups {
                prop_assert!(!members.is_empty() && members.len() <= max);
                for &a in members {
                    seen[a] += 1;
                    for &b in members {
                        if a != b {
                            prop_assert_eq!(jobs[a].classifier.clone(), jobs[b].classifier.clone());
                            prop_assert!(compatible(&jobs[a], &jobs[b], threshold));
                        }
                    }
                }
            }
            prop_assert!(seen.iter().all(|&n| n == 1));
        }
    }
}
