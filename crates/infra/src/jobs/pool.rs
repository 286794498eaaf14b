//! Bounded-parallelism executor, one per job kind.
//!
//! `run` never blocks: a unit (one job or a released batch) goes to the back
//! of the FIFO `waiting` queue and the pool starts as many tasks as it has free
//! slots. A batch fans out member by member, so a partly started batch stays
//! at the front until all of its members got a slot. Every finished task
//! frees its slot and immediately pulls the next waiting task, including when
//! the task panicked. Without a tokio runtime nothing is started and the
//! queue is left intact for the next `run` on a runtime.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use meetflow_core::{BatchId, JobId};

use super::types::JobKind;

/// One job's execution future.
pub struct PoolTask {
    pub job_id: JobId,
    pub fut: BoxFuture<'static, ()>,
}

/// A job or a batch handed to [`ConcurrencyPool::run`].
pub struct WorkUnit {
    pub batch_id: Option<BatchId>,
    tasks: VecDeque<PoolTask>,
}

impl WorkUnit {
    pub fn single(task: PoolTask) -> Self {
        Self {
            batch_id: None,
            tasks: VecDeque::from([task]),
        }
    }

    pub fn batch(batch_id: BatchId, tasks: Vec<PoolTask>) -> Self {
        Self {
            batch_id: Some(batch_id),
            tasks: tasks.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStats {
    pub kind: JobKind,
    pub active: usize,
    /// Tasks not yet started
    pub waiting: usize,
    pub max_parallelism: usize,
    pub peak_active: usize,
    /// `active / max_parallelism`
    pub utilization: f64,
}

#[derive(Default)]
struct PoolState {
    active: usize,
    peak_active: usize,
    waiting: VecDeque<WorkUnit>,
}

pub struct ConcurrencyPool {
    kind: JobKind,
    max_parallelism: usize,
    state: Mutex<PoolState>,
}

impl ConcurrencyPool {
    pub fn new(kind: JobKind, max_parallelism: usize) -> Self {
        Self {
            kind,
            max_parallelism: max_parallelism.max(1),
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Enqueue a unit and start whatever fits. Fire-and-forget.
    pub fn run(self: &Arc<Self>, unit: WorkUnit) {
        if unit.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.waiting.push_back(unit);
        }
        self.dispatch();
    }

    /// Drop a job that has not started yet.
    pub fn remove(&self, job_id: JobId) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        for unit in state.waiting.iter_mut() {
            let before = unit.tasks.len();
            unit.tasks.retain(|t| t.job_id != job_id);
            removed |= unit.tasks.len() != before;
        }
        state.waiting.retain(|u| !u.tasks.is_empty());
        removed
    }

    /// Number of tasks waiting for a slot.
    pub fn waiting(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.waiting.iter().map(WorkUnit::len).sum()
    }

    pub fn snapshot(&self) -> PoolStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        PoolStats {
            kind: self.kind,
            active: state.active,
            waiting: state.waiting.iter().map(WorkUnit::len).sum(),
            max_parallelism: self.max_parallelism,
            peak_active: state.peak_active,
            utilization: state.active as f64 / self.max_parallelism as f64,
        }
    }

    fn dispatch(self: &Arc<Self>) {
        let Ok(handle) = Handle::try_current() else {
            warn!(kind = %self.kind, waiting = self.waiting(), "no runtime available; tasks stay queued");
            return;
        };

        let mut ready = Vec::new();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            while state.active < self.max_parallelism {
                let Some(unit) = state.waiting.front_mut() else {
                    break;
                };
                let Some(task) = unit.tasks.pop_front() else {
                    state.waiting.pop_front();
                    continue;
                };
                if unit.tasks.is_empty() {
                    state.waiting.pop_front();
                }
                state.active += 1;
                state.peak_active = state.peak_active.max(state.active);
                ready.push(task);
            }
        }

        for task in ready {
            self.spawn(&handle, task);
        }
    }

    fn spawn(self: &Arc<Self>, handle: &Handle, task: PoolTask) {
        let slot = Slot {
            pool: Arc::clone(self),
        };
        debug!(kind = %self.kind, job_id = %task.job_id, "pool task started");
        handle.spawn(async move {
            let _slot = slot;
            task.fut.await;
        });
    }

    fn release(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.active = state.active.saturating_sub(1);
        }
        self.dispatch();
    }
}

/// Occupied slot; frees itself on drop, even when the task panics.
struct Slot {
    pool: Arc<ConcurrencyPool>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.pool.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;

    fn sleeper(counter: Arc<AtomicUsize>, ms: u64) -> PoolTask {
        PoolTask {
            job_id: JobId::new(),
            fut: async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_parallelism() {
        let pool = Arc::new(ConcurrencyPool::new(JobKind::Analysis, 3));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            pool.run(WorkUnit::single(sleeper(done.clone(), 100)));
        }
        let stats = pool.snapshot();
        assert_eq!(stats.active, 3);
        assert_eq!(stats.waiting, 7);
        assert!((stats.utilization - 1.0).abs() < f64::EPSILON);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(done.load(Ordering::SeqCst), 10);

        let stats = pool.snapshot();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.peak_active, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_fans_out_within_capacity() {
        let pool = Arc::new(ConcurrencyPool::new(JobKind::IssueCreation, 2));
        let done = Arc::new(AtomicUsize::new(0));

        let tasks = (0..3).map(|_| sleeper(done.clone(), 50)).collect();
        pool.run(WorkUnit::batch(BatchId::new(), tasks));
        assert_eq!(pool.snapshot().active, 2);
        assert_eq!(pool.waiting(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(done.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_units_run_fifo() {
        let pool = Arc::new(ConcurrencyPool::new(JobKind::Analysis, 1));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let order = order.clone();
            pool.run(WorkUnit::single(PoolTask {
                job_id: JobId::new(),
                fut: async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    order.lock().unwrap().push(i);
                }
                .boxed(),
            }));
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_task_never_runs() {
        let pool = Arc::new(ConcurrencyPool::new(JobKind::Analysis, 1));
        let done = Arc::new(AtomicUsize::new(0));

        pool.run(WorkUnit::single(sleeper(done.clone(), 100)));
        let queued = sleeper(done.clone(), 100);
        let queued_id = queued.job_id;
        pool.run(WorkUnit::single(queued));

        assert!(pool.remove(queued_id));
        assert_eq!(pool.waiting(), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_task_frees_its_slot() {
        let pool = Arc::new(ConcurrencyPool::new(JobKind::Metrics, 1));
        let done = Arc::new(AtomicUsize::new(0));

        pool.run(WorkUnit::single(PoolTask {
            job_id: JobId::new(),
            fut: async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                panic!("collaborator blew up");
            }
            .boxed(),
        }));
        pool.run(WorkUnit::single(sleeper(done.clone(), 10)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(pool.snapshot().active, 0);
    }

    #[test]
    fn tasks_submitted_outside_a_runtime_stay_queued() {
        let pool = Arc::new(ConcurrencyPool::new(JobKind::Analysis, 2));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            pool.run(WorkUnit::single(sleeper(done.clone(), 10)));
        }
        let stats = pool.snapshot();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.waiting, 3);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            pool.run(WorkUnit::single(sleeper(done.clone(), 10)));
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(pool.snapshot().waiting, 0);
    }
}
