//! Priority and immediate-vs-queued routing policy.

use super::types::{CallerTier, JobPayload};
use crate::config::RoutingConfig;

/// Where a freshly created job goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Straight to the kind's pool, no batching.
    Immediate,
    /// Into the batch accumulator.
    Queued,
}

fn tier_base(tier: CallerTier) -> u32 {
    match tier {
        CallerTier::Premium => 0,
        CallerTier::Standard => 10,
        CallerTier::Free => 20,
    }
}

/// Lower is more urgent. Computed once per job.
pub fn priority_for(tier: CallerTier, payload: &JobPayload, routing: &RoutingConfig) -> u32 {
    let urgency = if routing.is_low_latency(payload.category()) {
        0
    } else {
        5
    };
    let size_bucket = (payload.content_len() / 1_000).min(10) as u32;
    tier_base(tier) + urgency + size_bucket
}

/// Load seen by a job when it is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Load {
    /// Accumulated jobs plus tasks waiting for any pool.
    pub queue_depth: usize,
    /// Slots of the job's own pool that are running or spoken for.
    pub pool_occupied: usize,
    pub pool_capacity: usize,
}

impl Load {
    /// Dispatching one more job would leave the pool without a free slot.
    pub fn pool_saturated(&self) -> bool {
        self.pool_occupied + 1 >= self.pool_capacity
    }
}

/// Pick the path for a new or requeued job.
///
/// While its pool has headroom, a job runs immediately when it is small and
/// latency-sensitive or when the system is lightly loaded. Once one more job
/// would saturate the pool, everything goes through the accumulator so that
/// scarce slots serve whole batches.
pub fn choose_route(payload: &JobPayload, load: Load, routing: &RoutingConfig) -> Route {
    if load.pool_saturated() {
        return Route::Queued;
    }
    let small = payload.content_len() <= routing.small_payload_chars;
    let low_latency = routing.is_low_latency(payload.category());
    if (small && low_latency) || load.queue_depth < routing.low_load_threshold {
        Route::Immediate
    } else {
        Route::Queued
    }
}

#[cfg(test)]
mod tests {
    use meetflow_ai::TranscriptPayload;

    use super::*;

    fn transcript(len: usize, meeting: &str) -> JobPayload {
        JobPayload::Analysis(TranscriptPayload::new("x".repeat(len), meeting, "task"))
    }

    #[test]
    fn priority_combines_tier_urgency_and_size() {
        let routing = RoutingConfig::default();
        assert_eq!(priority_for(CallerTier::Premium, &transcript(10, "standup"), &routing), 0);
        assert_eq!(priority_for(CallerTier::Standard, &transcript(10, "retro"), &routing), 15);
        assert_eq!(priority_for(CallerTier::Free, &transcript(3_500, "retro"), &routing), 28);
        assert_eq!(priority_for(CallerTier::Free, &transcript(50_000, "retro"), &routing), 35);
    }

    fn idle_pool(queue_depth: usize) -> Load {
        Load {
            queue_depth,
            pool_occupied: 0,
            pool_capacity: 4,
        }
    }

    #[test]
    fn small_low_latency_payloads_skip_the_queue() {
        let routing = RoutingConfig::default();
        assert_eq!(choose_route(&transcript(500, "standup"), idle_pool(10), &routing), Route::Immediate);
        assert_eq!(choose_route(&transcript(500, "retro"), idle_pool(10), &routing), Route::Queued);
        assert_eq!(choose_route(&transcript(5_000, "standup"), idle_pool(10), &routing), Route::Queued);
    }

    #[test]
    fn low_load_runs_everything_immediately() {
        let routing = RoutingConfig::default();
        assert_eq!(choose_route(&transcript(5_000, "retro"), idle_pool(1), &routing), Route::Immediate);
        assert_eq!(choose_route(&transcript(5_000, "retro"), idle_pool(2), &routing), Route::Queued);
    }

    #[test]
    fn saturated_pool_sends_everything_to_batching() {
        let routing = RoutingConfig::default();
        let single_slot = Load {
            queue_depth: 0,
            pool_occupied: 0,
            pool_capacity: 1,
        };
        assert!(single_slot.pool_saturated());
        assert_eq!(choose_route(&transcript(500, "standup"), single_slot, &routing), Route::Queued);

        let last_free_slot = Load {
            queue_depth: 0,
            pool_occupied: 3,
            pool_capacity: 4,
        };
        assert_eq!(choose_route(&transcript(10, "standup"), last_free_slot, &routing), Route::Queued);

        let headroom = Load {
            pool_occupied: 2,
            ..last_free_slot
        };
        assert_eq!(choose_route(&transcript(10, "standup"), headroom, &routing), Route::Immediate);
    }
}
