//! Sliding-window, cost-weighted admission control per (subject, action).
//!
//! Each window lives under `ratelimit:{subject}:{action}` as a JSON list of
//! `(timestamp, cost)` entries, rewritten on every admitted check with a TTL
//! of one window. Stale entries are pruned lazily on the next check.
//!
//! If the persistence collaborator fails, the limiter **fails open**: the
//! request is admitted and a warning is logged.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use meetflow_core::SubjectId;

use super::timer::Clock;
use crate::config::RateLimitConfig;
use crate::persistence::KeyValueStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct WindowEntry {
    at_ms: i64,
    cost: u32,
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Cost counted in the window, including this request when allowed
    pub current: u32,
    pub remaining: u32,
    /// When the oldest in-window entry expires
    pub reset_at: DateTime<Utc>,
    /// Set on denial: how long until enough budget frees up to retry
    pub retry_after: Option<Duration>,
}

pub struct RateLimiter<S> {
    store: S,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
    /// Serializes read-modify-write of windows within this process.
    lock: Mutex<()>,
}

impl<S: KeyValueStore> RateLimiter<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self {
            store,
            clock,
            config,
            lock: Mutex::new(()),
        }
    }

    fn key(subject: &SubjectId, action: &str) -> String {
        format!("ratelimit:{subject}:{action}")
    }

    /// Check and, when allowed, record a request of `cost`.
    pub async fn check(&self, subject: &SubjectId, action: &str, cost: u32) -> RateDecision {
        let _guard = self.lock.lock().await;
        let now = self.clock.now();
        let key = Self::key(subject, action);

        let mut entries = match self.load(&key).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(subject = %subject, action, error = %e, "rate limit lookup failed; allowing request");
                return self.fail_open(now);
            }
        };

        let window_ms = self.window_ms();
        let now_ms = now.timestamp_millis();
        entries.retain(|e| e.at_ms > now_ms - window_ms);
        let used: u32 = entries.iter().map(|e| e.cost).sum();

        if used.saturating_add(cost) > self.config.limit {
            let reset_at = match entries.first() {
                Some(oldest) => ms_to_datetime(oldest.at_ms + window_ms),
                None => ms_to_datetime(now_ms + window_ms),
            };
            let retry_after = self.retry_after(&entries, cost, now_ms);
            debug!(subject = %subject, action, used, cost, "rate limit exceeded");
            return RateDecision {
                allowed: false,
                current: used,
                remaining: self.config.limit.saturating_sub(used),
                reset_at,
                retry_after: Some(retry_after),
            };
        }

        entries.push(WindowEntry { at_ms: now_ms, cost });
        let current = used + cost;
        let reset_at = ms_to_datetime(entries[0].at_ms + window_ms);

        if let Err(e) = self.persist(&key, &entries).await {
            warn!(subject = %subject, action, error = %e, "rate limit write failed; allowing request");
        }

        RateDecision {
            allowed: true,
            current,
            remaining: self.config.limit - current,
            reset_at,
            retry_after: None,
        }
    }

    /// Drop the window for a subject/action.
    pub async fn reset(&self, subject: &SubjectId, action: &str) {
        let _guard = self.lock.lock().await;
        if let Err(e) = self.store.delete(&Self::key(subject, action)).await {
            warn!(subject = %subject, action, error = %e, "rate limit reset failed");
        }
    }

    fn window_ms(&self) -> i64 {
        self.config.window.as_millis() as i64
    }

    /// Time until enough oldest entries age out for `cost` to fit.
    fn retry_after(&self, entries: &[WindowEntry], cost: u32, now_ms: i64) -> Duration {
        let window_ms = self.window_ms();
        let mut used: u32 = entries.iter().map(|e| e.cost).sum();
        for entry in entries {
            used -= entry.cost;
            if used.saturating_add(cost) <= self.config.limit {
                return Duration::from_millis((entry.at_ms + window_ms - now_ms).max(0) as u64);
            }
        }
        // A single request costing more than the limit never fits.
        self.config.window
    }

    fn fail_open(&self, now: DateTime<Utc>) -> RateDecision {
        RateDecision {
            allowed: true,
            current: 0,
            remaining: self.config.limit,
            reset_at: now + chrono::Duration::milliseconds(self.window_ms()),
            retry_after: None,
        }
    }

    async fn load(&self, key: &str) -> Result<Vec<WindowEntry>, String> {
        match self.store.get(key).await.map_err(|e| e.to_string())? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| e.to_string()),
            None => Ok(Vec::new()),
        }
    }

    async fn persist(&self, key: &str, entries: &[WindowEntry]) -> Result<(), String> {
        let bytes = serde_json::to_vec(entries).map_err(|e| e.to_string())?;
        self.store
            .put(key, bytes, Some(self.config.window))
            .await
            .map_err(|e| e.to_string())
    }
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::jobs::timer::ManualClock;
    use crate::persistence::InMemoryKeyValueStore;

    fn limiter(
        limit: u32,
        window: Duration,
    ) -> (
        Arc<InMemoryKeyValueStore>,
        Arc<ManualClock>,
        RateLimiter<Arc<InMemoryKeyValueStore>>,
    ) {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let clock = Arc::new(ManualClock::default());
        let limiter = RateLimiter::new(kv.clone(), clock.clone(), RateLimitConfig { limit, window });
        (kv, clock, limiter)
    }

    fn subject(s: &str) -> SubjectId {
        SubjectId::new(s).unwrap()
    }

    #[tokio::test]
    async fn third_request_over_limit_is_denied() {
        let (_, clock, limiter) = limiter(2, Duration::from_secs(60));
        let u1 = subject("U1");

        let first = limiter.check(&u1, "analysis", 1).await;
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert!(limiter.check(&u1, "analysis", 1).await.allowed);

        let third = limiter.check(&u1, "analysis", 1).await;
        assert!(!third.allowed);
        assert_eq!(third.current, 2);
        assert_eq!(third.remaining, 0);
        assert!(third.reset_at > clock.now());
        assert_eq!(third.retry_after, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn subjects_and_actions_are_independent() {
        let (_, _, limiter) = limiter(1, Duration::from_secs(60));
        assert!(limiter.check(&subject("U1"), "analysis", 1).await.allowed);
        assert!(limiter.check(&subject("U2"), "analysis", 1).await.allowed);
        assert!(limiter.check(&subject("U1"), "metrics", 1).await.allowed);
        assert!(!limiter.check(&subject("U1"), "analysis", 1).await.allowed);
    }

    #[tokio::test]
    async fn window_slides() {
        let (_, clock, limiter) = limiter(2, Duration::from_secs(60));
        let u1 = subject("U1");

        assert!(limiter.check(&u1, "analysis", 1).await.allowed);
        clock.advance(Duration::from_secs(30));
        assert!(limiter.check(&u1, "analysis", 1).await.allowed);

        let denied = limiter.check(&u1, "analysis", 1).await;
        assert_eq!(denied.retry_after, Some(Duration::from_secs(30)));

        clock.advance(Duration::from_secs(30));
        assert!(limiter.check(&u1, "analysis", 1).await.allowed);
        assert!(!limiter.check(&u1, "analysis", 1).await.allowed);
    }

    #[tokio::test]
    async fn cost_weighted() {
        let (_, _, limiter) = limiter(5, Duration::from_secs(60));
        let u1 = subject("U1");
        assert!(limiter.check(&u1, "analysis", 4).await.allowed);
        assert!(!limiter.check(&u1, "analysis", 2).await.allowed);
        assert!(limiter.check(&u1, "analysis", 1).await.allowed);
    }

    #[tokio::test]
    async fn fails_open_when_store_is_down() {
        let (kv, _, limiter) = limiter(1, Duration::from_secs(60));
        let u1 = subject("U1");
        kv.set_available(false);
        for _ in 0..5 {
            assert!(limiter.check(&u1, "analysis", 1).await.allowed);
        }
    }

    #[tokio::test]
    async fn reset_clears_window() {
        let (_, _, limiter) = limiter(1, Duration::from_secs(60));
        let u1 = subject("U1");
        assert!(limiter.check(&u1, "analysis", 1).await.allowed);
        limiter.reset(&u1, "analysis").await;
        assert!(limiter.check(&u1, "analysis", 1).await.allowed);
    }

    proptest! {
        #[test]
        fn admitted_cost_never_exceeds_limit(
            limit in 1u32..20,
            steps in prop::collection::vec((1u32..5, 0u64..30), 1..40),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let window = Duration::from_secs(60);
                let (_, clock, limiter) = limiter(limit, window);
                let u1 = subject("U1");
                let mut admitted: Vec<(DateTime<Utc>, u32)> = Vec::new();

                for (cost, gap) in steps {
                    clock.advance(Duration::from_secs(gap));
                    let now = clock.now();
                    let in_window: u32 = admitted
                        .iter()
                        .filter(|(at, _)| *at > now - chrono::Duration::seconds(60))
                        .map(|(_, c)| *c)
                        .sum();

                    let decision = limiter.check(&u1, "analysis", cost).await;
                    prop_assert_eq!(decision.allowed, in_window + cost <= limit);
                    if decision.allowed {
                        admitted.push((now, cost));
                        prop_assert!(decision.current <= limit);
                    } else {
                        prop_assert!(decision.reset_at > now);
                    }
                }

                // A quiet window restores the full budget.
                clock.advance(window);
                let decision = limiter.check(&u1, "analysis", limit).await;
                prop_assert!(decision.allowed);
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
