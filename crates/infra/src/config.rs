//! Engine configuration.
//!
//! Every heuristic threshold (batch similarity, routing cut-offs, rate
//! limits) is configuration. Defaults are tuned for a single-node deployment
//! talking to a hosted LLM.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::jobs::retry::RetryPolicy;
use crate::jobs::types::JobKind;

const ENV_PREFIX: &str = "MEETFLOW_";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One value per job kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerKind<T> {
    pub analysis: T,
    pub issue_creation: T,
    pub metrics: T,
}

impl<T> PerKind<T> {
    pub fn get(&self, kind: JobKind) -> &T {
        match kind {
            JobKind::Analysis => &self.analysis,
            JobKind::IssueCreation => &self.issue_creation,
            JobKind::Metrics => &self.metrics,
        }
    }

    pub fn get_mut(&mut self, kind: JobKind) -> &mut T {
        match kind {
            JobKind::Analysis => &mut self.analysis,
            JobKind::IssueCreation => &mut self.issue_creation,
            JobKind::Metrics => &mut self.metrics,
        }
    }
}

/// Batch accumulation knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// A batch is released as soon as it holds this many jobs.
    pub max_batch_size: usize,
    /// Longest time the oldest member of a batch may wait for peers.
    pub flush_interval: Duration,
    /// Minimum `min(len)/max(len)` payload size ratio for two jobs to share a batch.
    pub similarity_threshold: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 5,
            flush_interval: Duration::from_secs(2),
            similarity_threshold: 0.5,
        }
    }
}

/// Immediate-vs-queued routing knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Payloads at or below this many characters count as small.
    pub small_payload_chars: usize,
    /// Classifier values (meeting type, metric name, ...) that want low latency.
    pub low_latency_categories: Vec<String>,
    /// Below this queue depth every job runs immediately.
    pub low_load_threshold: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            small_payload_chars: 2_000,
            low_latency_categories: vec!["standup".to_string(), "incident".to_string()],
            low_load_threshold: 2,
        }
    }
}

impl RoutingConfig {
    pub fn is_low_latency(&self, category: &str) -> bool {
        self.low_latency_categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(category))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum summed cost per subject and action inside one window.
    pub limit: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
    /// Share of entries dropped by one eviction pass when the cache is full.
    pub eviction_fraction: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            ttl: Duration::from_secs(60 * 60),
            eviction_fraction: 0.2,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Max parallel downstream calls per resource class.
    pub pools: PerKind<usize>,
    pub retry: PerKind<RetryPolicy>,
    pub batch: BatchConfig,
    pub routing: RoutingConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub max_payload_chars: usize,
    /// How long terminal job records stay readable.
    pub job_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pools: PerKind {
                analysis: 4,
                issue_creation: 8,
                metrics: 2,
            },
            retry: PerKind {
                analysis: RetryPolicy::new(3, Duration::from_secs(30)),
                issue_creation: RetryPolicy::new(5, Duration::from_secs(10)),
                metrics: RetryPolicy::new(2, Duration::from_secs(5)),
            },
            batch: BatchConfig::default(),
            routing: RoutingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            max_payload_chars: 100_000,
            job_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `MEETFLOW_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup` (keys carry the `MEETFLOW_` prefix).
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = EnvReader { lookup: &lookup };

        for kind in JobKind::ALL {
            let upper = kind.action_name().to_uppercase();
            env.set(&format!("POOL_{upper}"), config.pools.get_mut(kind));

            let retry = config.retry.get_mut(kind);
            env.set(&format!("RETRY_{upper}_MAX_ATTEMPTS"), &mut retry.max_attempts);
            env.set_millis(&format!("RETRY_{upper}_BASE_MS"), &mut retry.base_delay);
        }

        env.set("BATCH_MAX_SIZE", &mut config.batch.max_batch_size);
        env.set_millis("BATCH_FLUSH_MS", &mut config.batch.flush_interval);
        env.set("BATCH_SIMILARITY", &mut config.batch.similarity_threshold);

        env.set("ROUTE_SMALL_PAYLOAD_CHARS", &mut config.routing.small_payload_chars);
        env.set("ROUTE_LOW_LOAD_THRESHOLD", &mut config.routing.low_load_threshold);
        if let Some(list) = env.raw("ROUTE_LOW_LATENCY") {
            config.routing.low_latency_categories = list
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }

        env.set("RATE_LIMIT", &mut config.rate_limit.limit);
        env.set_secs("RATE_WINDOW_SECS", &mut config.rate_limit.window);

        env.set("CACHE_CAPACITY", &mut config.cache.capacity);
        env.set_secs("CACHE_TTL_SECS", &mut config.cache.ttl);
        env.set("CACHE_EVICTION_FRACTION", &mut config.cache.eviction_fraction);

        env.set("MAX_PAYLOAD_CHARS", &mut config.max_payload_chars);
        env.set_secs("JOB_RETENTION_SECS", &mut config.job_retention);

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for kind in JobKind::ALL {
            if *self.pools.get(kind) == 0 {
                return Err(ConfigError::Invalid(format!("{kind} pool needs parallelism >= 1")));
            }
            if self.retry.get(kind).max_attempts == 0 {
                return Err(ConfigError::Invalid(format!("{kind} retry needs max_attempts >= 1")));
            }
        }
        if self.batch.max_batch_size == 0 {
            return Err(ConfigError::Invalid("max_batch_size must be >= 1".to_string()));
        }
        if !(self.batch.similarity_threshold > 0.0 && self.batch.similarity_threshold <= 1.0) {
            return Err(ConfigError::Invalid(
                "similarity_threshold must be in (0, 1]".to_string(),
            ));
        }
        if self.rate_limit.limit == 0 || self.rate_limit.window.is_zero() {
            return Err(ConfigError::Invalid(
                "rate limit and window must be positive".to_string(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache capacity must be >= 1".to_string()));
        }
        if !(self.cache.eviction_fraction > 0.0 && self.cache.eviction_fraction <= 1.0) {
            return Err(ConfigError::Invalid(
                "eviction_fraction must be in (0, 1]".to_string(),
            ));
        }
        if self.max_payload_chars == 0 {
            return Err(ConfigError::Invalid("max_payload_chars must be >= 1".to_string()));
        }
        Ok(())
    }
}

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<F> EnvReader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{suffix}"))
    }

    fn set<T: std::str::FromStr>(&self, suffix: &str, target: &mut T) {
        if let Some(raw) = self.raw(suffix) {
            match raw.trim().parse() {
                Ok(v) => *target = v,
                Err(_) => warn!(key = %format!("{ENV_PREFIX}{suffix}"), value = %raw, "ignoring unparseable config value"),
            }
        }
    }

    fn set_millis(&self, suffix: &str, target: &mut Duration) {
        let mut ms = target.as_millis() as u64;
        self.set(suffix, &mut ms);
        *target = Duration::from_millis(ms);
    }

    fn set_secs(&self, suffix: &str, target: &mut Duration) {
        let mut secs = target.as_secs();
        self.set(suffix, &mut secs);
        *target = Duration::from_secs(secs);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn env_overrides_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("MEETFLOW_POOL_ANALYSIS", "7"),
            ("MEETFLOW_RETRY_ISSUE_CREATION_MAX_ATTEMPTS", "9"),
            ("MEETFLOW_RETRY_ANALYSIS_BASE_MS", "1500"),
            ("MEETFLOW_BATCH_SIMILARITY", "0.75"),
            ("MEETFLOW_ROUTE_LOW_LATENCY", "Standup, triage ,"),
            ("MEETFLOW_RATE_WINDOW_SECS", "30"),
        ]));

        assert_eq!(config.pools.analysis, 7);
        assert_eq!(config.retry.issue_creation.max_attempts, 9);
        assert_eq!(config.retry.analysis.base_delay, Duration::from_millis(1500));
        assert_eq!(config.batch.similarity_threshold, 0.75);
        assert_eq!(
            config.routing.low_latency_categories,
            vec!["standup".to_string(), "triage".to_string()]
        );
        assert_eq!(config.rate_limit.window, Duration::from_secs(30));
        assert_eq!(config.rate_limit.limit, RateLimitConfig::default().limit);
    }

    #[test]
    fn unparseable_values_keep_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[("MEETFLOW_CACHE_CAPACITY", "lots")]));
        assert_eq!(config.cache.capacity, CacheConfig::default().capacity);
    }

    #[test]
    fn validate_rejects_bad_thresholds() {
        let mut config = EngineConfig::default();
        config.batch.similarity_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.pools.metrics = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.cache.eviction_fraction = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn low_latency_match_ignores_case() {
        let routing = RoutingConfig::default();
        assert!(routing.is_low_latency("StandUp"));
        assert!(!routing.is_low_latency("retro"));
    }
}
