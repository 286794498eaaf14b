//! Fingerprint-keyed result cache with TTL and approximate LRU eviction.
//!
//! Only successful results go in. Expiry is checked at read time; an entry
//! older than the TTL is a miss and is removed. When the cache is full, one
//! eviction pass drops expired entries and then a fixed fraction of the
//! least-recently-accessed ones (a sort, not a strict LRU list).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::types::Fingerprint;
use crate::config::CacheConfig;

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_accessed: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.created_at) >= ttl
    }
}

pub struct ResultCache<V> {
    config: CacheConfig,
    entries: Mutex<HashMap<Fingerprint, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &Fingerprint) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let value = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(self.config.ttl, now) => {
                entry.last_accessed = now;
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };

        match value {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    pub fn put(&self, key: Fingerprint, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if !entries.contains_key(&key) && entries.len() >= self.config.capacity {
            self.evict(&mut entries, now);
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                last_accessed: now,
            },
        );
    }

    fn evict(&self, entries: &mut HashMap<Fingerprint, CacheEntry<V>>, now: Instant) {
        let ttl = self.config.ttl;
        entries.retain(|_, e| !e.is_expired(ttl, now));
        if entries.len() < self.config.capacity {
            return;
        }

        let quota = ((self.config.capacity as f64) * self.config.eviction_fraction).ceil() as usize;
        let quota = quota.clamp(1, entries.len());

        let mut by_access: Vec<(Instant, Fingerprint)> = entries
            .iter()
            .map(|(k, e)| (e.last_accessed, k.clone()))
            .collect();
        by_access.sort_by_key(|(at, _)| *at);

        for (_, key) in by_access.into_iter().take(quota) {
            entries.remove(&key);
        }
        debug!(evicted = quota, remaining = entries.len(), "result cache eviction pass");
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(ttl, now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hits over lookups; 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
