//! TTL cache for configured container limits
//!
//! Limits come from an inspect call and change far less often than the
//! runtime counters. Entries expire after a TTL; when the cache is full it
//! is cleared outright. Expired entries are swept lazily on access.

use crate::clock::{system_clock, SharedClock};
use crate::models::Limits;
use crate::observability::DashboardMetrics;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_LIMITS_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_LIMITS_CAPACITY: usize = 5000;
pub const DEFAULT_LIMITS_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Entry {
    data: Limits,
    expires_at: i64,
}

pub struct LimitsCache {
    entries: DashMap<String, Entry>,
    ttl_millis: i64,
    capacity: usize,
    sweep_interval_millis: i64,
    last_sweep: AtomicI64,
    clock: SharedClock,
    metrics: DashboardMetrics,
}

impl Default for LimitsCache {
    fn default() -> Self {
        Self::new(DEFAULT_LIMITS_TTL, DEFAULT_LIMITS_CAPACITY, system_clock())
    }
}

impl LimitsCache {
    pub fn new(ttl: Duration, capacity: usize, clock: SharedClock) -> Self {
        let now = clock.now_millis();
        Self {
            entries: DashMap::new(),
            ttl_millis: ttl.as_millis() as i64,
            capacity: capacity.max(1),
            sweep_interval_millis: DEFAULT_LIMITS_SWEEP_INTERVAL.as_millis() as i64,
            last_sweep: AtomicI64::new(now),
            clock,
            metrics: DashboardMetrics::new(),
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_millis = interval.as_millis() as i64;
        self
    }

    /// Unexpired limits for a container
    pub fn get(&self, id: &str) -> Option<Limits> {
        let now = self.clock.now_millis();
        self.maybe_sweep(now);

        // Copy out before removing; holding a shard ref across remove deadlocks
        let hit = self.entries.get(id).map(|entry| *entry.value());
        match hit {
            Some(entry) if now <= entry.expires_at => Some(entry.data),
            Some(_) => {
                self.entries.remove_if(id, |_, entry| now > entry.expires_at);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, id: &str, limits: Limits) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(id) {
            debug!(capacity = self.capacity, "Limits cache full, clearing");
            self.entries.clear();
        }

        let expires_at = self.clock.now_millis() + self.ttl_millis;
        self.entries.insert(
            id.to_string(),
            Entry {
                data: limits,
                expires_at,
            },
        );
        self.metrics.set_limits_cache_entries(self.entries.len() as i64);
    }

    /// Drop every expired entry; returns how many were removed
    pub fn sweep(&self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now <= entry.expires_at);
        let removed = before.saturating_sub(self.entries.len());
        self.metrics.set_limits_cache_entries(self.entries.len() as i64);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn maybe_sweep(&self, now: i64) {
        let last = self.last_sweep.load(Ordering::Acquire);
        if now - last <= self.sweep_interval_millis {
            return;
        }
        // Only the caller that wins the swap sweeps
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let removed = self.sweep(now);
            if removed > 0 {
                debug!(removed, remaining = self.len(), "Swept expired limits");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn limits(memory: u64) -> Limits {
        Limits {
            memory,
            memory_reservation: 0,
            cpu: 0.5,
        }
    }

    fn cache(capacity: usize) -> (LimitsCache, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let cache = LimitsCache::new(Duration::from_secs(60), capacity, Arc::new(clock.clone()));
        (cache, clock)
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let (cache, clock) = cache(10);
        cache.insert("web", limits(512));

        clock.advance(Duration::from_secs(60));
        assert_eq!(cache.get("web"), Some(limits(512)));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get("web"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_overflow_clears_everything() {
        let (cache, _clock) = cache(3);
        cache.insert("a", limits(1));
        cache.insert("b", limits(2));
        cache.insert("c", limits(3));
        assert_eq!(cache.len(), 3);

        cache.insert("d", limits(4));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("d"), Some(limits(4)));
    }

    #[test]
    fn test_refreshing_existing_key_does_not_clear() {
        let (cache, _clock) = cache(2);
        cache.insert("a", limits(1));
        cache.insert("b", limits(2));
        cache.insert("b", limits(3));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("b"), Some(limits(3)));
    }

    #[test]
    fn test_lazy_sweep_on_access() {
        let (cache, clock) = cache(100);
        cache.insert("old-1", limits(1));
        cache.insert("old-2", limits(2));
        clock.advance(Duration::from_secs(30));
        cache.insert("fresh", limits(3));

        // Past the first TTL and the sweep interval, before the second TTL
        clock.advance(Duration::from_secs(45));
        assert_eq!(cache.get("fresh"), Some(limits(3)));
        assert_eq!(cache.len(), 1);
    }
}
