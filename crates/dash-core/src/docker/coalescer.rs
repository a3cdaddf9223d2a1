//! Request coalescing for bursty read endpoints
//!
//! At most one upstream fetch runs per key. Callers arriving while it is in
//! flight await the same shared future. A successful result is cached for a
//! short TTL. The in-flight marker is cleared when the fetch finishes,
//! whether it succeeded or failed, so later callers retry instead of hanging.

use crate::clock::{system_clock, SharedClock};
use crate::error::{Error, Result};
use crate::observability::DashboardMetrics;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_COALESCE_TTL: Duration = Duration::from_secs(2);

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V>>>;

struct InFlight<V> {
    generation: u64,
    future: SharedFetch<V>,
}

struct Cached<V> {
    value: V,
    expires_at: i64,
}

struct State<K, V> {
    in_flight: HashMap<K, InFlight<V>>,
    cache: HashMap<K, Cached<V>>,
}

struct Inner<K, V> {
    state: Mutex<State<K, V>>,
    next_generation: AtomicU64,
    ttl_millis: i64,
    clock: SharedClock,
    metrics: DashboardMetrics,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash,
{
    fn lock(&self) -> std::sync::MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Clear the in-flight marker of `generation` and cache a success
    fn finish(&self, key: K, generation: u64, value: Option<V>) {
        let now = self.clock.now_millis();
        let mut state = self.lock();

        let current = state
            .in_flight
            .get(&key)
            .is_some_and(|entry| entry.generation == generation);
        if !current {
            return;
        }
        state.in_flight.remove(&key);

        if let Some(value) = value {
            if self.ttl_millis > 0 {
                state.cache.insert(
                    key,
                    Cached {
                        value,
                        expires_at: now + self.ttl_millis,
                    },
                );
            }
        }
    }
}

/// Single-flight fetcher with a short result cache
pub struct RequestCoalescer<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for RequestCoalescer<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for RequestCoalescer<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_COALESCE_TTL, system_clock())
    }
}

impl<K, V> RequestCoalescer<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    in_flight: HashMap::new(),
                    cache: HashMap::new(),
                }),
                next_generation: AtomicU64::new(1),
                ttl_millis: ttl.as_millis() as i64,
                clock,
                metrics: DashboardMetrics::new(),
            }),
        }
    }

    /// Cached value, the in-flight result, or the result of a new fetch.
    ///
    /// `fetch` is only invoked when no fetch for `key` is running. It runs
    /// on its own task, so it completes even if every caller goes away.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let shared = {
            let now = self.inner.clock.now_millis();
            let mut state = self.inner.lock();

            match state.cache.get(&key) {
                Some(cached) if now < cached.expires_at => {
                    self.inner.metrics.inc_coalescer_cache_hits();
                    return Ok(cached.value.clone());
                }
                Some(_) => {
                    state.cache.remove(&key);
                }
                None => {}
            }

            if let Some(entry) = state.in_flight.get(&key) {
                self.inner.metrics.inc_coalescer_joined();
                entry.future.clone()
            } else {
                state.cache.retain(|_, cached| now < cached.expires_at);

                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let future = self.spawn_fetch(key.clone(), generation, fetch());
                state.in_flight.insert(
                    key,
                    InFlight {
                        generation,
                        future: future.clone(),
                    },
                );
                self.inner.metrics.inc_coalescer_upstream_fetches();
                future
            }
        };

        shared.await
    }

    fn spawn_fetch<Fut>(&self, key: K, generation: u64, fetch: Fut) -> SharedFetch<V>
    where
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let result = fetch.await;
            inner.finish(task_key, generation, result.as_ref().ok().cloned());
            result
        });

        let inner = Arc::clone(&self.inner);
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    // The task never reached `finish`
                    inner.finish(key, generation, None);
                    Err(Error::Internal(format!("coalesced fetch failed: {}", e)))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Forget any cached value for `key`.
    ///
    /// A fetch already in flight still answers its own callers, but its
    /// result is not cached and the next caller starts a fresh fetch.
    pub fn invalidate(&self, key: &K) {
        let mut state = self.inner.lock();
        let cached = state.cache.remove(key).is_some();
        let in_flight = state.in_flight.remove(key).is_some();
        if cached || in_flight {
            debug!(cached, in_flight, "Coalescer entry invalidated");
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn cached(&self) -> usize {
        self.inner.lock().cache.len()
    }
}
