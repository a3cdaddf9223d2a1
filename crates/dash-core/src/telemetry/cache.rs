//! Latest sample, history and alert evaluation
//!
//! The latest sample and the history buffer live behind one lock and are
//! replaced together, so readers never see a new sample with stale history.

use super::alerts::{AlertEngine, AlertThresholds, DEFAULT_ALERT_COOLDOWN};
use super::broadcaster::{Broadcaster, Subscription, TelemetryEvent, DEFAULT_SUBSCRIBER_BUFFER};
use super::history::{RingHistory, DEFAULT_HISTORY_CAPACITY, DEFAULT_HISTORY_WINDOW};
use crate::clock::{system_clock, SharedClock};
use crate::models::{AlertEvent, HistoryPoint, Sample};
use crate::observability::DashboardMetrics;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Configuration for the telemetry cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of history points (default: 1800)
    pub history_capacity: usize,
    /// Maximum age of history points (default: 1 hour)
    pub history_window: Duration,
    pub thresholds: AlertThresholds,
    /// Minimum time between two alerts of the same type and level (default: 5 minutes)
    pub alert_cooldown: Duration,
    /// Per-subscriber queue depth
    pub subscriber_buffer: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            history_window: DEFAULT_HISTORY_WINDOW,
            thresholds: AlertThresholds::default(),
            alert_cooldown: DEFAULT_ALERT_COOLDOWN,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

struct CacheState {
    latest: Option<Arc<Sample>>,
    history: RingHistory,
}

/// Process-wide telemetry state
pub struct TelemetryCache {
    state: RwLock<CacheState>,
    alerts: AlertEngine,
    broadcaster: Broadcaster,
    clock: SharedClock,
    metrics: DashboardMetrics,
}

impl Default for TelemetryCache {
    fn default() -> Self {
        Self::new(CacheConfig::default(), system_clock())
    }
}

impl TelemetryCache {
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            state: RwLock::new(CacheState {
                latest: None,
                history: RingHistory::new(config.history_capacity, config.history_window),
            }),
            alerts: AlertEngine::new(config.thresholds).with_cooldown(config.alert_cooldown),
            broadcaster: Broadcaster::new(config.subscriber_buffer),
            clock,
            metrics: DashboardMetrics::new(),
        }
    }

    /// Store a new sample and notify subscribers.
    ///
    /// Returns the alerts that fired for this sample.
    pub fn set_sample(&self, sample: Sample) -> Vec<AlertEvent> {
        let now = self.clock.now_millis();
        let sample = Arc::new(sample);

        {
            let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            state.latest = Some(sample.clone());
            state.history.append(HistoryPoint::from(sample.as_ref()), now);
        }

        let alerts = self.alerts.evaluate(&sample, now);
        let mut dropped = 0;
        for alert in &alerts {
            dropped += self.broadcaster.publish(TelemetryEvent::Alert(alert.clone())).dropped;
        }
        dropped += self.broadcaster.publish(TelemetryEvent::Update(sample)).dropped;
        if dropped > 0 {
            self.metrics.add_subscriber_events_dropped(dropped as u64);
        }

        alerts
    }

    /// Most recent sample, `None` until the first successful poll
    pub fn latest(&self) -> Option<Arc<Sample>> {
        self.read_state(|state| state.latest.clone())
    }

    /// Ordered copy of the history
    pub fn history(&self) -> Vec<HistoryPoint> {
        self.read_state(|state| state.history.snapshot())
    }

    /// Latest sample and history taken under the same lock
    pub fn snapshot(&self) -> (Option<Arc<Sample>>, Vec<HistoryPoint>) {
        self.read_state(|state| (state.latest.clone(), state.history.snapshot()))
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Current time according to the cache clock (Unix ms)
    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn alert_engine(&self) -> &AlertEngine {
        &self.alerts
    }

    fn read_state<T>(&self, f: impl FnOnce(&CacheState) -> T) -> T {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&state)
    }
}
