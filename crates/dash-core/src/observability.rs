//! Observability infrastructure for the dashboard server
//!
//! Provides:
//! - Prometheus metrics (sampling, alerts, subscribers, container stats, coalescing)
//! - Structured JSON logging with tracing

use crate::models::AlertEvent;
use crate::telemetry::PollerState;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for container stats latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 1.5, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<DashboardMetricsInner> = OnceLock::new();

struct DashboardMetricsInner {
    samples_collected: IntCounter,
    sample_failures: IntCounterVec,
    alerts_fired: IntCounterVec,
    subscribers: IntGauge,
    poller_active: IntGauge,
    subscriber_events_dropped: IntCounter,
    container_stats_latency_seconds: Histogram,
    container_fetch_failures: IntCounterVec,
    limits_cache_entries: IntGauge,
    coalescer_upstream_fetches: IntCounter,
    coalescer_joined: IntCounter,
    coalescer_cache_hits: IntCounter,
    rate_limited_requests: IntCounter,
}

impl DashboardMetricsInner {
    fn new() -> Self {
        Self {
            samples_collected: register_int_counter!(
                "dashboard_samples_collected_total",
                "Host telemetry samples stored in the cache"
            )
            .expect("Failed to register samples_collected"),

            sample_failures: register_int_counter_vec!(
                "dashboard_sample_failures_total",
                "Failed host metric reads by poll loop",
                &["loop"]
            )
            .expect("Failed to register sample_failures"),

            alerts_fired: register_int_counter_vec!(
                "dashboard_alerts_fired_total",
                "Threshold alerts emitted",
                &["type", "level"]
            )
            .expect("Failed to register alerts_fired"),

            subscribers: register_int_gauge!(
                "dashboard_stream_subscribers",
                "Connected telemetry stream subscribers"
            )
            .expect("Failed to register subscribers"),

            poller_active: register_int_gauge!(
                "dashboard_poller_active",
                "1 while the fast poll loop is running"
            )
            .expect("Failed to register poller_active"),

            subscriber_events_dropped: register_int_counter!(
                "dashboard_subscriber_events_dropped_total",
                "Events dropped because a subscriber queue was full"
            )
            .expect("Failed to register subscriber_events_dropped"),

            container_stats_latency_seconds: register_histogram!(
                "dashboard_container_stats_latency_seconds",
                "Time spent aggregating stats for a batch of containers",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register container_stats_latency_seconds"),

            container_fetch_failures: register_int_counter_vec!(
                "dashboard_container_fetch_failures_total",
                "Per-container stats fetches that fell back to zero values",
                &["reason"]
            )
            .expect("Failed to register container_fetch_failures"),

            limits_cache_entries: register_int_gauge!(
                "dashboard_limits_cache_entries",
                "Entries in the container limits cache"
            )
            .expect("Failed to register limits_cache_entries"),

            coalescer_upstream_fetches: register_int_counter!(
                "dashboard_coalescer_upstream_fetches_total",
                "Upstream fetches started by the request coalescer"
            )
            .expect("Failed to register coalescer_upstream_fetches"),

            coalescer_joined: register_int_counter!(
                "dashboard_coalescer_joined_total",
                "Requests that joined an in-flight fetch"
            )
            .expect("Failed to register coalescer_joined"),

            coalescer_cache_hits: register_int_counter!(
                "dashboard_coalescer_cache_hits_total",
                "Requests served from the short-lived result cache"
            )
            .expect("Failed to register coalescer_cache_hits"),

            rate_limited_requests: register_int_counter!(
                "dashboard_rate_limited_requests_total",
                "Requests rejected by the rate limiter"
            )
            .expect("Failed to register rate_limited_requests"),
        }
    }
}

/// Dashboard metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct DashboardMetrics {
    _private: (),
}

impl Default for DashboardMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DashboardMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(DashboardMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &DashboardMetricsInner {
        GLOBAL_METRICS.get_or_init(DashboardMetricsInner::new)
    }

    pub fn inc_samples_collected(&self) {
        self.inner().samples_collected.inc();
    }

    /// `loop_name` is `fast` or `slow`
    pub fn inc_sample_failures(&self, loop_name: &str) {
        self.inner().sample_failures.with_label_values(&[loop_name]).inc();
    }

    pub fn inc_alerts_fired(&self, alert_type: &str, level: &str) {
        self.inner()
            .alerts_fired
            .with_label_values(&[alert_type, level])
            .inc();
    }

    pub fn set_subscribers(&self, count: i64) {
        self.inner().subscribers.set(count);
    }

    pub fn set_poller_active(&self, active: bool) {
        self.inner().poller_active.set(i64::from(active));
    }

    pub fn add_subscriber_events_dropped(&self, count: u64) {
        self.inner().subscriber_events_dropped.inc_by(count);
    }

    pub fn observe_container_stats_latency(&self, duration_secs: f64) {
        self.inner()
            .container_stats_latency_seconds
            .observe(duration_secs);
    }

    /// `reason` is `timeout` or `error`
    pub fn inc_container_fetch_failures(&self, reason: &str) {
        self.inner()
            .container_fetch_failures
            .with_label_values(&[reason])
            .inc();
    }

    pub fn set_limits_cache_entries(&self, count: i64) {
        self.inner().limits_cache_entries.set(count);
    }

    pub fn inc_coalescer_upstream_fetches(&self) {
        self.inner().coalescer_upstream_fetches.inc();
    }

    pub fn inc_coalescer_joined(&self) {
        self.inner().coalescer_joined.inc();
    }

    pub fn inc_coalescer_cache_hits(&self) {
        self.inner().coalescer_cache_hits.inc();
    }

    pub fn inc_rate_limited(&self) {
        self.inner().rate_limited_requests.inc();
    }
}

/// Structured logger for server events
///
/// Consistent field names for lifecycle, poller and alert events.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Log a threshold alert
    pub fn log_alert(&self, alert: &AlertEvent) {
        warn!(
            event = "alert_fired",
            node = %self.node_name,
            alert_id = %alert.id,
            alert_type = %alert.alert_type,
            level = %alert.level,
            value = alert.value,
            threshold = alert.threshold,
            "Threshold alert fired"
        );
    }

    /// Log a fast-loop start/stop
    pub fn log_poller_transition(&self, from: PollerState, to: PollerState, subscribers: usize) {
        let message = match to {
            PollerState::Active => "Client connected, starting fast polling",
            PollerState::Idle => "No clients, stopping fast polling",
        };
        info!(
            event = "poller_transition",
            node = %self.node_name,
            from = ?from,
            to = ?to,
            subscribers = subscribers,
            "{}",
            message
        );
    }

    /// Log server startup
    pub fn log_startup(&self, version: &str, bind_addr: &str) {
        info!(
            event = "server_started",
            node = %self.node_name,
            version = %version,
            bind_addr = %bind_addr,
            "Dashboard server started"
        );
    }

    /// Log server shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "server_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Dashboard server shutting down"
        );
    }

    /// Log container runtime reachability changes
    pub fn log_runtime_status(&self, reachable: bool, detail: &str) {
        if reachable {
            info!(
                event = "runtime_status",
                node = %self.node_name,
                reachable = true,
                "Container runtime reachable"
            );
        } else {
            warn!(
                event = "runtime_status",
                node = %self.node_name,
                reachable = false,
                detail = %detail,
                "Container runtime unreachable, serving degraded data"
            );
        }
    }
}
