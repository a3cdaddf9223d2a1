//! Demand-driven host polling
//!
//! Two cadences: a slow loop refreshing near-static facts (OS identity,
//! storage) and a fast loop sampling CPU, memory and network. The fast loop
//! only runs while somebody is subscribed. A supervising tick moves the
//! poller between [`PollerState::Idle`] and [`PollerState::Active`].

use super::cache::TelemetryCache;
use super::provider::{FsEntry, HostMetricsProvider, NetInterface, NetStat};
use crate::health::{components, HealthRegistry};
use crate::models::{CpuInfo, InterfaceStats, MemoryInfo, NetworkRate, OsInfo, Sample, StorageInfo};
use crate::observability::{DashboardMetrics, StructuredLogger};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Consecutive failed fast samples before the poller reports degraded health
const DEGRADED_AFTER_FAILURES: u32 = 3;

/// Consecutive failed fast samples before the poller reports unhealthy
const UNHEALTHY_AFTER_FAILURES: u32 = 10;

/// Configuration for the adaptive poller
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Volatile metrics cadence (default: 2 seconds)
    pub fast_interval: Duration,
    /// OS identity and storage cadence (default: 60 seconds)
    pub slow_interval: Duration,
    /// How often the subscriber count is checked (default: 1 second)
    pub supervise_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(2),
            slow_interval: Duration::from_secs(60),
            supervise_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// No subscribers, fast loop off
    Idle,
    /// Fast loop running
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Activate,
    Deactivate,
}

/// State machine step for one supervising tick
pub fn transition(state: PollerState, subscribers: usize) -> Option<Transition> {
    match (state, subscribers) {
        (PollerState::Idle, n) if n > 0 => Some(Transition::Activate),
        (PollerState::Active, 0) => Some(Transition::Deactivate),
        _ => None,
    }
}

/// Near-static host facts produced by the slow loop
#[derive(Debug, Clone, Default)]
struct SlowFacts {
    os: Option<OsInfo>,
    storage: Option<StorageInfo>,
}

/// Adaptive dual-cadence poller feeding a [`TelemetryCache`]
pub struct AdaptivePoller {
    provider: Arc<dyn HostMetricsProvider>,
    cache: Arc<TelemetryCache>,
    config: PollerConfig,
    slow: RwLock<SlowFacts>,
    state: Mutex<PollerState>,
    consecutive_failures: AtomicU32,
    health: Option<HealthRegistry>,
    metrics: DashboardMetrics,
    logger: StructuredLogger,
}

impl AdaptivePoller {
    pub fn new(
        provider: Arc<dyn HostMetricsProvider>,
        cache: Arc<TelemetryCache>,
        config: PollerConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            config,
            slow: RwLock::new(SlowFacts::default()),
            state: Mutex::new(PollerState::Idle),
            consecutive_failures: AtomicU32::new(0),
            health: None,
            metrics: DashboardMetrics::new(),
            logger: StructuredLogger::new("localhost"),
        }
    }

    pub fn state(&self) -> PollerState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Run until the shutdown signal fires
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            fast_interval_ms = self.config.fast_interval.as_millis() as u64,
            slow_interval_secs = self.config.slow_interval.as_secs(),
            "Starting adaptive poller"
        );

        self.refresh_slow().await;
        let slow_task = tokio::spawn(self.clone().slow_loop(shutdown.resubscribe()));

        let mut supervise = interval(self.config.supervise_interval);
        supervise.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut fast: Option<Interval> = None;

        loop {
            tokio::select! {
                _ = supervise.tick() => {
                    let subscribers = self.cache.subscriber_count();
                    self.metrics.set_subscribers(subscribers as i64);

                    match self.apply(subscribers) {
                        Some(Transition::Activate) => {
                            // First sample right away so a new client never waits a full period
                            self.sample_fast().await;
                            let mut ticker = interval_at(
                                Instant::now() + self.config.fast_interval,
                                self.config.fast_interval,
                            );
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            fast = Some(ticker);
                        }
                        Some(Transition::Deactivate) => fast = None,
                        None => {}
                    }
                }
                _ = next_tick(&mut fast) => {
                    self.sample_fast().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down adaptive poller");
                    break;
                }
            }
        }

        if let Err(e) = slow_task.await {
            warn!(error = %e, "Slow poll loop ended abnormally");
        }
    }

    /// Apply one supervising step and return the transition taken
    pub fn apply(&self, subscribers: usize) -> Option<Transition> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let step = transition(*state, subscribers)?;
        let from = *state;
        *state = match step {
            Transition::Activate => PollerState::Active,
            Transition::Deactivate => PollerState::Idle,
        };

        self.metrics.set_poller_active(*state == PollerState::Active);
        self.logger.log_poller_transition(from, *state, subscribers);
        Some(step)
    }

    async fn slow_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval_at(
            Instant::now() + self.config.slow_interval,
            self.config.slow_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh_slow().await;
                    self.cache.alert_engine().prune(self.cache.now_millis());
                }
                _ = shutdown.recv() => {
                    debug!("Slow poll loop stopped");
                    break;
                }
            }
        }
    }

    /// Refresh OS identity and storage. Failed parts keep their cached value.
    pub async fn refresh_slow(&self) {
        let (os, fs) = tokio::join!(self.provider.os_info(), self.provider.fs_size());

        let mut slow = self.slow.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        match os {
            Ok(os) => slow.os = Some(os),
            Err(e) => {
                self.metrics.inc_sample_failures("slow");
                warn!(error = %e, "Failed to refresh OS info, keeping previous value");
            }
        }
        match fs {
            Ok(entries) => slow.storage = Some(root_storage(&entries)),
            Err(e) => {
                self.metrics.inc_sample_failures("slow");
                warn!(error = %e, "Failed to refresh storage, keeping previous value");
            }
        }
    }

    fn slow_facts(&self) -> SlowFacts {
        self.slow
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Take one fast sample and store it. Returns whether a sample was stored.
    pub async fn sample_fast(&self) -> bool {
        let mut slow = self.slow_facts();
        if slow.os.is_none() || slow.storage.is_none() {
            self.refresh_slow().await;
            slow = self.slow_facts();
        }
        let (Some(os), Some(storage)) = (slow.os, slow.storage) else {
            return self
                .record_failure("slow", "OS identity or storage not yet available")
                .await;
        };

        let previous = self.cache.latest();
        let (load, memory, net, ifaces) = tokio::join!(
            self.provider.current_load(),
            self.provider.memory(),
            self.provider.network_stats(),
            self.provider.network_interfaces(),
        );

        let cpu = match (load, previous.as_deref()) {
            (Ok(load), _) => CpuInfo {
                load: load.current_load.round(),
                cores: load.cores,
            },
            (Err(e), Some(prev)) => {
                warn!(error = %e, "CPU load unavailable, reusing previous value");
                prev.cpu
            }
            (Err(e), None) => return self.record_failure("cpu", &e.to_string()).await,
        };

        let memory = match (memory, previous.as_deref()) {
            (Ok(mem), _) => MemoryInfo {
                total: mem.total,
                used: mem.active,
                percent: percent(mem.active, mem.total),
            },
            (Err(e), Some(prev)) => {
                warn!(error = %e, "Memory stats unavailable, reusing previous value");
                prev.memory
            }
            (Err(e), None) => return self.record_failure("memory", &e.to_string()).await,
        };

        let (network, interfaces) = match (net, previous.as_deref()) {
            (Ok(stats), _) => {
                let operstates = match ifaces {
                    Ok(list) => operstate_map(list),
                    Err(e) => {
                        debug!(error = %e, "Interface list unavailable");
                        HashMap::new()
                    }
                };
                (default_rate(&stats), interface_stats(stats, &operstates))
            }
            (Err(e), Some(prev)) => {
                warn!(error = %e, "Network stats unavailable, reusing previous value");
                (prev.network, prev.interfaces.clone())
            }
            (Err(e), None) => return self.record_failure("network", &e.to_string()).await,
        };

        let sample = Sample {
            os,
            cpu,
            memory,
            storage,
            network,
            interfaces,
            timestamp: self.cache.now_millis(),
        };

        let alerts = self.cache.set_sample(sample);
        self.metrics.inc_samples_collected();
        for alert in &alerts {
            self.metrics.inc_alerts_fired(alert.alert_type.as_str(), alert.level.as_str());
            self.logger.log_alert(alert);
        }

        if self.consecutive_failures.swap(0, Ordering::SeqCst) >= DEGRADED_AFTER_FAILURES {
            info!("Host sampling recovered");
            if let Some(health) = &self.health {
                health.set_healthy(components::POLLER).await;
            }
        }
        true
    }

    async fn record_failure(&self, part: &str, error: &str) -> bool {
        self.metrics.inc_sample_failures("fast");
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(part = part, error = %error, failures, "Fast sample skipped");

        if let Some(health) = &self.health {
            let message = format!("{} sampling failing: {}", part, error);
            if failures == DEGRADED_AFTER_FAILURES {
                health.set_degraded(components::POLLER, message).await;
            } else if failures == UNHEALTHY_AFTER_FAILURES {
                health.set_unhealthy(components::POLLER, message).await;
            }
        }
        false
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64 * 100.0).round()
    }
}

/// Root filesystem, or the first one listed
fn root_storage(entries: &[FsEntry]) -> StorageInfo {
    entries
        .iter()
        .find(|e| e.mount == "/")
        .or_else(|| entries.first())
        .map(|fs| StorageInfo {
            total: fs.size,
            used: fs.used,
            percent: fs.use_percent.round(),
        })
        .unwrap_or_default()
}

/// Rates of the first non-loopback interface
fn default_rate(stats: &[NetStat]) -> NetworkRate {
    stats
        .iter()
        .find(|s| s.iface != "lo")
        .or_else(|| stats.first())
        .map(|s| NetworkRate {
            rx_sec: s.rx_sec,
            tx_sec: s.tx_sec,
        })
        .unwrap_or_default()
}

fn operstate_map(interfaces: Vec<NetInterface>) -> HashMap<String, String> {
    interfaces
        .into_iter()
        .map(|i| (i.iface, i.operstate))
        .collect()
}

fn interface_stats(stats: Vec<NetStat>, operstates: &HashMap<String, String>) -> Vec<InterfaceStats> {
    let mut out: Vec<InterfaceStats> = stats
        .into_iter()
        .map(|s| InterfaceStats {
            operstate: operstates
                .get(&s.iface)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
            iface: s.iface,
            rx_sec: s.rx_sec,
            tx_sec: s.tx_sec,
        })
        .collect();
    out.sort_by(|a, b| a.iface.cmp(&b.iface));
    out
}

/// Builder for the adaptive poller
pub struct AdaptivePollerBuilder {
    provider: Option<Arc<dyn HostMetricsProvider>>,
    cache: Option<Arc<TelemetryCache>>,
    config: PollerConfig,
    health: Option<HealthRegistry>,
    node_name: String,
}

impl AdaptivePollerBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            cache: None,
            config: PollerConfig::default(),
            health: None,
            node_name: "localhost".to_string(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn HostMetricsProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn cache(mut self, cache: Arc<TelemetryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn fast_interval(mut self, interval: Duration) -> Self {
        self.config.fast_interval = interval;
        self
    }

    pub fn slow_interval(mut self, interval: Duration) -> Self {
        self.config.slow_interval = interval;
        self
    }

    pub fn supervise_interval(mut self, interval: Duration) -> Self {
        self.config.supervise_interval = interval;
        self
    }

    /// Report sampling health to this registry
    pub fn health(mut self, registry: HealthRegistry) -> Self {
        self.health = Some(registry);
        self
    }

    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    pub fn build(self) -> Result<AdaptivePoller> {
        let provider = self
            .provider
            .ok_or_else(|| anyhow::anyhow!("Host metrics provider is required"))?;
        let cache = self
            .cache
            .ok_or_else(|| anyhow::anyhow!("Telemetry cache is required"))?;

        if self.config.fast_interval.is_zero()
            || self.config.slow_interval.is_zero()
            || self.config.supervise_interval.is_zero()
        {
            anyhow::bail!("Poll intervals must be non-zero");
        }

        let mut poller = AdaptivePoller::new(provider, cache, self.config);
        poller.health = self.health;
        poller.logger = StructuredLogger::new(self.node_name);
        Ok(poller)
    }
}

impl Default for AdaptivePollerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        assert_eq!(transition(PollerState::Idle, 0), None);
        assert_eq!(transition(PollerState::Idle, 1), Some(Transition::Activate));
        assert_eq!(transition(PollerState::Idle, 7), Some(Transition::Activate));
        assert_eq!(transition(PollerState::Active, 3), None);
        assert_eq!(transition(PollerState::Active, 0), Some(Transition::Deactivate));
    }

    #[test]
    fn test_root_storage_prefers_root_mount() {
        let entries = vec![
            FsEntry {
                mount: "/boot".into(),
                size: 10,
                used: 5,
                use_percent: 50.0,
            },
            FsEntry {
                mount: "/".into(),
                size: 100,
                used: 33,
                use_percent: 33.4,
            },
        ];
        let storage = root_storage(&entries);
        assert_eq!(storage.total, 100);
        assert_eq!(storage.percent, 33.0);

        assert_eq!(root_storage(&entries[..1]).total, 10);
        assert_eq!(root_storage(&[]), StorageInfo::default());
    }

    #[test]
    fn test_default_rate_skips_loopback() {
        let stats = vec![
            NetStat {
                iface: "lo".into(),
                rx_sec: 999.0,
                tx_sec: 999.0,
            },
            NetStat {
                iface: "eth0".into(),
                rx_sec: 10.0,
                tx_sec: 5.0,
            },
        ];
        assert_eq!(default_rate(&stats).rx_sec, 10.0);
        assert_eq!(default_rate(&stats[..1]).rx_sec, 999.0);
    }

    #[test]
    fn test_percent_handles_zero_total() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(1, 3), 33.0);
    }

    #[test]
    fn test_builder_requires_provider_and_cache() {
        assert!(AdaptivePollerBuilder::new().build().is_err());
        assert!(AdaptivePollerBuilder::new()
            .cache(Arc::new(TelemetryCache::default()))
            .build()
            .is_err());
    }
}
