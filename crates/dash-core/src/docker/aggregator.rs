//! Bounded-concurrency container stats aggregation
//!
//! Every container gets an entry in the result, even when its runtime call
//! fails or times out; only the numeric fields degrade to zero. At most
//! `concurrency` containers are fetched at once.

use super::limits_cache::LimitsCache;
use super::{ContainerRuntime, HostConfigLimits, RawContainerStats};
use crate::error::{Error, Result};
use crate::models::{ContainerStats, Limits};
use crate::observability::DashboardMetrics;
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub const DEFAULT_STATS_CONCURRENCY: usize = 10;
pub const MIN_STATS_CONCURRENCY: usize = 5;
pub const MAX_STATS_CONCURRENCY: usize = 20;
pub const DEFAULT_STATS_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Containers fetched at once, clamped to 5..=20 (default: 10)
    pub concurrency: usize,
    /// Deadline for each runtime call (default: 1.5 seconds)
    pub timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_STATS_CONCURRENCY,
            timeout: DEFAULT_STATS_TIMEOUT,
        }
    }
}

pub struct BoundedStatsAggregator {
    runtime: Arc<dyn ContainerRuntime>,
    limits: Arc<LimitsCache>,
    permits: Arc<Semaphore>,
    concurrency: usize,
    timeout: Duration,
    metrics: DashboardMetrics,
}

impl BoundedStatsAggregator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        limits: Arc<LimitsCache>,
        config: AggregatorConfig,
    ) -> Self {
        let concurrency = config
            .concurrency
            .clamp(MIN_STATS_CONCURRENCY, MAX_STATS_CONCURRENCY);
        if concurrency != config.concurrency {
            warn!(
                requested = config.concurrency,
                applied = concurrency,
                "Stats concurrency out of range, clamped"
            );
        }

        Self {
            runtime,
            limits,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            timeout: config.timeout,
            metrics: DashboardMetrics::new(),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn limits_cache(&self) -> &Arc<LimitsCache> {
        &self.limits
    }

    /// Stats for every id; returns once each fetch succeeded or fell back
    pub async fn collect(&self, ids: &[String]) -> HashMap<String, ContainerStats> {
        let started = Instant::now();

        let results = join_all(ids.iter().map(|id| async move {
            let stats = self.fetch_one(id).await;
            (id.clone(), stats)
        }))
        .await;

        let elapsed = started.elapsed();
        self.metrics
            .observe_container_stats_latency(elapsed.as_secs_f64());
        debug!(
            containers = ids.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Container stats collected"
        );

        results.into_iter().collect()
    }

    /// Stats for one container; never fails
    pub async fn fetch_one(&self, id: &str) -> ContainerStats {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return ContainerStats::default(),
        };

        let cached = self.limits.get(id);
        // Inspect runs alongside the stats call, not after it
        let inspect = async {
            if cached.is_some() {
                None
            } else {
                Some(self.deadline(self.runtime.inspect(id)).await)
            }
        };
        let (raw, inspected) = tokio::join!(self.deadline(self.runtime.stats(id)), inspect);

        let limits = match (cached, inspected) {
            (Some(limits), _) => Some(limits),
            (None, Some(Ok(host_config))) => {
                let limits = limits_from_host_config(&host_config);
                self.limits.insert(id, limits);
                Some(limits)
            }
            (None, Some(Err(e))) => {
                debug!(container = id, error = %e, "Inspect failed, limits unknown");
                None
            }
            (None, None) => None,
        };

        let raw = match raw {
            Ok(raw) => Some(raw),
            Err(e) => {
                let reason = if matches!(e, Error::Timeout(_)) { "timeout" } else { "error" };
                self.metrics.inc_container_fetch_failures(reason);
                debug!(container = id, error = %e, "Stats unavailable, using zero values");
                None
            }
        };

        stats_from_raw(raw.as_ref(), limits)
    }

    /// Run an upstream call under the per-call deadline. On timeout the call
    /// is dropped, which releases its slot.
    async fn deadline<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

/// `(Δ container cpu / Δ system cpu) × online cpus × 100`, or 0 when any
/// term is non-positive
pub fn cpu_percent(raw: &RawContainerStats) -> f64 {
    let cpu_delta = raw.cpu.total_usage as f64 - raw.precpu.total_usage as f64;
    let system_delta = raw.cpu.system_usage.unwrap_or(0) as f64
        - raw.precpu.system_usage.unwrap_or(0) as f64;
    let cpus = raw.cpu.cpu_count();

    if cpu_delta > 0.0 && system_delta > 0.0 && cpus > 0 {
        cpu_delta / system_delta * cpus as f64 * 100.0
    } else {
        0.0
    }
}

/// Configured limits; CPU from `NanoCpus`, else `CpuQuota / CpuPeriod`
pub fn limits_from_host_config(config: &HostConfigLimits) -> Limits {
    let positive = |value: Option<i64>| value.filter(|v| *v > 0);

    let cpu = match (
        positive(config.nano_cpus),
        positive(config.cpu_quota),
        positive(config.cpu_period),
    ) {
        (Some(nano), _, _) => nano as f64 / 1e9,
        (None, Some(quota), Some(period)) => quota as f64 / period as f64,
        _ => 0.0,
    };

    Limits {
        memory: positive(config.memory).unwrap_or(0) as u64,
        memory_reservation: positive(config.memory_reservation).unwrap_or(0) as u64,
        cpu,
    }
}

/// Combine runtime counters with configured limits
pub fn stats_from_raw(raw: Option<&RawContainerStats>, limits: Option<Limits>) -> ContainerStats {
    let limits = limits.unwrap_or_default();
    let Some(raw) = raw else {
        return ContainerStats {
            limits,
            ..ContainerStats::default()
        };
    };

    let mem_usage = raw.memory_usage.unwrap_or(0);
    let mem_limit = raw.memory_limit.unwrap_or(0);
    // Configured limit wins over the runtime-reported effective limit
    let denominator = if limits.memory > 0 { limits.memory } else { mem_limit };
    let mem_percent = if denominator > 0 {
        mem_usage as f64 / denominator as f64 * 100.0
    } else {
        0.0
    };

    ContainerStats {
        cpu_percent: round2(cpu_percent(raw)),
        mem_usage,
        mem_limit,
        mem_percent: round2(mem_percent),
        net_rx: raw.networks.iter().map(|n| n.rx_bytes).sum(),
        net_tx: raw.networks.iter().map(|n| n.tx_bytes).sum(),
        blk_read: blkio_sum(raw, "Read"),
        blk_write: blkio_sum(raw, "Write"),
        limits,
    }
}

fn blkio_sum(raw: &RawContainerStats, op: &str) -> u64 {
    raw.blkio
        .iter()
        .filter(|entry| entry.op.eq_ignore_ascii_case(op))
        .map(|entry| entry.value)
        .sum()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
