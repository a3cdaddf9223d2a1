//! Container runtime integration
//!
//! This module provides bounded-concurrency stats aggregation over a
//! container runtime, a TTL cache for configured limits, request
//! coalescing for bursty read endpoints and the container listing view.
//! The runtime itself is abstracted behind [`ContainerRuntime`] so the
//! cores can be exercised without a Docker daemon.

mod aggregator;
mod coalescer;
mod containers;
mod engine;
mod limits_cache;


pub use aggregator::{
    cpu_percent, limits_from_host_config, stats_from_raw, AggregatorConfig,
    BoundedStatsAggregator, DEFAULT_STATS_CONCURRENCY, DEFAULT_STATS_TIMEOUT,
    MAX_STATS_CONCURRENCY, MIN_STATS_CONCURRENCY,
};
pub use coalescer::{RequestCoalescer, DEFAULT_COALESCE_TTL};
pub use containers::{
    container_view, parse_ids, read_host_uptime, validate_container_id, validate_full_container_id,
    ContainerAction,
    ContainerService, ContainerServiceBuilder, DEFAULT_MAX_STATS_IDS, LIST_CACHE_KEY,
};
pub use engine::DockerEngine;
pub use limits_cache::{
    LimitsCache, DEFAULT_LIMITS_CAPACITY, DEFAULT_LIMITS_SWEEP_INTERVAL, DEFAULT_LIMITS_TTL,
};

use crate::error::Result;
use crate::models::PortMapping;
use async_trait::async_trait;
use std::collections::HashMap;

/// Cumulative CPU counters from one stats read
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuCounters {
    /// Container CPU time in nanoseconds
    pub total_usage: u64,
    /// Host CPU time in nanoseconds
    pub system_usage: Option<u64>,
    pub online_cpus: Option<u64>,
    /// Length of the per-CPU usage list, used when `online_cpus` is missing
    pub percpu_count: Option<u64>,
}

impl CpuCounters {
    /// Online CPU count, falling back to the per-CPU list length
    pub fn cpu_count(&self) -> u64 {
        self.online_cpus.or(self.percpu_count).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// One block-IO service entry (`op` is e.g. `Read` or `Write`)
#[derive(Debug, Clone, PartialEq)]
pub struct BlkioEntry {
    pub op: String,
    pub value: u64,
}

/// Raw one-shot stats as reported by the runtime
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawContainerStats {
    pub cpu: CpuCounters,
    /// Counters from the previous read, used for deltas
    pub precpu: CpuCounters,
    pub memory_usage: Option<u64>,
    pub memory_limit: Option<u64>,
    pub networks: Vec<NetworkCounters>,
    pub blkio: Vec<BlkioEntry>,
}

/// Resource settings from a container's host configuration
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostConfigLimits {
    pub memory: Option<i64>,
    pub memory_reservation: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<i64>,
}

/// Image reference and run state from an inspect call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerDetails {
    /// Image reference the container was created from, e.g. `nginx:1.25`
    pub image: String,
    pub running: bool,
}

/// Container as returned by a list call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerListing {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
    pub status: String,
    pub created: i64,
    pub ports: Vec<PortMapping>,
    pub labels: HashMap<String, String>,
}

/// Container runtime client
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerListing>>;

    /// One-shot (non-streaming) stats read
    async fn stats(&self, id: &str) -> Result<RawContainerStats>;

    async fn inspect(&self, id: &str) -> Result<HostConfigLimits>;

    async fn details(&self, id: &str) -> Result<ContainerDetails>;

    /// Pull `image` from its registry, waiting for the pull to finish
    async fn pull_image(&self, image: &str) -> Result<()>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn restart(&self, id: &str) -> Result<()>;
}
