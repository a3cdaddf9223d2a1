//! Builds the running dashboard from configuration

use crate::api::AppState;
use crate::config::DashboardConfig;
use anyhow::{Context, Result};
use dash_core::{
    docker::{
        AggregatorConfig, BoundedStatsAggregator, ContainerRuntime, ContainerServiceBuilder,
        DockerEngine, LimitsCache, RequestCoalescer,
    },
    health::{components, HealthRegistry},
    observability::DashboardMetrics,
    rate_limit::RateLimiter,
    telemetry::{
        AdaptivePoller, AdaptivePollerBuilder, CacheConfig, HostMetricsProvider, SysinfoProvider,
        TelemetryCache,
    },
    SharedClock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// How often idle rate-limit windows are dropped
pub const RATE_LIMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Everything the binary needs to run
pub struct Dashboard {
    pub state: Arc<AppState>,
    pub poller: Arc<AdaptivePoller>,
}

/// Connect to the container runtime named by the config
pub fn connect_runtime(config: &DashboardConfig) -> Result<Arc<dyn ContainerRuntime>> {
    let engine = match &config.docker_socket {
        Some(socket) => DockerEngine::connect_socket(socket),
        None => DockerEngine::connect_local(),
    }
    .context("Failed to configure Docker client")?;
    Ok(Arc::new(engine))
}

/// Host metrics from `sysinfo`, hostname from the mounted host file if any
pub fn host_provider(config: &DashboardConfig) -> Arc<dyn HostMetricsProvider> {
    let provider = match &config.hostname_file {
        Some(path) => SysinfoProvider::new().with_hostname_file(path.clone()),
        None => SysinfoProvider::new(),
    };
    Arc::new(provider)
}

/// Register the health components reported by the background tasks
pub async fn register_components(health: &HealthRegistry) {
    health.register(components::POLLER).await;
    health.register(components::CONTAINER_RUNTIME).await;
}

/// Assemble the telemetry cache, poller and container service
pub fn build(
    config: &DashboardConfig,
    runtime: Arc<dyn ContainerRuntime>,
    provider: Arc<dyn HostMetricsProvider>,
    health: HealthRegistry,
    clock: SharedClock,
) -> Result<Dashboard> {
    config.validate()?;

    let telemetry = Arc::new(TelemetryCache::new(
        CacheConfig {
            history_capacity: config.history_capacity,
            history_window: config.history_window(),
            alert_cooldown: config.alert_cooldown(),
            ..CacheConfig::default()
        },
        clock.clone(),
    ));

    let poller = AdaptivePollerBuilder::new()
        .provider(provider)
        .cache(telemetry.clone())
        .fast_interval(config.fast_interval())
        .slow_interval(config.slow_interval())
        .supervise_interval(config.supervise_interval())
        .health(health.clone())
        .node_name(&config.node_name)
        .build()?;

    let limits = Arc::new(LimitsCache::new(
        config.limits_ttl(),
        config.limits_capacity,
        clock.clone(),
    ));
    let aggregator = Arc::new(BoundedStatsAggregator::new(
        runtime.clone(),
        limits,
        AggregatorConfig {
            concurrency: config.stats_concurrency,
            timeout: config.stats_timeout(),
        },
    ));

    let mut containers = ContainerServiceBuilder::new()
        .runtime(runtime)
        .aggregator(aggregator)
        .coalescers(
            RequestCoalescer::new(config.coalesce_ttl(), clock.clone()),
            RequestCoalescer::new(config.coalesce_ttl(), clock.clone()),
        )
        .max_ids(config.max_stats_ids)
        .health(health.clone())
        .node_name(&config.node_name);
    if let Some(path) = &config.uptime_file {
        containers = containers.uptime_file(path.clone());
    }

    let (shutdown, _) = broadcast::channel(1);
    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_per_minute,
        Duration::from_secs(60),
        clock,
    ));

    info!(
        stats_concurrency = config.stats_concurrency,
        rate_limit = config.rate_limit_per_minute,
        container_actions = config.allow_container_actions,
        "Dashboard assembled"
    );

    Ok(Dashboard {
        state: Arc::new(AppState {
            health_registry: health,
            metrics: DashboardMetrics::new(),
            telemetry,
            containers: containers.build()?,
            rate_limiter,
            allow_container_actions: config.allow_container_actions,
            shutdown,
        }),
        poller: Arc::new(poller),
    })
}

/// Periodically drop expired rate-limit windows until shutdown
pub async fn sweep_rate_limits(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!(removed, remaining = limiter.tracked_keys(), "Swept rate-limit windows");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
