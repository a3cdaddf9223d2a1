//! Dashboard server
//!
//! Serves live host telemetry and container stats to the dashboard UI.
//! Host polling runs only while at least one client is subscribed.

use anyhow::Result;
use dash_core::{health::HealthRegistry, observability::StructuredLogger, system_clock};
use dash_server::{
    api, app,
    config::{DashboardConfig, LogFormat},
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = DashboardConfig::load()?;
    init_tracing(config.log_format);
    info!(node_name = %config.node_name, "Dashboard configured");

    let health_registry = HealthRegistry::new();
    app::register_components(&health_registry).await;

    let runtime = app::connect_runtime(&config)?;
    let provider = app::host_provider(&config);
    let dashboard = app::build(
        &config,
        runtime,
        provider,
        health_registry.clone(),
        system_clock(),
    )?;

    let logger = StructuredLogger::new(&config.node_name);
    let shutdown_tx = dashboard.state.shutdown.clone();

    let poller_handle = tokio::spawn(dashboard.poller.clone().run(shutdown_tx.subscribe()));
    let sweep_handle = tokio::spawn(app::sweep_rate_limits(
        dashboard.state.rate_limiter.clone(),
        app::RATE_LIMIT_SWEEP_INTERVAL,
        shutdown_tx.subscribe(),
    ));

    health_registry.set_ready(true).await;
    let bind_addr = config.bind_addr();
    logger.log_startup(SERVER_VERSION, &bind_addr);

    let server_shutdown = {
        let logger = logger.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            logger.log_shutdown("SIGINT received");
        }
    };

    // `serve` fires the shutdown signal before draining connections
    let served = api::serve(&bind_addr, dashboard.state.clone(), server_shutdown).await;

    health_registry.set_ready(false).await;
    // Serving may have failed before the signal fired
    let _ = shutdown_tx.send(());
    let _ = tokio::join!(poller_handle, sweep_handle);
    info!("Shutdown complete");

    served
}
