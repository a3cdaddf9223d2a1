//! Server configuration
//!
//! Built from serde defaults, an optional file named by `DASH_CONFIG`
//! (TOML, YAML or JSON) and `DASH_*` environment variables, in that order.

use anyhow::{Context, Result};
use dash_core::docker::{MAX_STATS_CONCURRENCY, MIN_STATS_CONCURRENCY};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the optional config file
pub const CONFIG_PATH_ENV: &str = "DASH_CONFIG";
const ENV_PREFIX: &str = "DASH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Dashboard server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    /// Node name used in structured logs
    #[serde(default = "default_node_name")]
    pub node_name: String,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Fast poll cadence while clients are connected
    #[serde(default = "default_fast_interval_ms")]
    pub fast_interval_ms: u64,

    /// OS identity and storage refresh cadence
    #[serde(default = "default_slow_interval_secs")]
    pub slow_interval_secs: u64,

    /// How often the subscriber count is checked
    #[serde(default = "default_supervise_interval_ms")]
    pub supervise_interval_ms: u64,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default = "default_history_window_secs")]
    pub history_window_secs: u64,

    #[serde(default = "default_alert_cooldown_secs")]
    pub alert_cooldown_secs: u64,

    /// Docker unix socket; platform default when unset
    #[serde(default)]
    pub docker_socket: Option<String>,

    /// Concurrent container stats fetches (5..=20)
    #[serde(default = "default_stats_concurrency")]
    pub stats_concurrency: usize,

    #[serde(default = "default_stats_timeout_ms")]
    pub stats_timeout_ms: u64,

    #[serde(default = "default_limits_ttl_secs")]
    pub limits_ttl_secs: u64,

    #[serde(default = "default_limits_capacity")]
    pub limits_capacity: usize,

    /// Lifetime of coalesced listing and stats results
    #[serde(default = "default_coalesce_ttl_ms")]
    pub coalesce_ttl_ms: u64,

    #[serde(default = "default_max_stats_ids")]
    pub max_stats_ids: usize,

    /// Requests per minute per client on `/api/docker`
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,

    /// Host hostname file mounted into the container
    #[serde(default = "default_hostname_file")]
    pub hostname_file: Option<PathBuf>,

    /// Host `/proc/uptime` mounted into the container
    #[serde(default = "default_uptime_file")]
    pub uptime_file: Option<PathBuf>,

    /// Enables start/stop/restart/redeploy endpoints
    #[serde(default)]
    pub allow_container_actions: bool,
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_fast_interval_ms() -> u64 {
    2_000
}

fn default_slow_interval_secs() -> u64 {
    60
}

fn default_supervise_interval_ms() -> u64 {
    1_000
}

fn default_history_capacity() -> usize {
    1_800
}

fn default_history_window_secs() -> u64 {
    3_600
}

fn default_alert_cooldown_secs() -> u64 {
    300
}

fn default_stats_concurrency() -> usize {
    10
}

fn default_stats_timeout_ms() -> u64 {
    1_500
}

fn default_limits_ttl_secs() -> u64 {
    60
}

fn default_limits_capacity() -> usize {
    5_000
}

fn default_coalesce_ttl_ms() -> u64 {
    2_000
}

fn default_max_stats_ids() -> usize {
    200
}

fn default_rate_limit_per_minute() -> u32 {
    60
}

fn default_hostname_file() -> Option<PathBuf> {
    Some(PathBuf::from("/host/etc/hostname"))
}

fn default_uptime_file() -> Option<PathBuf> {
    Some(PathBuf::from("/host/proc/uptime"))
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            bind_address: default_bind_address(),
            port: default_port(),
            log_format: default_log_format(),
            fast_interval_ms: default_fast_interval_ms(),
            slow_interval_secs: default_slow_interval_secs(),
            supervise_interval_ms: default_supervise_interval_ms(),
            history_capacity: default_history_capacity(),
            history_window_secs: default_history_window_secs(),
            alert_cooldown_secs: default_alert_cooldown_secs(),
            docker_socket: None,
            stats_concurrency: default_stats_concurrency(),
            stats_timeout_ms: default_stats_timeout_ms(),
            limits_ttl_secs: default_limits_ttl_secs(),
            limits_capacity: default_limits_capacity(),
            coalesce_ttl_ms: default_coalesce_ttl_ms(),
            max_stats_ids: default_max_stats_ids(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            hostname_file: default_hostname_file(),
            uptime_file: default_uptime_file(),
            allow_container_actions: false,
        }
    }
}

impl DashboardConfig {
    /// Load configuration from the optional file and the environment
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        Self::from_sources(file.as_deref(), true)
    }

    /// Load configuration from a file only
    pub fn load_from_file(path: &Path) -> Result<Self> {
        Self::from_sources(Some(path), false)
    }

    fn from_sources(file: Option<&Path>, with_env: bool) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        if with_env {
            builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));
        }

        let config: Self = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(MIN_STATS_CONCURRENCY..=MAX_STATS_CONCURRENCY).contains(&self.stats_concurrency) {
            anyhow::bail!(
                "stats_concurrency must be between {} and {}, got {}",
                MIN_STATS_CONCURRENCY,
                MAX_STATS_CONCURRENCY,
                self.stats_concurrency
            );
        }
        if self.fast_interval_ms == 0 || self.slow_interval_secs == 0 || self.supervise_interval_ms == 0 {
            anyhow::bail!("poll intervals must be greater than zero");
        }
        if self.history_capacity == 0 {
            anyhow::bail!("history_capacity must be greater than zero");
        }
        if self.stats_timeout_ms == 0 {
            anyhow::bail!("stats_timeout_ms must be greater than zero");
        }
        if self.max_stats_ids == 0 {
            anyhow::bail!("max_stats_ids must be greater than zero");
        }
        if self.rate_limit_per_minute == 0 {
            anyhow::bail!("rate_limit_per_minute must be greater than zero");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn fast_interval(&self) -> Duration {
        Duration::from_millis(self.fast_interval_ms)
    }

    pub fn slow_interval(&self) -> Duration {
        Duration::from_secs(self.slow_interval_secs)
    }

    pub fn supervise_interval(&self) -> Duration {
        Duration::from_millis(self.supervise_interval_ms)
    }

    pub fn history_window(&self) -> Duration {
        Duration::from_secs(self.history_window_secs)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }

    pub fn stats_timeout(&self) -> Duration {
        Duration::from_millis(self.stats_timeout_ms)
    }

    pub fn limits_ttl(&self) -> Duration {
        Duration::from_secs(self.limits_ttl_secs)
    }

    pub fn coalesce_ttl(&self) -> Duration {
        Duration::from_millis(self.coalesce_ttl_ms)
    }
}
