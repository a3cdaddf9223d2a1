//! Container listing, stats and lifecycle actions
//!
//! [`ContainerService`] is what the HTTP layer talks to. Reads go through
//! the request coalescer; ids and actions are validated before any call
//! reaches the runtime.

use super::aggregator::BoundedStatsAggregator;
use super::coalescer::RequestCoalescer;
use super::{ContainerListing, ContainerRuntime};
use crate::error::{Error, Result};
use crate::health::{components, HealthRegistry};
use crate::models::{ContainerStats, ContainerView, HostInfo};
use crate::observability::StructuredLogger;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Coalescing key of the full listing
pub const LIST_CACHE_KEY: &str = "containers:list";

pub const DEFAULT_MAX_STATS_IDS: usize = 200;

const MAX_ID_LEN: usize = 128;
const MIN_FULL_ID_LEN: usize = 12;
const MAX_FULL_ID_LEN: usize = 64;
const SHORT_ID_LEN: usize = 12;
const UNKNOWN_NAME: &str = "System/Unknown";

/// Accepts container ids and names: `[A-Za-z0-9][A-Za-z0-9_.-]{0,127}`
pub fn validate_container_id(id: &str) -> Result<()> {
    let mut chars = id.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && id.len() <= MAX_ID_LEN
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidContainerId(id.to_string()))
    }
}

/// Accepts only hex container ids of 12 to 64 characters, no names
pub fn validate_full_container_id(id: &str) -> Result<()> {
    let valid = (MIN_FULL_ID_LEN..=MAX_FULL_ID_LEN).contains(&id.len())
        && id.chars().all(|c| c.is_ascii_hexdigit());
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidContainerId(id.to_string()))
    }
}

/// Parse a comma-separated id list: trimmed, de-duplicated in first-seen
/// order, validated and truncated to `max`
pub fn parse_ids(raw: Option<&str>, max: usize) -> Result<Vec<String>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for id in raw.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        validate_container_id(id)?;
        if seen.insert(id) {
            ids.push(id.to_string());
        }
    }

    if ids.len() > max {
        debug!(requested = ids.len(), max, "Truncating container id list");
        ids.truncate(max);
    }
    Ok(ids)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
    /// Pull the container's image, then restart it (or start it if stopped)
    Redeploy,
}

impl ContainerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Restart => "restart",
            ContainerAction::Redeploy => "redeploy",
        }
    }
}

impl FromStr for ContainerAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(ContainerAction::Start),
            "stop" => Ok(ContainerAction::Stop),
            "restart" => Ok(ContainerAction::Restart),
            "redeploy" => Ok(ContainerAction::Redeploy),
            other => Err(Error::InvalidAction(other.to_string())),
        }
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host uptime in whole seconds.
///
/// Reads the first field of a `/proc/uptime`-style file when given (the
/// host's procfs mounted into the container), else asks the local system.
pub async fn read_host_uptime(path: Option<&Path>) -> u64 {
    let from_file = match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .ok()
            .and_then(|raw| parse_uptime(&raw)),
        None => None,
    };
    match from_file {
        Some(seconds) => seconds,
        // sysinfo reads the local procfs synchronously
        None => tokio::task::spawn_blocking(sysinfo::System::uptime)
            .await
            .unwrap_or(0),
    }
}

fn parse_uptime(raw: &str) -> Option<u64> {
    raw.split_whitespace()
        .next()
        .and_then(|first| first.parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(|seconds| seconds.floor() as u64)
}

/// Dashboard entry for one listed container
pub fn container_view(
    listing: ContainerListing,
    stats: ContainerStats,
    uptime_seconds: u64,
) -> ContainerView {
    let name = listing
        .names
        .first()
        .map(|name| name.trim_start_matches('/').to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN_NAME.to_string());

    let image = if listing.image.is_empty() {
        "unknown".to_string()
    } else {
        listing.image.replacen("sha256:", "", 1)
    };

    ContainerView {
        id: listing.id.chars().take(SHORT_ID_LEN).collect(),
        name,
        image,
        state: listing.state,
        status: listing.status,
        created: listing.created,
        ports: listing.ports,
        labels: listing.labels,
        stats,
        host: HostInfo { uptime_seconds },
    }
}

struct ServiceInner {
    runtime: Arc<dyn ContainerRuntime>,
    aggregator: Arc<BoundedStatsAggregator>,
    listings: RequestCoalescer<String, Vec<ContainerView>>,
    stats: RequestCoalescer<String, HashMap<String, ContainerStats>>,
    max_ids: usize,
    uptime_file: Option<PathBuf>,
    health: Option<HealthRegistry>,
    logger: StructuredLogger,
    runtime_reachable: AtomicBool,
}

/// Container operations exposed to the API, cheap to clone
#[derive(Clone)]
pub struct ContainerService {
    inner: Arc<ServiceInner>,
}

impl ContainerService {
    pub fn aggregator(&self) -> &Arc<BoundedStatsAggregator> {
        &self.inner.aggregator
    }

    pub fn max_ids(&self) -> usize {
        self.inner.max_ids
    }

    /// All containers with stats for the running ones.
    ///
    /// A runtime failure yields an empty list, never an error.
    pub async fn list(&self) -> Vec<ContainerView> {
        let service = self.clone();
        let result = self
            .inner
            .listings
            .get_or_fetch(LIST_CACHE_KEY.to_string(), move || async move {
                Ok(service.fetch_listing().await)
            })
            .await;

        result.unwrap_or_else(|e| {
            warn!(error = %e, "Container listing failed");
            Vec::new()
        })
    }

    async fn fetch_listing(&self) -> Vec<ContainerView> {
        let listings = match self.inner.runtime.list_containers(true).await {
            Ok(listings) => {
                self.mark_runtime(true, "").await;
                listings
            }
            Err(e) => {
                self.mark_runtime(false, &e.to_string()).await;
                return Vec::new();
            }
        };

        let running: Vec<String> = listings
            .iter()
            .filter(|c| c.state == "running" && !c.id.is_empty())
            .map(|c| c.id.clone())
            .collect();
        let mut stats = self.inner.aggregator.collect(&running).await;

        let uptime = read_host_uptime(self.inner.uptime_file.as_deref()).await;
        listings
            .into_iter()
            .map(|listing| {
                let container_stats = stats.remove(&listing.id).unwrap_or_default();
                container_view(listing, container_stats, uptime)
            })
            .collect()
    }

    /// Stats keyed by the ids as requested; empty input gives an empty map
    pub async fn stats(&self, ids_param: Option<&str>) -> Result<HashMap<String, ContainerStats>> {
        let ids = parse_ids(ids_param, self.inner.max_ids)?;
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut key_ids = ids.clone();
        key_ids.sort();
        let key = format!("containers:stats:{}", key_ids.join(","));

        let aggregator = Arc::clone(&self.inner.aggregator);
        self.inner
            .stats
            .get_or_fetch(key, move || async move { Ok(aggregator.collect(&ids).await) })
            .await
    }

    /// Validate, confirm the container exists, then run the action.
    ///
    /// Redeploy only accepts full hex ids.
    pub async fn perform(&self, id: &str, action: &str) -> Result<ContainerAction> {
        validate_container_id(id)?;
        let action = action.parse::<ContainerAction>()?;

        let runtime = &self.inner.runtime;
        match action {
            ContainerAction::Start => {
                runtime.inspect(id).await?;
                runtime.start(id).await?;
            }
            ContainerAction::Stop => {
                runtime.inspect(id).await?;
                runtime.stop(id).await?;
            }
            ContainerAction::Restart => {
                runtime.inspect(id).await?;
                runtime.restart(id).await?;
            }
            ContainerAction::Redeploy => {
                validate_full_container_id(id)?;
                self.redeploy(id).await?;
            }
        }

        self.inner.listings.invalidate(&LIST_CACHE_KEY.to_string());
        info!(container = id, action = %action, "Container action completed");
        Ok(action)
    }

    async fn redeploy(&self, id: &str) -> Result<()> {
        let runtime = &self.inner.runtime;
        let details = runtime.details(id).await?;
        if details.image.is_empty() {
            return Err(Error::Upstream(format!("container {} has no image reference", id)));
        }

        runtime.pull_image(&details.image).await.map_err(|e| match e {
            Error::NotFound(msg) | Error::Upstream(msg) => {
                Error::Upstream(format!("Failed to pull image \"{}\": {}", details.image, msg))
            }
            other => other,
        })?;

        if details.running {
            runtime.restart(id).await?;
        } else {
            runtime.start(id).await?;
        }
        info!(container = id, image = %details.image, running = details.running, "Container redeployed");
        Ok(())
    }

    async fn mark_runtime(&self, reachable: bool, detail: &str) {
        let was = self.inner.runtime_reachable.swap(reachable, Ordering::SeqCst);
        if was == reachable {
            return;
        }

        self.inner.logger.log_runtime_status(reachable, detail);
        if let Some(health) = &self.inner.health {
            if reachable {
                health.set_healthy(components::CONTAINER_RUNTIME).await;
            } else {
                health
                    .set_degraded(components::CONTAINER_RUNTIME, detail.to_string())
                    .await;
            }
        }
    }
}

/// Builder for [`ContainerService`]
pub struct ContainerServiceBuilder {
    runtime: Option<Arc<dyn ContainerRuntime>>,
    aggregator: Option<Arc<BoundedStatsAggregator>>,
    listings: Option<RequestCoalescer<String, Vec<ContainerView>>>,
    stats: Option<RequestCoalescer<String, HashMap<String, ContainerStats>>>,
    max_ids: usize,
    uptime_file: Option<PathBuf>,
    health: Option<HealthRegistry>,
    node_name: String,
}

impl ContainerServiceBuilder {
    pub fn new() -> Self {
        Self {
            runtime: None,
            aggregator: None,
            listings: None,
            stats: None,
            max_ids: DEFAULT_MAX_STATS_IDS,
            uptime_file: None,
            health: None,
            node_name: "localhost".to_string(),
        }
    }

    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn aggregator(mut self, aggregator: Arc<BoundedStatsAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    /// Coalescers for the listing and stats endpoints
    pub fn coalescers(
        mut self,
        listings: RequestCoalescer<String, Vec<ContainerView>>,
        stats: RequestCoalescer<String, HashMap<String, ContainerStats>>,
    ) -> Self {
        self.listings = Some(listings);
        self.stats = Some(stats);
        self
    }

    pub fn max_ids(mut self, max: usize) -> Self {
        self.max_ids = max;
        self
    }

    pub fn uptime_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.uptime_file = Some(path.into());
        self
    }

    pub fn health(mut self, registry: HealthRegistry) -> Self {
        self.health = Some(registry);
        self
    }

    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    pub fn build(self) -> anyhow::Result<ContainerService> {
        let runtime = self
            .runtime
            .ok_or_else(|| anyhow::anyhow!("Container runtime is required"))?;
        let aggregator = self
            .aggregator
            .ok_or_else(|| anyhow::anyhow!("Stats aggregator is required"))?;
        if self.max_ids == 0 {
            anyhow::bail!("max_ids must be greater than zero");
        }

        Ok(ContainerService {
            inner: Arc::new(ServiceInner {
                runtime,
                aggregator,
                listings: self.listings.unwrap_or_default(),
                stats: self.stats.unwrap_or_default(),
                max_ids: self.max_ids,
                uptime_file: self.uptime_file,
                health: self.health,
                logger: StructuredLogger::new(self.node_name),
                runtime_reachable: AtomicBool::new(true),
            }),
        })
    }
}

impl Default for ContainerServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PortMapping;

    #[test]
    fn test_validate_container_id() {
        assert!(validate_container_id("4f2a9c1d7e3b").is_ok());
        assert!(validate_container_id("my_app.web-1").is_ok());
        assert!(validate_container_id(&"a".repeat(128)).is_ok());

        let too_long = "a".repeat(129);
        for bad in ["", "-leading", ".hidden", "a/b", "a b", "id;rm", too_long.as_str()] {
            assert_eq!(
                validate_container_id(bad),
                Err(Error::InvalidContainerId(bad.to_string())),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_parse_ids() {
        assert!(parse_ids(None, 200).unwrap().is_empty());
        assert!(parse_ids(Some(""), 200).unwrap().is_empty());
        assert!(parse_ids(Some(" , ,"), 200).unwrap().is_empty());

        let ids = parse_ids(Some(" web , db,web,cache "), 200).unwrap();
        assert_eq!(ids, vec!["web", "db", "cache"]);

        assert!(matches!(
            parse_ids(Some("web,../etc"), 200),
            Err(Error::InvalidContainerId(_))
        ));
    }

    #[test]
    fn test_parse_ids_truncates() {
        let raw: Vec<String> = (0..250).map(|i| format!("c{}", i)).collect();
        let ids = parse_ids(Some(&raw.join(",")), 200).unwrap();
        assert_eq!(ids.len(), 200);
        assert_eq!(ids[199], "c199");
    }

    #[test]
    fn test_container_action_parse() {
        assert_eq!("start".parse::<ContainerAction>(), Ok(ContainerAction::Start));
        assert_eq!("restart".parse::<ContainerAction>(), Ok(ContainerAction::Restart));
        assert_eq!(
            "delete".parse::<ContainerAction>(),
            Err(Error::InvalidAction("delete".to_string()))
        );
        assert_eq!(ContainerAction::Stop.to_string(), "stop");
        assert_eq!("redeploy".parse::<ContainerAction>(), Ok(ContainerAction::Redeploy));
    }

    #[test]
    fn test_validate_full_container_id() {
        assert!(validate_full_container_id("4f2a9c1d7e3b").is_ok());
        assert!(validate_full_container_id(&"ab".repeat(32)).is_ok());

        let too_long = "a".repeat(65);
        for bad in ["4f2a9c1d7e3", "grafana-main", "4f2a9c1d7e3g", too_long.as_str()] {
            assert!(validate_full_container_id(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_container_view_cleans_fields() {
        let listing = ContainerListing {
            id: "4f2a9c1d7e3b8a6f0c5d2e1b9a8f7c6d".to_string(),
            names: vec!["/grafana".to_string()],
            image: "sha256:9d1e0f3b2a".to_string(),
            state: "exited".to_string(),
            status: "Exited (0) 2 days ago".to_string(),
            created: 1_700_000_000,
            ports: vec![PortMapping {
                ip: None,
                private_port: 3000,
                public_port: None,
                port_type: Some("tcp".to_string()),
            }],
            labels: HashMap::new(),
        };

        let view = container_view(listing, ContainerStats::default(), 3600);
        assert_eq!(view.id, "4f2a9c1d7e3b");
        assert_eq!(view.name, "grafana");
        assert_eq!(view.image, "9d1e0f3b2a");
        assert_eq!(view.host.uptime_seconds, 3600);

        let unnamed = container_view(ContainerListing::default(), ContainerStats::default(), 0);
        assert_eq!(unnamed.name, "System/Unknown");
        assert_eq!(unnamed.image, "unknown");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_read_host_uptime_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uptime");
        std::fs::write(&path, "12345.67 98765.43\n").unwrap();

        assert_eq!(read_host_uptime(Some(path.as_path())).await, 12345);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_unreadable_uptime_file_falls_back_to_local_uptime() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = dir.path().join("uptime");
        std::fs::write(&garbage, "not-a-number\n").unwrap();
        let missing = dir.path().join("missing");

        let local = sysinfo::System::uptime();
        for path in [garbage.as_path(), missing.as_path()] {
            let uptime = read_host_uptime(Some(path)).await;
            assert!(uptime >= local && uptime <= local + 5, "{} vs {}", uptime, local);
        }
    }

    #[test]
    fn test_parse_uptime() {
        assert_eq!(parse_uptime("42.99 10.0"), Some(42));
        assert_eq!(parse_uptime("-1 0"), None);
        assert_eq!(parse_uptime(""), None);
    }
}
