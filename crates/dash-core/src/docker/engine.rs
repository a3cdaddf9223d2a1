//! Docker engine client backed by bollard

use super::{
    BlkioEntry, ContainerDetails, ContainerListing, ContainerRuntime, CpuCounters, HostConfigLimits,
    NetworkCounters, RawContainerStats,
};
use crate::error::{Error, Result};
use crate::models::PortMapping;
use async_trait::async_trait;
use bollard::container::{
    CPUStats, InspectContainerOptions, ListContainersOptions, RestartContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary, Port};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use std::path::Path;
use tracing::{debug, info};

/// Seconds bollard waits on the daemon socket
const SOCKET_TIMEOUT_SECS: u64 = 120;

#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect through the platform default socket (honours `DOCKER_HOST`)
    pub fn connect_local() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Upstream(format!("Failed to connect to Docker daemon: {}", e)))?;
        Ok(Self { docker })
    }

    /// Connect to a unix socket at `path`
    pub fn connect_socket(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().into_owned();
        let docker = Docker::connect_with_unix(&path, SOCKET_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| {
                Error::Upstream(format!("Failed to connect to Docker socket {}: {}", path, e))
            })?;
        info!(socket = %path, "Docker client configured");
        Ok(Self { docker })
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }
}

#[async_trait]
impl ContainerRuntime for DockerEngine {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerListing>> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        debug!(count = containers.len(), "Listed containers");
        Ok(containers.into_iter().map(listing_from_summary).collect())
    }

    async fn stats(&self, id: &str) -> Result<RawContainerStats> {
        let mut stream = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );

        match stream.next().await {
            Some(Ok(stats)) => Ok(raw_from_stats(&stats)),
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::Upstream(format!("no stats returned for {}", id))),
        }
    }

    async fn inspect(&self, id: &str) -> Result<HostConfigLimits> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        Ok(details
            .host_config
            .map(|hc| HostConfigLimits {
                memory: hc.memory,
                memory_reservation: hc.memory_reservation,
                nano_cpus: hc.nano_cpus,
                cpu_quota: hc.cpu_quota,
                cpu_period: hc.cpu_period,
            })
            .unwrap_or_default())
    }

    async fn details(&self, id: &str) -> Result<ContainerDetails> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(details_from_inspect(details))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let (from_image, tag) = split_image_tag(image);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            let update = update?;
            if let Some(status) = update.status {
                debug!(image, status = %status, "Image pull progress");
            }
        }
        info!(image, "Image pulled");
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, None::<StopContainerOptions>)
            .await?;
        Ok(())
    }

    async fn restart(&self, id: &str) -> Result<()> {
        self.docker
            .restart_container(id, None::<RestartContainerOptions>)
            .await?;
        Ok(())
    }
}

fn cpu_counters(stats: &CPUStats) -> CpuCounters {
    CpuCounters {
        total_usage: stats.cpu_usage.total_usage,
        system_usage: stats.system_cpu_usage,
        online_cpus: stats.online_cpus,
        percpu_count: stats
            .cpu_usage
            .percpu_usage
            .as_ref()
            .map(|list| list.len() as u64),
    }
}

fn raw_from_stats(stats: &Stats) -> RawContainerStats {
    let networks = stats
        .networks
        .as_ref()
        .map(|networks| {
            networks
                .values()
                .map(|net| NetworkCounters {
                    rx_bytes: net.rx_bytes,
                    tx_bytes: net.tx_bytes,
                })
                .collect()
        })
        .unwrap_or_default();

    let blkio = stats
        .blkio_stats
        .io_service_bytes_recursive
        .as_ref()
        .map(|entries| {
            entries
                .iter()
                .map(|entry| BlkioEntry {
                    op: entry.op.clone(),
                    value: entry.value,
                })
                .collect()
        })
        .unwrap_or_default();

    RawContainerStats {
        cpu: cpu_counters(&stats.cpu_stats),
        precpu: cpu_counters(&stats.precpu_stats),
        memory_usage: stats.memory_stats.usage,
        memory_limit: stats.memory_stats.limit,
        networks,
        blkio,
    }
}

/// Split `repo[:tag]` so a bare repository pulls `latest` instead of
/// every tag. Digest references are passed through untouched.
fn split_image_tag(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

fn details_from_inspect(details: ContainerInspectResponse) -> ContainerDetails {
    ContainerDetails {
        image: details
            .config
            .and_then(|config| config.image)
            .or(details.image)
            .unwrap_or_default(),
        running: details
            .state
            .and_then(|state| state.running)
            .unwrap_or(false),
    }
}

fn port_mapping(port: Port) -> PortMapping {
    PortMapping {
        ip: port.ip,
        private_port: port.private_port,
        public_port: port.public_port,
        port_type: port.typ.map(|t| t.to_string()),
    }
}

fn listing_from_summary(summary: ContainerSummary) -> ContainerListing {
    ContainerListing {
        id: summary.id.unwrap_or_default(),
        names: summary.names.unwrap_or_default(),
        image: summary.image.unwrap_or_default(),
        state: summary.state.unwrap_or_default(),
        status: summary.status.unwrap_or_default(),
        created: summary.created.unwrap_or(0),
        ports: summary
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(port_mapping)
            .collect(),
        labels: summary.labels.unwrap_or_default(),
    }
}
