//! Host metrics provider
//!
//! [`HostMetricsProvider`] is the narrow contract the poller samples through.
//! Every call may fail on its own; the poller decides how to degrade.
//! [`SysinfoProvider`] implements it on top of the `sysinfo` crate.

use crate::error::{Error, Result};
use crate::models::OsInfo;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use sysinfo::{Disks, Networks, System};

/// Whole-host CPU load
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuLoad {
    /// Percent over all cores
    pub current_load: f64,
    pub cores: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySnapshot {
    pub total: u64,
    /// Actively used bytes (excluding reclaimable cache)
    pub active: u64,
}

/// One mounted filesystem
#[derive(Debug, Clone, PartialEq)]
pub struct FsEntry {
    pub mount: String,
    pub size: u64,
    pub used: u64,
    /// Percent used
    pub use_percent: f64,
}

/// Throughput of one interface since the previous call, bytes per second
#[derive(Debug, Clone, PartialEq)]
pub struct NetStat {
    pub iface: String,
    pub rx_sec: f64,
    pub tx_sec: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetInterface {
    pub iface: String,
    pub operstate: String,
    pub internal: bool,
}

/// Source of host telemetry
#[async_trait]
pub trait HostMetricsProvider: Send + Sync {
    async fn os_info(&self) -> Result<OsInfo>;

    async fn current_load(&self) -> Result<CpuLoad>;

    async fn memory(&self) -> Result<MemorySnapshot>;

    async fn fs_size(&self) -> Result<Vec<FsEntry>>;

    async fn network_stats(&self) -> Result<Vec<NetStat>>;

    async fn network_interfaces(&self) -> Result<Vec<NetInterface>>;
}

struct SysinfoState {
    system: System,
    networks: Networks,
    last_network_refresh: Instant,
}

/// [`HostMetricsProvider`] backed by `sysinfo`
#[derive(Clone)]
pub struct SysinfoProvider {
    state: Arc<Mutex<SysinfoState>>,
    hostname_file: Option<PathBuf>,
    hostname: Arc<OnceLock<String>>,
}

impl SysinfoProvider {
    pub fn new() -> Self {
        let mut system = System::new();
        // Establish the baseline for the first usage delta
        system.refresh_cpu();

        Self {
            state: Arc::new(Mutex::new(SysinfoState {
                system,
                networks: Networks::new_with_refreshed_list(),
                last_network_refresh: Instant::now(),
            })),
            hostname_file: None,
            hostname: Arc::new(OnceLock::new()),
        }
    }

    /// Read the hostname from a file first (e.g. the host's `/etc/hostname`
    /// mounted into the container), falling back to the local hostname.
    pub fn with_hostname_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.hostname_file = Some(path.into());
        self
    }


    async fn with_state<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SysinfoState) -> T + Send + 'static,
    {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Internal(format!("sysinfo task failed: {}", e)))
    }
}

impl Default for SysinfoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostMetricsProvider for SysinfoProvider {
    async fn os_info(&self) -> Result<OsInfo> {
        // Both the hostname file and os-release are plain file reads
        let hostname_file = self.hostname_file.clone();
        let hostname = self.hostname.clone();
        tokio::task::spawn_blocking(move || OsInfo {
            distro: System::name().unwrap_or_else(|| "Unknown".to_string()),
            release: System::os_version().unwrap_or_else(|| "Unknown".to_string()),
            arch: System::cpu_arch().unwrap_or_else(|| std::env::consts::ARCH.to_string()),
            hostname: resolve_hostname(&hostname, hostname_file.as_deref()),
        })
        .await
        .map_err(|e| Error::Internal(format!("OS info task failed: {}", e)))
    }

    async fn current_load(&self) -> Result<CpuLoad> {
        self.with_state(|state| {
            state.system.refresh_cpu();
            CpuLoad {
                current_load: state.system.global_cpu_info().cpu_usage() as f64,
                cores: state.system.cpus().len(),
            }
        })
        .await
    }

    async fn memory(&self) -> Result<MemorySnapshot> {
        let snapshot = self
            .with_state(|state| {
                state.system.refresh_memory();
                MemorySnapshot {
                    total: state.system.total_memory(),
                    active: state.system.used_memory(),
                }
            })
            .await?;

        if snapshot.total == 0 {
            return Err(Error::Upstream("total memory reported as zero".to_string()));
        }
        Ok(snapshot)
    }

    async fn fs_size(&self) -> Result<Vec<FsEntry>> {
        tokio::task::spawn_blocking(|| {
            let disks = Disks::new_with_refreshed_list();
            disks
                .list()
                .iter()
                .map(|disk| {
                    let size = disk.total_space();
                    let used = size.saturating_sub(disk.available_space());
                    FsEntry {
                        mount: disk.mount_point().to_string_lossy().into_owned(),
                        size,
                        used,
                        use_percent: if size > 0 {
                            used as f64 / size as f64 * 100.0
                        } else {
                            0.0
                        },
                    }
                })
                .collect()
        })
        .await
        .map_err(|e| Error::Internal(format!("disk enumeration failed: {}", e)))
    }

    async fn network_stats(&self) -> Result<Vec<NetStat>> {
        self.with_state(|state| {
            state.networks.refresh();
            let now = Instant::now();
            let elapsed = now
                .duration_since(state.last_network_refresh)
                .as_secs_f64()
                .max(0.001);
            state.last_network_refresh = now;

            state
                .networks
                .iter()
                .map(|(name, data)| NetStat {
                    iface: name.clone(),
                    rx_sec: data.received() as f64 / elapsed,
                    tx_sec: data.transmitted() as f64 / elapsed,
                })
                .collect()
        })
        .await
    }

    async fn network_interfaces(&self) -> Result<Vec<NetInterface>> {
        self.with_state(|state| {
            state
                .networks
                .iter()
                .map(|(name, _)| NetInterface {
                    iface: name.clone(),
                    operstate: read_operstate(name),
                    internal: name == "lo",
                })
                .collect()
        })
        .await
    }
}

/// Hostname from `file` when readable and non-empty, else the local one.
/// Resolved once per provider.
fn resolve_hostname(cached: &OnceLock<String>, file: Option<&Path>) -> String {
    cached
        .get_or_init(|| {
            file.and_then(|path| std::fs::read_to_string(path).ok())
                .map(|raw| raw.trim().to_string())
                .filter(|name| !name.is_empty())
                .or_else(System::host_name)
                .unwrap_or_else(|| "Unknown".to_string())
        })
        .clone()
}

/// Blocking sysfs read; only called from inside [`SysinfoProvider::with_state`]
fn read_operstate(iface: &str) -> String {
    std::fs::read_to_string(format!("/sys/class/net/{}/operstate", iface))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operstate_of_missing_interface_is_unknown() {
        assert_eq!(read_operstate("definitely-not-an-interface0"), "unknown");
    }

    #[test]
    fn test_hostname_resolved_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostname");
        std::fs::write(&path, "nas\n").unwrap();

        let cached = OnceLock::new();
        assert_eq!(resolve_hostname(&cached, Some(&path)), "nas");
        std::fs::write(&path, "renamed\n").unwrap();
        assert_eq!(resolve_hostname(&cached, Some(&path)), "nas");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_hostname_file_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostname");
        std::fs::write(&path, "homelab-01\n").unwrap();

        let provider = SysinfoProvider::new().with_hostname_file(&path);
        let os = provider.os_info().await.unwrap();
        assert_eq!(os.hostname, "homelab-01");
    }
}
