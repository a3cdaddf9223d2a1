//! Core data models for the dashboard server
//!
//! Field names are part of the wire contract observed by dashboard clients.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Operating system identity (refreshed by the slow loop)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsInfo {
    pub distro: String,
    pub release: String,
    pub arch: String,
    pub hostname: String,
}

impl Default for OsInfo {
    fn default() -> Self {
        Self {
            distro: "Unknown".to_string(),
            release: "Unknown".to_string(),
            arch: "Unknown".to_string(),
            hostname: "Unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    /// Whole-host load in percent, rounded
    pub load: f64,
    pub cores: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub used: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub total: u64,
    pub used: u64,
    pub percent: f64,
}

/// Throughput of the default interface in bytes per second
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkRate {
    pub rx_sec: f64,
    pub tx_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceStats {
    pub iface: String,
    pub rx_sec: f64,
    pub tx_sec: f64,
    pub operstate: String,
}

/// One full snapshot of host telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub os: OsInfo,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub storage: StorageInfo,
    pub network: NetworkRate,
    pub interfaces: Vec<InterfaceStats>,
    /// Unix milliseconds
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryNetwork {
    pub rx: f64,
    pub tx: f64,
}

/// Compact history entry derived from a [`Sample`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub network: HistoryNetwork,
    pub cpu: f64,
    pub memory: f64,
    pub timestamp: i64,
}

impl From<&Sample> for HistoryPoint {
    fn from(sample: &Sample) -> Self {
        Self {
            network: HistoryNetwork {
                rx: sample.network.rx_sec,
                tx: sample.network.tx_sec,
            },
            cpu: sample.cpu.load,
            memory: sample.memory.percent,
            timestamp: sample.timestamp,
        }
    }
}

/// Metric an alert was raised for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Cpu,
    Memory,
    Storage,
}

impl AlertType {
    pub const ALL: [AlertType; 3] = [AlertType::Cpu, AlertType::Memory, AlertType::Storage];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Cpu => "cpu",
            AlertType::Memory => "memory",
            AlertType::Storage => "storage",
        }
    }

    /// Value of this metric in a sample
    pub fn value_of(&self, sample: &Sample) -> f64 {
        match self {
            AlertType::Cpu => sample.cpu.load,
            AlertType::Memory => sample.memory.percent,
            AlertType::Storage => sample.storage.percent,
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold crossing notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    /// `type:level`, also the cooldown key
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub level: AlertLevel,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: i64,
}

impl AlertEvent {
    pub fn key(alert_type: AlertType, level: AlertLevel) -> String {
        format!("{}:{}", alert_type, level)
    }
}

/// Configured resource limits of a container
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Memory limit in bytes, 0 when unlimited
    pub memory: u64,
    pub memory_reservation: u64,
    /// CPU limit in cores, 0 when unlimited
    pub cpu: f64,
}

/// Per-container runtime statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub mem_usage: u64,
    pub mem_limit: u64,
    pub mem_percent: f64,
    pub net_rx: u64,
    pub net_tx: u64,
    pub blk_read: u64,
    pub blk_write: u64,
    pub limits: Limits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub private_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub port_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub uptime_seconds: u64,
}

/// Container entry of the dashboard listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerView {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub created: i64,
    pub ports: Vec<PortMapping>,
    pub labels: HashMap<String, String>,
    pub stats: ContainerStats,
    pub host: HostInfo,
}
