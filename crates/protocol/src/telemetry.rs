use serde::{Deserialize, Serialize};

/// Hardware metrics collected from a remote host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    #[serde(default)]
    pub storage: Vec<StorageInfo>,
    pub network: NetworkInfo,
    /// When the remote side produced the sample.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// CPU model, core count, and load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub model: String,
    pub cores: u32,
    /// Usage in percent, 0-100.
    pub usage: f64,
    /// MHz.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    /// Celsius.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// Memory usage in MiB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub usage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap: Option<SwapInfo>,
}

/// Swap usage in MiB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapInfo {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub usage: f64,
}

/// Kind of block device backing a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskKind {
    Ssd,
    Hdd,
}

/// A mounted filesystem, sizes in MiB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub device: String,
    pub mount_point: String,
    pub filesystem: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub usage: f64,
    #[serde(rename = "type")]
    pub kind: DiskKind,
}

/// Aggregate network counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,
    pub total_rx: u64,
    pub total_tx: u64,
    /// MB/s.
    pub rx_speed: f64,
    pub tx_speed: f64,
}

/// Per-interface network counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub status: String,
    pub rx: u64,
    pub tx: u64,
    pub rx_speed: f64,
    pub tx_speed: f64,
}

impl TelemetrySnapshot {
    /// Usage of the fullest mounted filesystem, if any are reported.
    pub fn max_storage_usage(&self) -> Option<f64> {
        self.storage
            .iter()
            .map(|s| s.usage)
            .fold(None, |acc, u| Some(acc.map_or(u, |a: f64| a.max(u))))
    }
}
