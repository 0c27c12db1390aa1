//! Configuration for a mesh node
//!
//! Handles configuration defaults, TOML file loading, and validation.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local resource scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Directories scanned for installable resources
    #[serde(default)]
    pub locations: Vec<PathBuf>,

    /// File extensions considered installable resources
    #[serde(default = "default_resource_extensions")]
    pub extensions: Vec<String>,

    /// Interval between periodic scans (seconds)
    #[serde(default = "default_scan_interval")]
    pub scan_interval_seconds: u64,
}

fn default_resource_extensions() -> Vec<String> {
    ["so", "ko", "kext", "sys", "bin"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_scan_interval() -> u64 {
    300
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            locations: Vec::new(),
            extensions: default_resource_extensions(),
            scan_interval_seconds: default_scan_interval(),
        }
    }
}

/// Discovery and heartbeat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Interval between self-advertisements (seconds)
    #[serde(default = "default_advertise_interval")]
    pub advertise_interval_seconds: u64,

    /// Interval between liveness probe passes (seconds)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,

    /// Per-probe timeout (seconds)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,

    /// Consecutive probe failures before a peer is marked stale
    #[serde(default = "default_probe_failure_threshold")]
    pub probe_failure_threshold: u32,

    /// Addresses of peers to announce ourselves to on startup
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
}

fn default_advertise_interval() -> u64 {
    60
}

fn default_probe_interval() -> u64 {
    120
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_probe_failure_threshold() -> u32 {
    3
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            advertise_interval_seconds: default_advertise_interval(),
            probe_interval_seconds: default_probe_interval(),
            probe_timeout_seconds: default_probe_timeout(),
            probe_failure_threshold: default_probe_failure_threshold(),
            bootstrap_peers: Vec::new(),
        }
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between sweep passes (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,

    /// How long a stale node may go unheard before eviction (seconds)
    #[serde(default = "default_eviction_grace")]
    pub eviction_grace_seconds: u64,

    /// How long an evicted node row is kept before deletion (seconds)
    #[serde(default = "default_purge_grace")]
    pub purge_grace_seconds: u64,
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_eviction_grace() -> u64 {
    86_400 // 24 hours
}

fn default_purge_grace() -> u64 {
    86_400
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: default_sweep_interval(),
            eviction_grace_seconds: default_eviction_grace(),
            purge_grace_seconds: default_purge_grace(),
        }
    }
}

/// Content cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Blob directory; defaults to `<data_dir>/cache`
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Storage quota for managed blobs (bytes)
    #[serde(default = "default_cache_quota")]
    pub quota_bytes: u64,
}

fn default_cache_quota() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            quota_bytes: default_cache_quota(),
        }
    }
}

/// Request/transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Default deadline for `request_resource` when the caller passes none
    /// (seconds)
    #[serde(default = "default_request_timeout")]
    pub default_request_timeout_seconds: u64,

    /// Maximum transfer retries per request after disqualified offers
    #[serde(default = "default_max_transfer_retries")]
    pub max_transfer_retries: u32,
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_transfer_retries() -> u32 {
    3
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            default_request_timeout_seconds: default_request_timeout(),
            max_transfer_retries: default_max_transfer_retries(),
        }
    }
}

/// Top-level mesh node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Durable state root (registry, identity, cache, staging)
    pub data_dir: PathBuf,

    /// Address peers reach this node at. For TCP this is `host:port`; the
    /// in-process transport uses opaque names. Must be set before the node
    /// can advertise.
    pub network_address: String,

    /// TCP listener bind address, when the TCP transport is used
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,

    /// Human-readable name; defaults to the hostname
    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub transfer: TransferConfig,
}

impl MeshConfig {
    /// Minimal config rooted at `data_dir`, everything else defaulted.
    pub fn new(data_dir: impl Into<PathBuf>, network_address: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            network_address: network_address.into(),
            listen_addr: None,
            display_name: None,
            scanner: ScannerConfig::default(),
            discovery: DiscoveryConfig::default(),
            health: HealthConfig::default(),
            cache: CacheConfig::default(),
            transfer: TransferConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants the type system can't express.
    pub fn validate(&self) -> Result<()> {
        if self.network_address.is_empty() {
            bail!("network_address must not be empty");
        }
        if self.discovery.probe_failure_threshold == 0 {
            bail!("discovery.probe_failure_threshold must be at least 1");
        }
        if self.discovery.probe_timeout_seconds >= self.discovery.probe_interval_seconds {
            bail!("discovery.probe_timeout_seconds must be below probe_interval_seconds");
        }
        if self.transfer.default_request_timeout_seconds == 0 {
            bail!("transfer.default_request_timeout_seconds must be at least 1");
        }
        if self.cache.quota_bytes == 0 {
            bail!("cache.quota_bytes must be nonzero");
        }
        Ok(())
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .directory
            .clone()
            .unwrap_or_else(|| self.data_dir.join("cache"))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.default_request_timeout_seconds)
    }
}
