use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the mesh agent.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Local runtime settings.
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// Tunnel listen port for spokes; hub routers always use 51820.
    #[serde(default = "default_port")]
    pub listen_port: u16,
    /// Tunnel interface name; empty picks the OS default.
    #[serde(default)]
    pub interface: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub identity_path: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_port: default_port(),
            interface: String::new(),
            log_level: default_log_level(),
            identity_path: None,
        }
    }
}

/// Where the coordinator lives and which zone to join.
#[derive(Debug, Deserialize)]
pub struct CoordinatorConfig {
    /// Message bus address (host:port).
    pub bus: Option<String>,
    /// Device registry base URL.
    pub api_url: Option<String>,
    #[serde(default)]
    pub zone: String,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_registry_timeout")]
    pub registry_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bus: None,
            api_url: None,
            zone: String::new(),
            ready_timeout_secs: default_ready_timeout(),
            registry_timeout_secs: default_registry_timeout(),
        }
    }
}

impl CoordinatorConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_secs)
    }
}

/// Addressing and reachability.
#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    /// Device id assigned by the coordinator; defaults to the public key.
    pub device_id: Option<String>,
    /// The two reflectors compared for symmetric NAT detection.
    #[serde(default = "default_reflectors")]
    pub stun_servers: Vec<String>,
    /// Advertise the reflexive address as the endpoint.
    #[serde(default)]
    pub stun: bool,
    pub endpoint_ip: Option<String>,
    pub request_ip: Option<String>,
    #[serde(default)]
    pub child_prefixes: Vec<String>,
    #[serde(default)]
    pub hub_router: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            stun_servers: default_reflectors(),
            stun: false,
            endpoint_ip: None,
            request_ip: None,
            child_prefixes: Vec::new(),
            hub_router: false,
        }
    }
}

/// Loop and keepalive timing.
#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    /// WireGuard persistent keepalive for spokes, 0 disables
    #[serde(default = "default_wg_keepalive")]
    pub wg_keepalive_secs: u16,

    /// Re-apply the last roster this often so failed operations are retried
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// Re-run NAT classification this often
    #[serde(default = "default_nat_refresh")]
    pub nat_refresh_secs: u64,

    #[serde(default = "default_nat_retries")]
    pub nat_retries: u32,

    /// First retry delay; doubles on each retry
    #[serde(default = "default_nat_backoff")]
    pub nat_backoff_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            wg_keepalive_secs: default_wg_keepalive(),
            resync_interval_secs: default_resync_interval(),
            nat_refresh_secs: default_nat_refresh(),
            nat_retries: default_nat_retries(),
            nat_backoff_ms: default_nat_backoff(),
        }
    }
}

impl TimingConfig {
    pub fn wg_keepalive(&self) -> Option<u16> {
        (self.wg_keepalive_secs > 0).then_some(self.wg_keepalive_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn nat_refresh(&self) -> Duration {
        Duration::from_secs(self.nat_refresh_secs)
    }

    pub fn nat_backoff(&self) -> Duration {
        Duration::from_millis(self.nat_backoff_ms)
    }
}

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

fn default_port() -> u16 {
    51820
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_ready_timeout() -> u64 {
    10
}
fn default_registry_timeout() -> u64 {
    5
}
fn default_reflectors() -> Vec<String> {
    crate::stun::DEFAULT_REFLECTORS
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_wg_keepalive() -> u16 {
    25
}
fn default_resync_interval() -> u64 {
    60
}
fn default_nat_refresh() -> u64 {
    300
}
fn default_nat_retries() -> u32 {
    2
}
fn default_nat_backoff() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9090
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML config")
    }

    /// Load from the first existing default path, or return defaults.
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            "/etc/meshd/config.toml",
            "~/.meshd/config.toml",
            "./config.toml",
        ];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                return Self::load(&expanded);
            }
        }

        Ok(Self::default())
    }
}
