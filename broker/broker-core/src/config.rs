//! Broker configuration loaded from a YAML file.
//!
//! Configuration file location: /etc/fleetcam/broker.yaml (default)
//! Override via environment: FLEETCAM_BROKER_CONFIG=/path/to/broker.yaml
//!
//! Every key has a default. Without the env var and without the default file
//! the broker runs on built-in defaults; a file that exists (or is named
//! explicitly) but cannot be read or parsed is a startup error.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

pub const CONFIG_ENV: &str = "FLEETCAM_BROKER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fleetcam/broker.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// Device endpoint. Devices connect here and send `device_info` first.
    #[serde(default = "default_device_listen_addr")]
    pub device_listen_addr: SocketAddr,

    /// Viewer endpoint, conventionally the device port + 1.
    #[serde(default = "default_viewer_listen_addr")]
    pub viewer_listen_addr: SocketAddr,

    #[serde(default = "default_sweep_interval_s")]
    pub sweep_interval_s: u64,

    /// A device not heard from for longer than this is dropped from the registry.
    #[serde(default = "default_stale_after_s")]
    pub stale_after_s: u64,

    /// Frames buffered per viewer before that viewer starts losing frames.
    #[serde(default = "default_viewer_queue_depth")]
    pub viewer_queue_depth: usize,

    /// Outbound messages buffered per device connection.
    #[serde(default = "default_device_queue_depth")]
    pub device_queue_depth: usize,

    /// A viewer whose socket does not accept a frame within this is closed.
    #[serde(default = "default_viewer_send_timeout_ms")]
    pub viewer_send_timeout_ms: u64,

    /// Bind address for the Prometheus scrape endpoint.
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: SocketAddr,

    /// Log level: "trace", "debug", "info", "warn", "error". RUST_LOG wins.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_device_listen_addr()     -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 6789)) }
fn default_viewer_listen_addr()     -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 6790)) }
fn default_sweep_interval_s()       -> u64        { 10 }
fn default_stale_after_s()          -> u64        { 30 }
fn default_viewer_queue_depth()     -> usize      { 32 }
fn default_device_queue_depth()     -> usize      { 64 }
fn default_viewer_send_timeout_ms() -> u64        { 2000 }
fn default_metrics_addr()           -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 9090)) }
fn default_log_level()              -> String     { "info".to_string() }

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            device_listen_addr:     default_device_listen_addr(),
            viewer_listen_addr:     default_viewer_listen_addr(),
            sweep_interval_s:       default_sweep_interval_s(),
            stale_after_s:          default_stale_after_s(),
            viewer_queue_depth:     default_viewer_queue_depth(),
            device_queue_depth:     default_device_queue_depth(),
            viewer_send_timeout_ms: default_viewer_send_timeout_ms(),
            metrics_addr:           default_metrics_addr(),
            log_level:              default_log_level(),
        }
    }
}

impl BrokerConfig {
    /// Resolve the config path from the environment and load it.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::from_file(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        // An empty document deserializes to unit, not to a map of defaults.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: BrokerConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.sweep_interval_s > 0, "sweep_interval_s must be positive");
        anyhow::ensure!(self.viewer_queue_depth > 0, "viewer_queue_depth must be positive");
        anyhow::ensure!(self.device_queue_depth > 0, "device_queue_depth must be positive");
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_s)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_s)
    }

    pub fn viewer_send_timeout(&self) -> Duration {
        Duration::from_millis(self.viewer_send_timeout_ms)
    }
}
