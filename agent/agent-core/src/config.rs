//! Agent configuration loaded from a YAML file.
//!
//! Configuration file location: /etc/fleetcam/agent.yaml (default)
//! Override via environment: FLEETCAM_AGENT_CONFIG=/path/to/agent.yaml
//!
//! Every key has a default, so a device with no config file at all connects to
//! a broker on localhost using the stock interface table and test camera.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use frame_source::CameraConfig;
use net_select::InterfaceDescriptor;
use serde::Deserialize;
use ws_transport::TransportConfig;

pub const CONFIG_ENV: &str = "FLEETCAM_AGENT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fleetcam/agent.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Device endpoint of the session broker.
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    /// Provisioned device id. Falls back to the hardware address when absent.
    #[serde(default = "default_device_id_file")]
    pub device_id_file: PathBuf,

    /// Candidate uplinks in probe order. Lower priority wins.
    #[serde(default = "net_select::default_descriptors")]
    pub interfaces: Vec<InterfaceDescriptor>,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_no_network_backoff_ms")]
    pub no_network_backoff_ms: u64,

    /// 0 disables periodic capture; frames are then sent only on request.
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,

    #[serde(default)]
    pub camera: CameraConfig,

    /// Local health API. Loopback only; there is no authentication.
    #[serde(default = "default_local_api_addr")]
    pub local_api_addr: SocketAddr,

    /// Bind address for the Prometheus scrape endpoint.
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: SocketAddr,

    /// Log level: "trace", "debug", "info", "warn", "error". RUST_LOG wins.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_broker_url()            -> String     { "ws://127.0.0.1:6789".to_string() }
fn default_device_id_file()        -> PathBuf    { PathBuf::from("/etc/fleetcam/device_id") }
fn default_heartbeat_interval_ms() -> u64        { 5_000 }
fn default_retry_backoff_ms()      -> u64        { 10_000 }
fn default_no_network_backoff_ms() -> u64        { 30_000 }
fn default_frame_interval_ms()     -> u64        { 1_000 }
fn default_local_api_addr()        -> SocketAddr { SocketAddr::from(([127, 0, 0, 1], 7777)) }
fn default_metrics_addr()          -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 9091)) }
fn default_log_level()             -> String     { "info".to_string() }

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker_url:            default_broker_url(),
            device_id_file:        default_device_id_file(),
            interfaces:            net_select::default_descriptors(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            retry_backoff_ms:      default_retry_backoff_ms(),
            no_network_backoff_ms: default_no_network_backoff_ms(),
            frame_interval_ms:     default_frame_interval_ms(),
            camera:                CameraConfig::default(),
            local_api_addr:        default_local_api_addr(),
            metrics_addr:          default_metrics_addr(),
            log_level:             default_log_level(),
        }
    }
}

impl AgentConfig {
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
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: AgentConfig = serde_yaml::from_str(content)?;
        anyhow::ensure!(config.heartbeat_interval_ms > 0, "heartbeat_interval_ms must be positive");
        anyhow::ensure!(!config.interfaces.is_empty(), "interfaces must not be empty");
        // The websocket client is built without TLS.
        anyhow::ensure!(
            config.broker_url.starts_with("ws://"),
            "broker_url must be a ws:// URL, got {}",
            config.broker_url
        );
        Ok(config)
    }

    pub fn transport_config(&self, device_id: String) -> TransportConfig {
        TransportConfig {
            broker_url:         self.broker_url.clone(),
            device_id,
            interfaces:         self.interfaces.clone(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            retry_backoff:      Duration::from_millis(self.retry_backoff_ms),
            no_network_backoff: Duration::from_millis(self.no_network_backoff_ms),
            frame_interval:     (self.frame_interval_ms > 0)
                .then(|| Duration::from_millis(self.frame_interval_ms)),
        }
    }
}
