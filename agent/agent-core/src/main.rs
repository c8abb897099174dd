//! FleetCam device agent
//!
//! Entry point. Responsibilities:
//! 1. Load configuration
//! 2. Resolve the device identity (id file → hardware address → generated)
//! 3. Build the camera from config
//! 4. Start the broker link (interface selection, reconnect, heartbeats, frames)
//! 5. Start the local health API (localhost:7777)
//! 6. Start the metrics exporter
//!
//! Data topology inside the agent:
//!
//!   [FrameSource] ─→ [transport loop] ─→ websocket ─→ broker
//!                          │
//!                          └─ LinkState (watch) ─→ [local API /healthz, /v1/link]

mod config;
mod local_api;
mod telemetry;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use frame_source::FrameSource;
use net_select::{DeviceIdentity, InterfaceProbe, SysfsProbe};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use ws_transport::LinkState;

const SYSFS_NET: &str = "/sys/class/net";

#[tokio::main]
async fn main() -> Result<()> {
    // ── Configuration ──────────────────────────────────────────────────────────
    let cfg = config::AgentConfig::load()
        .map_err(|e| { eprintln!("FATAL: {e:#}"); e })?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cfg.log_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .json()
        .init();

    // ── Identity ───────────────────────────────────────────────────────────────
    let identity = DeviceIdentity::resolve(&cfg.device_id_file, Path::new(SYSFS_NET));

    info!(
        device_id = %identity.device_id,
        broker    = %cfg.broker_url,
        version   = env!("CARGO_PKG_VERSION"),
        "FleetCam device agent starting"
    );

    // ── Metrics exporter ────────────────────────────────────────────────────────
    telemetry::install_prometheus(cfg.metrics_addr)?;

    // ── Collaborators ───────────────────────────────────────────────────────────
    let camera: Arc<dyn FrameSource> = Arc::from(
        frame_source::from_config(&cfg.camera).context("camera configuration")?,
    );
    info!(camera = camera.source_id(), "Camera initialized");

    let probe: Arc<dyn InterfaceProbe> = Arc::new(SysfsProbe::new(SYSFS_NET));

    let (link_tx, link_rx) = watch::channel(LinkState::Disconnected);
    let shutdown = CancellationToken::new();

    // ── Task 1: Broker link ────────────────────────────────────────────────────
    // Retries forever; returns only once `shutdown` is cancelled.
    let transport_task = tokio::spawn({
        let transport_cfg = cfg.transport_config(identity.device_id.clone());
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = ws_transport::run_transport_loop(transport_cfg, probe, camera, link_tx, shutdown).await {
                error!(error = %e, "Transport loop fatal error");
            }
        }
    });

    // ── Task 2: Local health API ───────────────────────────────────────────────
    // A bind failure loses the health endpoint only; frames keep flowing.
    let api_state = Arc::new(local_api::LocalApiState {
        device_id: identity.device_id.clone(),
        link:      link_rx,
    });
    let api_task = tokio::spawn({
        let addr = cfg.local_api_addr;
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = local_api::run(addr, api_state, shutdown).await {
                error!(addr = %addr, error = %e, "Local health API exited");
            }
        }
    });

    // ── Run until SIGINT/SIGTERM ───────────────────────────────────────────────
    wait_for_signal().await;
    info!("Shutdown signal received");
    shutdown.cancel();

    for (name, task) in [("transport", transport_task), ("local_api", api_task)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Task panicked");
        }
    }

    info!("FleetCam device agent stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
