//! FleetCam session broker
//!
//! Entry point. Responsibilities:
//! 1. Load configuration
//! 2. Initialise JSON logging and the Prometheus exporter
//! 3. Bind the device and viewer endpoints
//! 4. Serve until SIGINT/SIGTERM, then drain every connection

use anyhow::Result;
use broker_core::{Broker, BrokerConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Configuration ──────────────────────────────────────────────────────────
    let cfg = BrokerConfig::load()
        .map_err(|e| { eprintln!("FATAL: {e:#}"); e })?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cfg.log_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .json()
        .init();

    info!(
        device_addr = %cfg.device_listen_addr,
        viewer_addr = %cfg.viewer_listen_addr,
        version     = env!("CARGO_PKG_VERSION"),
        "FleetCam session broker starting"
    );

    // ── Metrics exporter ────────────────────────────────────────────────────────
    broker_core::telemetry::install_prometheus(cfg.metrics_addr)?;

    // ── Broker ──────────────────────────────────────────────────────────────────
    let broker = Broker::bind(cfg).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    broker.run(shutdown).await
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
