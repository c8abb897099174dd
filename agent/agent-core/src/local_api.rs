//! Local HTTP API — lets on-device tooling ask whether the broker link is up.
//!
//! Listens on `local_api_addr` (loopback by default). No authentication.
//!
//! Endpoints:
//!   GET /healthz   — 200 "ok" while connected to the broker, 503 "reconnecting" otherwise
//!   GET /v1/link   — JSON: device id, link state, selected interface

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wire_protocol::ConnectionType;
use ws_transport::LinkState;

pub struct LocalApiState {
    pub device_id: String,
    /// Published by the transport loop.
    pub link:      watch::Receiver<LinkState>,
}

#[derive(Debug, Serialize)]
struct LinkResponse {
    device_id: String,
    state:     &'static str,
    interface: Option<ConnectionType>,
}

/// Build the axum Router (useful for testing without binding a port).
pub fn router(state: Arc<LocalApiState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/v1/link", get(handle_link))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn run(
    addr:     SocketAddr,
    state:    Arc<LocalApiState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Local health API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// GET /healthz
///
/// The watchdog and provisioning scripts poll this; it flips as soon as the
/// transport loop publishes a new state.
async fn handle_healthz(State(state): State<Arc<LocalApiState>>) -> impl IntoResponse {
    if state.link.borrow().is_connected() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "reconnecting")
    }
}

/// GET /v1/link
async fn handle_link(State(state): State<Arc<LocalApiState>>) -> Json<LinkResponse> {
    let link = *state.link.borrow();
    Json(LinkResponse {
        device_id: state.device_id.clone(),
        state:     link.label(),
        interface: link.interface(),
    })
}
