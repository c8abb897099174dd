//! Prometheus scrape endpoint.

use std::net::SocketAddr;

/// Install the global metrics recorder and serve it on `addr`.
///
/// Must be called from inside a tokio runtime; the HTTP listener is bound
/// before this returns and served on a spawned task.
pub fn install_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("metrics exporter on {}: {}", addr, e))
}
