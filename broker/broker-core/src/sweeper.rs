//! Staleness sweeper.
//!
//! Drops registry entries whose last liveness signal is older than the
//! threshold. This is bookkeeping only: a device whose heartbeats are late may
//! still have a healthy socket, so the sweeper never closes connections. An
//! entry for a dead socket can outlive it by up to one sweep period.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::DeviceRegistry;

pub struct StalenessSweeper {
    registry:  Arc<DeviceRegistry>,
    period:    Duration,
    threshold: chrono::Duration,
}

impl StalenessSweeper {
    pub fn new(registry: Arc<DeviceRegistry>, period: Duration, threshold: Duration) -> Self {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        Self { registry, period, threshold }
    }

    /// One pass. Returns the evicted device ids.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> Vec<String> {
        let evicted = self.registry.evict_stale(now, self.threshold);
        for device_id in &evicted {
            warn!(device_id = %device_id, "Device connection stale, removing");
        }

        let active = self.registry.len();
        metrics::gauge!("broker.devices.active").set(active as f64);
        if !evicted.is_empty() {
            metrics::counter!("broker.devices.evicted").increment(evicted.len() as u64);
        }
        evicted
    }

    /// Sweep every period until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let evicted = self.sweep_once(Utc::now());
                    info!(
                        active_devices = self.registry.len(),
                        evicted        = evicted.len(),
                        "Staleness sweep complete"
                    );
                }
            }
        }
        info!("Staleness sweeper stopped");
    }
}
