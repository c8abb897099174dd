//! Broker link for the device agent.
//!
//! State machine, one instance per device process:
//!
//!   Disconnected ──(usable interface)──→ Connecting ──(handshake)──→ Connected
//!        ↑   └─(no interface: wait no_network_backoff, select again)    │
//!        └───────────────(any error: wait retry_backoff)────────────────┘
//!
//! While connected:
//! - `device_info` goes out first, exactly once per connection
//! - `heartbeat` every heartbeat interval
//! - a frame is captured every frame interval and sent as `camera_frame`
//! - `capture_request` from the broker triggers an immediate capture
//! - `status_request` from the broker is answered with `status_response`
//!
//! Captures run on their own task and report back over a channel, so a slow
//! camera never delays heartbeats or inbound handling. At most one capture is
//! in flight per connection.
//!
//! The current state is published on a `watch` channel for the local health API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine as _;
use bytes::Bytes;
use frame_source::{CaptureError, FrameSource};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use net_select::{InterfaceDescriptor, InterfaceProbe};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wire_protocol::{ConnectionType, DeviceMessage, ServerMessage};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Upper bound on TCP connect plus websocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ──────────────────────────────────────────────────────────────────────────────
// Configuration and state
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Device endpoint of the broker, e.g. `ws://broker.local:6789`.
    pub broker_url:         String,
    pub device_id:          String,
    /// Candidate uplinks, probed in this order.
    pub interfaces:         Vec<InterfaceDescriptor>,
    pub heartbeat_interval: Duration,
    /// Wait after a failed or dropped connection.
    pub retry_backoff:      Duration,
    /// Wait before selecting again when no interface is usable.
    pub no_network_backoff: Duration,
    /// Periodic capture interval; `None` captures only on request.
    pub frame_interval:     Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting { interface: ConnectionType },
    Connected { interface: ConnectionType },
}

impl LinkState {
    pub fn label(&self) -> &'static str {
        match self {
            LinkState::Disconnected      => "disconnected",
            LinkState::Connecting { .. } => "connecting",
            LinkState::Connected { .. }  => "connected",
        }
    }

    pub fn interface(&self) -> Option<ConnectionType> {
        match self {
            LinkState::Disconnected => None,
            LinkState::Connecting { interface } | LinkState::Connected { interface } => Some(*interface),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected { .. })
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Reconnect loop
// ──────────────────────────────────────────────────────────────────────────────

/// Keep a connection to the broker until `shutdown` is cancelled.
///
/// Errors from individual connections are logged and retried; this returns
/// only on shutdown.
pub async fn run_transport_loop(
    config:   TransportConfig,
    probe:    Arc<dyn InterfaceProbe>,
    camera:   Arc<dyn FrameSource>,
    state:    watch::Sender<LinkState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut current: Option<ConnectionType> = None;

    while !shutdown.is_cancelled() {
        state.send_replace(LinkState::Disconnected);

        let Some(interface) = net_select::best_connection(&config.interfaces, probe.as_ref()) else {
            warn!(
                retry_ms = config.no_network_backoff.as_millis() as u64,
                "No network connection available"
            );
            if sleep_or_cancel(config.no_network_backoff, &shutdown).await {
                break;
            }
            continue;
        };

        if current != Some(interface) {
            info!(connection = %interface, "Switching to {} connection", interface);
            current = Some(interface);
        }

        state.send_replace(LinkState::Connecting { interface });
        info!(broker = %config.broker_url, connection = %interface, "Connecting to broker");

        match connect_and_run(&config, interface, &camera, &state, &shutdown).await {
            Ok(()) => break,
            Err(e) => {
                state.send_replace(LinkState::Disconnected);
                metrics::counter!("agent.reconnects").increment(1);
                error!(
                    error      = %format!("{e:#}"),
                    backoff_ms = config.retry_backoff.as_millis() as u64,
                    "Broker connection lost, reconnecting"
                );
            }
        }

        if sleep_or_cancel(config.retry_backoff, &shutdown).await {
            break;
        }
    }

    state.send_replace(LinkState::Disconnected);
    info!("Transport loop stopped");
    Ok(())
}

/// True if cancelled before `period` elapsed.
async fn sleep_or_cancel(period: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(period) => false,
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// One connection
// ──────────────────────────────────────────────────────────────────────────────

/// Returns `Ok` only when stopped by `shutdown`; every other exit is an error.
async fn connect_and_run(
    config:    &TransportConfig,
    interface: ConnectionType,
    camera:    &Arc<dyn FrameSource>,
    state:     &watch::Sender<LinkState>,
    shutdown:  &CancellationToken,
) -> Result<()> {
    let ws = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        connected = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(config.broker_url.as_str())) => {
            let (ws, _response) = connected
                .context("websocket connect timed out")?
                .context("websocket connect")?;
            ws
        }
    };
    let (mut tx, mut rx) = ws.split();

    send(&mut tx, &DeviceMessage::DeviceInfo {
        device_id:       config.device_id.clone(),
        connection_type: interface,
    })
    .await
    .context("sending device_info")?;

    state.send_replace(LinkState::Connected { interface });
    info!(broker = %config.broker_url, device_id = %config.device_id, connection = %interface, "Connected to broker");

    let mut heartbeat = periodic(config.heartbeat_interval);
    let mut frame_tick = config.frame_interval.filter(|p| !p.is_zero()).map(periodic);

    let (capture_tx, mut capture_rx) = mpsc::channel::<Result<Bytes, CaptureError>>(1);
    let mut capture_in_flight = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = tx.send(Message::Close(None)).await;
                return Ok(());
            }

            _ = heartbeat.tick() => {
                send(&mut tx, &DeviceMessage::Heartbeat {
                    device_id:       config.device_id.clone(),
                    connection_type: interface,
                })
                .await
                .context("sending heartbeat")?;
                debug!("Sent heartbeat to broker");
            }

            _ = tick_optional(&mut frame_tick) => {
                start_capture(camera, &capture_tx, &mut capture_in_flight);
            }

            Some(captured) = capture_rx.recv() => {
                capture_in_flight = false;
                match captured {
                    Ok(frame) => {
                        let frame_data = base64::engine::general_purpose::STANDARD.encode(&frame);
                        send(&mut tx, &DeviceMessage::CameraFrame { frame_data })
                            .await
                            .context("sending camera_frame")?;
                        metrics::counter!("agent.frames.sent").increment(1);
                        debug!(bytes = frame.len(), "Sent frame to broker");
                    }
                    Err(e) => {
                        metrics::counter!("agent.capture.failures").increment(1);
                        warn!(camera = camera.source_id(), error = %e, "Frame capture failed");
                    }
                }
            }

            inbound = rx.next() => {
                let msg = match inbound {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => return Err(e).context("websocket read"),
                    None => anyhow::bail!("broker closed the connection"),
                };
                match msg {
                    Message::Text(text) => match wire_protocol::decode_server_message(text.as_str()) {
                        Ok(ServerMessage::CaptureRequest) => {
                            debug!("Capture requested by broker");
                            start_capture(camera, &capture_tx, &mut capture_in_flight);
                        }
                        Ok(ServerMessage::StatusRequest) => {
                            send(&mut tx, &DeviceMessage::StatusResponse {
                                device_id:       config.device_id.clone(),
                                connection_type: interface,
                                timestamp:       wire_protocol::unix_timestamp(),
                            })
                            .await
                            .context("sending status_response")?;
                        }
                        Ok(ServerMessage::Status { devices, viewer_count }) => {
                            debug!(devices = devices.len(), viewer_count, "Fleet status from broker");
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed message from broker"),
                    },
                    Message::Close(frame) => anyhow::bail!("broker closed the connection: {:?}", frame),
                    _ => {} // ping/pong handled by tungstenite
                }
            }
        }
    }
}

fn periodic(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn start_capture(
    camera:    &Arc<dyn FrameSource>,
    results:   &mpsc::Sender<Result<Bytes, CaptureError>>,
    in_flight: &mut bool,
) {
    if *in_flight {
        debug!("Capture already in flight, skipping");
        return;
    }
    *in_flight = true;

    let camera = Arc::clone(camera);
    let results = results.clone();
    tokio::spawn(async move {
        let captured = camera.capture_frame().await;
        // Receiver is gone if the connection dropped meanwhile.
        let _ = results.send(captured).await;
    });
}

async fn send(tx: &mut WsSink, msg: &DeviceMessage) -> Result<()> {
    let text = wire_protocol::encode(msg).context("encoding device message")?;
    tx.send(Message::text(text)).await?;
    Ok(())
}
