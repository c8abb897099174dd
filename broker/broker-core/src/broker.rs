//! Session broker — the composition root.
//!
//! Owns the device registry, the viewer set and the staleness sweeper, and runs
//! two independent accept loops:
//!
//!   device endpoint  → one task per device:  decode → dispatch → registry / viewers
//!   viewer endpoint  → one task per viewer:  viewer queue → socket (with deadline)
//!
//! Each device task has its own outbound queue and writer task; the registry
//! holds the queue's sender, which is the only way anything else reaches that
//! device. No registry or viewer-set lock is ever held across a socket write.
//!
//! Shutdown: cancelling the token stops both accept loops, every connection
//! task (each deregisters itself on the way out) and the sweeper. `run`
//! returns once all of them have finished.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use wire_protocol::{DecodeError, DeviceMessage, DeviceStatus, ServerMessage};

use crate::config::BrokerConfig;
use crate::registry::{DeviceLink, DeviceRegistry, SessionId};
use crate::sweeper::StalenessSweeper;
use crate::viewers::ViewerSet;

/// Pause after a failed `accept` (usually fd exhaustion) before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A peer that has not finished the websocket upgrade by then is dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ──────────────────────────────────────────────────────────────────────────────
// Shared state
// ──────────────────────────────────────────────────────────────────────────────

struct Shared {
    registry:            Arc<DeviceRegistry>,
    viewers:             Arc<ViewerSet>,
    device_queue_depth:  usize,
    viewer_send_timeout: Duration,
}

/// Point-in-time fleet view: registry snapshot plus viewer count.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetStatus {
    pub devices:      BTreeMap<String, DeviceStatus>,
    pub viewer_count: usize,
}

impl From<FleetStatus> for ServerMessage {
    fn from(status: FleetStatus) -> Self {
        ServerMessage::Status { devices: status.devices, viewer_count: status.viewer_count }
    }
}

impl Shared {
    fn status(&self) -> FleetStatus {
        FleetStatus {
            devices:      self.registry.snapshot(),
            viewer_count: self.viewers.len(),
        }
    }
}

/// Cheap, cloneable access to a running broker's state.
#[derive(Clone)]
pub struct BrokerHandle {
    shared: Arc<Shared>,
}

impl BrokerHandle {
    pub fn status(&self) -> FleetStatus {
        self.shared.status()
    }

    /// Ask a device for an out-of-schedule frame. False if the device is not
    /// registered or its outbound queue is full.
    pub fn request_capture(&self, device_id: &str) -> bool {
        self.shared.registry.send_to(device_id, ServerMessage::CaptureRequest)
    }

    /// Ask a device to answer with `status_response`.
    pub fn request_status(&self, device_id: &str) -> bool {
        self.shared.registry.send_to(device_id, ServerMessage::StatusRequest)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Broker
// ──────────────────────────────────────────────────────────────────────────────

pub struct Broker {
    device_listener: TcpListener,
    viewer_listener: TcpListener,
    sweep_interval:  Duration,
    stale_after:     Duration,
    shared:          Arc<Shared>,
}

impl Broker {
    /// Bind both endpoints. Port 0 picks a free port; see `device_addr` /
    /// `viewer_addr` for what was bound.
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        let device_listener = TcpListener::bind(config.device_listen_addr)
            .await
            .with_context(|| format!("binding device endpoint {}", config.device_listen_addr))?;
        let viewer_listener = TcpListener::bind(config.viewer_listen_addr)
            .await
            .with_context(|| format!("binding viewer endpoint {}", config.viewer_listen_addr))?;

        let shared = Arc::new(Shared {
            registry:            Arc::new(DeviceRegistry::new()),
            viewers:             Arc::new(ViewerSet::new(config.viewer_queue_depth)),
            device_queue_depth:  config.device_queue_depth.max(1),
            viewer_send_timeout: config.viewer_send_timeout(),
        });

        Ok(Self {
            device_listener,
            viewer_listener,
            sweep_interval: config.sweep_interval(),
            stale_after:    config.stale_after(),
            shared,
        })
    }

    pub fn device_addr(&self) -> Result<SocketAddr> {
        Ok(self.device_listener.local_addr()?)
    }

    pub fn viewer_addr(&self) -> Result<SocketAddr> {
        Ok(self.viewer_listener.local_addr()?)
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle { shared: Arc::clone(&self.shared) }
    }

    /// Serve until `shutdown` is cancelled, then wait for every connection
    /// task to deregister and exit.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();

        info!(
            device_addr = %self.device_addr()?,
            viewer_addr = %self.viewer_addr()?,
            stale_after_s = self.stale_after.as_secs(),
            "Session broker listening"
        );

        let sweeper = StalenessSweeper::new(
            Arc::clone(&self.shared.registry),
            self.sweep_interval,
            self.stale_after,
        );
        tracker.spawn(sweeper.run(shutdown.clone()));

        tokio::join!(
            accept_loop(
                self.device_listener,
                "device",
                Arc::clone(&self.shared),
                tracker.clone(),
                shutdown.clone(),
                handle_device_connection,
            ),
            accept_loop(
                self.viewer_listener,
                "viewer",
                Arc::clone(&self.shared),
                tracker.clone(),
                shutdown.clone(),
                handle_viewer_connection,
            ),
        );

        tracker.close();
        tracker.wait().await;
        info!("Session broker stopped");
        Ok(())
    }
}

async fn accept_loop<F, Fut>(
    listener: TcpListener,
    kind:     &'static str,
    shared:   Arc<Shared>,
    tracker:  TaskTracker,
    shutdown: CancellationToken,
    handler:  F,
) where
    F:   Fn(TcpStream, SocketAddr, Arc<Shared>, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(kind, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        metrics::counter!("broker.connections.accepted", "kind" => kind).increment(1);
        let session = handler(stream, peer, Arc::clone(&shared), shutdown.clone());
        tracker.spawn(async move {
            if let Err(e) = session.await {
                debug!(kind, peer = %peer, error = %e, "Connection ended with error");
            }
        });
    }
    debug!(kind, "Accept loop stopped");
}

/// Websocket upgrade bounded by `HANDSHAKE_TIMEOUT`. `None` when shutdown
/// arrives first.
async fn upgrade(
    stream:   TcpStream,
    kind:     &'static str,
    shutdown: &CancellationToken,
) -> Result<Option<WebSocketStream<TcpStream>>> {
    tokio::select! {
        _ = shutdown.cancelled() => Ok(None),
        ws = tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_async(stream)) => {
            let ws = ws
                .with_context(|| format!("{kind} websocket handshake timed out"))?
                .with_context(|| format!("{kind} websocket handshake"))?;
            Ok(Some(ws))
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Device connections
// ──────────────────────────────────────────────────────────────────────────────

/// Per-connection dispatch state.
struct DeviceConnection {
    peer:      SocketAddr,
    session:   SessionId,
    outbound:  mpsc::Sender<ServerMessage>,
    /// Id this connection registered under with `device_info`, if any.
    device_id: Option<String>,
}

async fn handle_device_connection(
    stream:   TcpStream,
    peer:     SocketAddr,
    shared:   Arc<Shared>,
    shutdown: CancellationToken,
) -> Result<()> {
    let Some(ws) = upgrade(stream, "device", &shutdown).await? else {
        return Ok(());
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    let session = SessionId::next();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(shared.device_queue_depth);
    debug!(peer = %peer, session = %session, "Device connection accepted");

    // Outbound: broker → device
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match wire_protocol::encode(&msg) {
                Ok(t) => t,
                Err(e) => {
                    warn!(session = %session, error = %e, "Failed to encode server message");
                    continue;
                }
            };
            if ws_tx.send(Message::text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut conn = DeviceConnection { peer, session, outbound: out_tx, device_id: None };

    // Inbound: device → broker, strictly in arrival order
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = ws_rx.next() => match next {
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    debug!(peer = %peer, error = %e, "Device websocket error");
                    break;
                }
                None => break,
            },
        };

        match msg {
            Message::Text(text) => conn.dispatch(text.as_str(), &shared),
            Message::Binary(_)  => conn.malformed(&DecodeError::Binary),
            Message::Close(_)   => break,
            _                   => {} // ping/pong handled by tungstenite
        }
    }

    conn.deregister(&shared);
    writer.abort();
    Ok(())
}

impl DeviceConnection {
    fn dispatch(&mut self, text: &str, shared: &Shared) {
        let msg = match wire_protocol::decode_device_message(text) {
            Ok(m) => m,
            Err(e) => return self.malformed(&e),
        };
        let now = Utc::now();

        // Any well-formed message from a registered connection is a liveness signal.
        if let Some(id) = &self.device_id {
            shared.registry.refresh_session(id, self.session, now);
        }

        match msg {
            DeviceMessage::DeviceInfo { device_id, connection_type } => {
                if let Some(previous) = self.device_id.take().filter(|p| *p != device_id) {
                    shared.registry.remove_session(&previous, self.session);
                }
                let link = DeviceLink { session: self.session, outbound: self.outbound.clone() };
                let replaced = shared.registry.upsert(&device_id, connection_type, now, link);

                match replaced {
                    Some(old) if old != self.session => warn!(
                        device_id   = %device_id,
                        old_session = %old,
                        session     = %self.session,
                        "Device re-registered while a previous connection is still open; replacing it"
                    ),
                    _ => info!(
                        device_id       = %device_id,
                        connection_type = %connection_type,
                        peer            = %self.peer,
                        session         = %self.session,
                        "Device registered"
                    ),
                }
                metrics::gauge!("broker.devices.active").set(shared.registry.len() as f64);
                self.device_id = Some(device_id);
            }

            // Liveness applies to the id this connection registered, not the one
            // echoed in the message.
            DeviceMessage::Heartbeat { device_id, connection_type }
            | DeviceMessage::StatusResponse { device_id, connection_type, .. } => {
                let Some(registered) = self.device_id.as_deref() else {
                    debug!(device_id = %device_id, peer = %self.peer, "Liveness signal before device_info ignored");
                    return;
                };
                if registered != device_id {
                    debug!(registered, reported = %device_id, "Liveness signal carries a different device id");
                }
                shared.registry.touch_session(registered, self.session, now, connection_type);
            }

            DeviceMessage::CameraFrame { frame_data } => {
                match shared.viewers.broadcast_frame(frame_data) {
                    Ok(report) => {
                        metrics::counter!("broker.frames.broadcast").increment(1);
                        if report.dropped > 0 {
                            metrics::counter!("broker.frames.dropped").increment(report.dropped as u64);
                        }
                        if report.removed > 0 {
                            metrics::gauge!("broker.viewers.active").set(shared.viewers.len() as f64);
                        }
                    }
                    Err(e) => warn!(peer = %self.peer, error = %e, "Failed to encode viewer frame"),
                }
            }

            DeviceMessage::StatusRequest => {
                let reply = ServerMessage::from(shared.status());
                if self.outbound.try_send(reply).is_err() {
                    warn!(peer = %self.peer, session = %self.session, "Outbound queue full, status reply dropped");
                }
            }
        }
    }

    fn malformed(&self, error: &DecodeError) {
        metrics::counter!("broker.messages.malformed").increment(1);
        warn!(
            peer      = %self.peer,
            device_id = self.device_id.as_deref().unwrap_or("-"),
            error     = %error,
            "Malformed device message ignored"
        );
    }

    fn deregister(&mut self, shared: &Shared) {
        match self.device_id.take() {
            Some(id) if shared.registry.remove_session(&id, self.session) => {
                info!(device_id = %id, session = %self.session, "Device disconnected");
                metrics::gauge!("broker.devices.active").set(shared.registry.len() as f64);
            }
            Some(id) => debug!(device_id = %id, session = %self.session, "Superseded device connection closed"),
            None => debug!(peer = %self.peer, "Unregistered device connection closed"),
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Viewer connections
// ──────────────────────────────────────────────────────────────────────────────

async fn handle_viewer_connection(
    stream:   TcpStream,
    peer:     SocketAddr,
    shared:   Arc<Shared>,
    shutdown: CancellationToken,
) -> Result<()> {
    let Some(ws) = upgrade(stream, "viewer", &shutdown).await? else {
        return Ok(());
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (viewer, mut frames) = shared.viewers.add();
    metrics::gauge!("broker.viewers.active").set(shared.viewers.len() as f64);
    info!(peer = %peer, viewer = %viewer, "Viewer connected");

    // Viewer queue → socket. A write that misses the deadline ends the viewer.
    let send_timeout = shared.viewer_send_timeout;
    let mut pump = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match tokio::time::timeout(send_timeout, ws_tx.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(viewer = %viewer, error = %e, "Viewer send failed");
                    break;
                }
                Err(_) => {
                    warn!(viewer = %viewer, timeout_ms = send_timeout.as_millis() as u64, "Viewer send timed out, closing");
                    break;
                }
            }
        }
    });

    // Viewers have nothing to say; read only to notice the close.
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = &mut pump => break,
            next = ws_rx.next() => match next {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(viewer = %viewer, error = %e, "Viewer websocket error");
                    break;
                }
            },
        }
    }

    shared.viewers.remove(viewer);
    pump.abort();
    metrics::gauge!("broker.viewers.active").set(shared.viewers.len() as f64);
    info!(peer = %peer, viewer = %viewer, "Viewer disconnected");
    Ok(())
}
