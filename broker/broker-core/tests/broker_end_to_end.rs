//! Loopback tests against a real broker: real sockets, real websocket handshakes.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use broker_core::{Broker, BrokerConfig, BrokerHandle};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use wire_protocol::ConnectionType;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STEP: Duration = Duration::from_secs(5);

struct TestBroker {
    device_addr: SocketAddr,
    viewer_addr: SocketAddr,
    handle:      BrokerHandle,
    shutdown:    CancellationToken,
    task:        JoinHandle<Result<()>>,
}

fn loopback_config() -> BrokerConfig {
    BrokerConfig {
        device_listen_addr: "127.0.0.1:0".parse().unwrap(),
        viewer_listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..BrokerConfig::default()
    }
}

async fn start_broker() -> TestBroker {
    start_broker_with(loopback_config()).await
}

async fn start_broker_with(cfg: BrokerConfig) -> TestBroker {
    let broker = Broker::bind(cfg).await.unwrap();
    let device_addr = broker.device_addr().unwrap();
    let viewer_addr = broker.viewer_addr().unwrap();
    let handle = broker.handle();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(broker.run(shutdown.clone()));
    TestBroker { device_addr, viewer_addr, handle, shutdown, task }
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, json: &str) {
    ws.send(Message::text(json)).await.unwrap();
}

/// Next text frame, skipping control frames.
async fn next_text(ws: &mut Ws) -> String {
    loop {
        let msg = tokio::time::timeout(STEP, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return text.as_str().to_string();
        }
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(STEP, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn frame_from_device_reaches_preconnected_viewer_once() {
    let broker = start_broker().await;

    let mut viewer = connect(broker.viewer_addr).await;
    wait_until(|| broker.handle.status().viewer_count == 1).await;

    let mut device = connect(broker.device_addr).await;
    send(&mut device, r#"{"type":"device_info","device_id":"D1","connection_type":"wifi"}"#).await;
    send(&mut device, r#"{"type":"camera_frame","frame_data":"AAAA"}"#).await;

    let frame: serde_json::Value = serde_json::from_str(&next_text(&mut viewer).await).unwrap();
    assert_eq!(frame, serde_json::json!({"type": "camera_frame", "data": "AAAA"}));

    let extra = tokio::time::timeout(Duration::from_millis(200), viewer.next()).await;
    assert!(extra.is_err(), "viewer received more than one frame");

    let status = broker.handle.status();
    let d1 = &status.devices["D1"];
    assert_eq!(d1.connection_type, ConnectionType::Wifi);
    assert!(chrono::Utc::now() - d1.last_seen < chrono::Duration::seconds(5));

    broker.shutdown.cancel();
}

#[tokio::test]
async fn malformed_message_keeps_device_connection_open() {
    let broker = start_broker().await;
    let mut device = connect(broker.device_addr).await;

    send(&mut device, r#"{"type":"device_info","device_id":"D7","connection_type":"ethernet"}"#).await;
    send(&mut device, "{{{ not json").await;
    device.send(Message::binary(vec![0u8, 1, 2])).await.unwrap();
    send(&mut device, r#"{"type":"warp_drive"}"#).await;
    send(&mut device, r#"{"type":"status_request"}"#).await;

    let reply: serde_json::Value = serde_json::from_str(&next_text(&mut device).await).unwrap();
    assert_eq!(reply["type"], "status");
    assert_eq!(reply["viewer_count"], 0);
    assert_eq!(reply["devices"]["D7"]["connection_type"], "ethernet");
    assert_eq!(reply["devices"]["D7"]["status"], "connected");

    broker.shutdown.cancel();
}

#[tokio::test]
async fn closing_superseded_connection_keeps_replacement() {
    let broker = start_broker().await;
    let info = r#"{"type":"device_info","device_id":"D1","connection_type":"cellular"}"#;

    let mut first = connect(broker.device_addr).await;
    send(&mut first, info).await;
    wait_until(|| broker.handle.status().devices.contains_key("D1")).await;

    let mut second = connect(broker.device_addr).await;
    send(&mut second, info).await;
    send(&mut second, r#"{"type":"status_request"}"#).await;
    next_text(&mut second).await;

    first.close(None).await.unwrap();
    drop(first);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(broker.handle.status().devices.contains_key("D1"));

    second.close(None).await.unwrap();
    drop(second);
    wait_until(|| broker.handle.status().devices.is_empty()).await;

    broker.shutdown.cancel();
}

#[tokio::test]
async fn closed_viewer_does_not_stop_delivery_to_others() {
    let broker = start_broker().await;

    let mut stays = connect(broker.viewer_addr).await;
    let leaves = connect(broker.viewer_addr).await;
    wait_until(|| broker.handle.status().viewer_count == 2).await;

    drop(leaves);
    wait_until(|| broker.handle.status().viewer_count == 1).await;

    let mut device = connect(broker.device_addr).await;
    send(&mut device, r#"{"type":"device_info","device_id":"D2","connection_type":"wifi"}"#).await;
    send(&mut device, r#"{"type":"camera_frame","frame_data":"QkJC"}"#).await;

    let frame: serde_json::Value = serde_json::from_str(&next_text(&mut stays).await).unwrap();
    assert_eq!(frame["data"], "QkJC");

    broker.shutdown.cancel();
}

#[tokio::test]
async fn capture_request_is_routed_to_the_device_socket() {
    let broker = start_broker().await;
    let mut device = connect(broker.device_addr).await;
    send(&mut device, r#"{"type":"device_info","device_id":"cam-3","connection_type":"wifi"}"#).await;
    wait_until(|| broker.handle.status().devices.contains_key("cam-3")).await;

    assert!(broker.handle.request_capture("cam-3"));
    let msg: serde_json::Value = serde_json::from_str(&next_text(&mut device).await).unwrap();
    assert_eq!(msg, serde_json::json!({"type": "capture_request"}));

    assert!(!broker.handle.request_capture("nobody"));
    broker.shutdown.cancel();
}

#[tokio::test]
async fn shutdown_drains_connections_and_deregisters() {
    let broker = start_broker().await;
    let mut device = connect(broker.device_addr).await;
    let _viewer = connect(broker.viewer_addr).await;
    send(&mut device, r#"{"type":"device_info","device_id":"D9","connection_type":"wifi"}"#).await;
    wait_until(|| {
        let s = broker.handle.status();
        s.devices.contains_key("D9") && s.viewer_count == 1
    })
    .await;

    broker.shutdown.cancel();
    tokio::time::timeout(STEP, broker.task).await.unwrap().unwrap().unwrap();

    let status = broker.handle.status();
    assert!(status.devices.is_empty());
    assert_eq!(status.viewer_count, 0);
}

#[tokio::test]
async fn stalled_viewer_is_closed_after_send_timeout() {
    let broker = start_broker_with(BrokerConfig {
        viewer_send_timeout_ms: 200,
        ..loopback_config()
    })
    .await;

    // Never read from: its socket buffers fill and the broker's writes stall.
    let _stalled = connect(broker.viewer_addr).await;
    let mut reading = connect(broker.viewer_addr).await;
    wait_until(|| broker.handle.status().viewer_count == 2).await;

    let mut device = connect(broker.device_addr).await;
    send(&mut device, r#"{"type":"device_info","device_id":"D5","connection_type":"ethernet"}"#).await;

    let frame = format!(r#"{{"type":"camera_frame","frame_data":"{}"}}"#, "A".repeat(1 << 20));
    for _ in 0..200 {
        send(&mut device, &frame).await;
        next_text(&mut reading).await;
        if broker.handle.status().viewer_count == 1 {
            break;
        }
    }
    wait_until(|| broker.handle.status().viewer_count == 1).await;

    send(&mut device, r#"{"type":"camera_frame","frame_data":"TEFTVA=="}"#).await;
    loop {
        let msg: serde_json::Value = serde_json::from_str(&next_text(&mut reading).await).unwrap();
        if msg["data"] == "TEFTVA==" {
            break;
        }
    }

    broker.shutdown.cancel();
}

#[tokio::test]
async fn shutdown_does_not_wait_for_pending_handshake() {
    let broker = start_broker().await;

    // Plain TCP, no websocket upgrade ever sent.
    let _half_open = TcpStream::connect(broker.device_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    broker.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), broker.task)
        .await
        .expect("broker waited on the handshake")
        .unwrap()
        .unwrap();
}
