//! Wire messages shared by the device agent and the session broker.
//!
//! Every message is one JSON object in one WebSocket text frame, tagged by its
//! `type` field. Each direction has a closed enum:
//!
//!   device → broker   `DeviceMessage`
//!   broker → device   `ServerMessage`
//!   broker → viewer   `ViewerMessage`
//!
//! Decoding goes through `decode_*` so that callers get a `DecodeError` that
//! separates "not JSON", "no type", "type we don't speak" and "right type,
//! wrong fields". Nothing downstream touches a loosely-typed `Value`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ──────────────────────────────────────────────────────────────────────────────
// Connection type
// ──────────────────────────────────────────────────────────────────────────────

/// Network path a device reports it is using. Self-reported, diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Ethernet,
    Wifi,
    Cellular,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Ethernet => "ethernet",
            ConnectionType::Wifi     => "wifi",
            ConnectionType::Cellular => "cellular",
            ConnectionType::Unknown  => "unknown",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Device → broker
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// First message on every connection. Registers (or replaces) the session.
    DeviceInfo {
        device_id: String,
        #[serde(default)]
        connection_type: ConnectionType,
    },
    /// Periodic liveness signal.
    Heartbeat {
        device_id: String,
        #[serde(default)]
        connection_type: ConnectionType,
    },
    /// One captured frame. `frame_data` is opaque to the broker (base64 JPEG
    /// from the stock agent) and is relayed to viewers unchanged.
    CameraFrame { frame_data: String },
    /// Ask the broker for the current fleet status.
    StatusRequest,
    /// Answer to a broker `status_request`. Refreshes liveness like a heartbeat.
    StatusResponse {
        device_id: String,
        #[serde(default)]
        connection_type: ConnectionType,
        /// Device wall clock, seconds since UNIX epoch.
        #[serde(default)]
        timestamp: f64,
    },
}

const DEVICE_MESSAGE_TYPES: &[&str] = &[
    "device_info",
    "heartbeat",
    "camera_frame",
    "status_request",
    "status_response",
];

pub fn decode_device_message(text: &str) -> Result<DeviceMessage, DecodeError> {
    decode_tagged(text, DEVICE_MESSAGE_TYPES)
}

// ──────────────────────────────────────────────────────────────────────────────
// Broker → device
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to a device `status_request`.
    Status {
        devices:      BTreeMap<String, DeviceStatus>,
        viewer_count: usize,
    },
    /// Capture and send a frame now, outside the periodic schedule.
    CaptureRequest,
    /// Ask the device to answer with `status_response`.
    StatusRequest,
}

const SERVER_MESSAGE_TYPES: &[&str] = &["status", "capture_request", "status_request"];

pub fn decode_server_message(text: &str) -> Result<ServerMessage, DecodeError> {
    decode_tagged(text, SERVER_MESSAGE_TYPES)
}

// ──────────────────────────────────────────────────────────────────────────────
// Broker → viewer
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerMessage {
    /// Frame payload exactly as the device sent it.
    CameraFrame { data: String },
}

// ──────────────────────────────────────────────────────────────────────────────
// Registry snapshot entry
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connected,
}

/// Point-in-time view of one registered device, as exposed to status readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub connection_type: ConnectionType,
    pub last_seen:       DateTime<Utc>,
    pub status:          SessionStatus,
}

// ──────────────────────────────────────────────────────────────────────────────
// Encoding / decoding
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("message has no string `type` field")]
    MissingType,
    #[error("unrecognized message type `{0}`")]
    UnknownType(String),
    #[error("malformed `{kind}` message: {source}")]
    InvalidFields {
        kind:   String,
        #[source]
        source: serde_json::Error,
    },
    #[error("binary frames are not part of the protocol")]
    Binary,
}

fn decode_tagged<T: DeserializeOwned>(text: &str, known: &[&str]) -> Result<T, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(DecodeError::InvalidJson)?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(DecodeError::MissingType)?
        .to_string();

    if !known.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|source| DecodeError::InvalidFields { kind, source })
}

/// Serialize any protocol message to its JSON text form.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

/// Current wall clock as fractional seconds since UNIX epoch.
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
