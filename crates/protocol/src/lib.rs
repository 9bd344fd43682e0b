//! Device control-channel protocol: the WebSocket message envelope and the
//! device specs exchanged at registration.
//!
//! Remote agents (phone or PC) open `ws://<host>/ws/device/{frp_port}` and
//! send `device_online` as their first message; the server replies with
//! `registered`. Afterwards the channel carries heartbeats and informational
//! traffic only — all actual device control flows through the tunnel port.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of remote device behind a tunnel port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Android phone exposing an ADB server over the tunnel.
    #[serde(rename = "phone", alias = "mobile")]
    Phone,
    /// Desktop exposing a JSON control API over the tunnel.
    #[serde(rename = "pc")]
    Pc,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Phone => f.write_str("phone"),
            Self::Pc => f.write_str("pc"),
        }
    }
}

/// Specs reported by the device in its `device_online` message.
///
/// The WebSocket report is authoritative for these fields; the port scanner
/// only fills gaps for devices that never registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpecs {
    pub device_name: String,
    pub device_type: DeviceKind,
    pub frp_port: u16,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub screen_resolution: Option<String>,
    #[serde(default)]
    pub battery: Option<u8>,
    #[serde(default)]
    pub memory_total: Option<String>,
    #[serde(default)]
    pub storage_total: Option<String>,
}

/// WebSocket message envelope, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Device → Server: initial handshake.
    DeviceOnline { specs: DeviceSpecs },

    /// Server → Device: handshake accepted.
    Registered {
        device_id: String,
        frp_port: u16,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Bidirectional heartbeat.
    Ping,
    Pong,

    /// Device → Server: informational task progress.
    TaskProgress {
        task_id: String,
        #[serde(default)]
        step: Option<u32>,
        #[serde(default)]
        message: Option<String>,
    },

    /// Device → Server: free-form log line.
    Log {
        level: String,
        message: String,
    },

    /// Server → Device: opaque command passthrough from the API.
    Command { payload: serde_json::Value },

    /// Server → Device/observers: a task changed status.
    TaskStatusChange {
        task_id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pending_question: Option<serde_json::Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_online_wire_shape() {
        let raw = r#"{
            "type": "device_online",
            "specs": {
                "device_name": "Pixel-6100",
                "device_type": "phone",
                "frp_port": 6100,
                "model": "Pixel 8",
                "os_version": "14",
                "screen_resolution": "1080x2400",
                "battery": 87
            }
        }"#;
        let msg: WsMessage = serde_json::from_str(raw).unwrap();
        match msg {
            WsMessage::DeviceOnline { specs } => {
                assert_eq!(specs.device_type, DeviceKind::Phone);
                assert_eq!(specs.frp_port, 6100);
                assert_eq!(specs.battery, Some(87));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn mobile_alias_maps_to_phone() {
        let kind: DeviceKind = serde_json::from_str("\"mobile\"").unwrap();
        assert_eq!(kind, DeviceKind::Phone);
    }

    #[test]
    fn ping_pong_are_bare() {
        let ping: WsMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, WsMessage::Ping));
        let encoded = serde_json::to_string(&WsMessage::Pong).unwrap();
        assert_eq!(encoded, r#"{"type":"pong"}"#);
    }

    #[test]
    fn registered_reply_carries_identity() {
        let msg = WsMessage::Registered {
            device_id: "device_6100".into(),
            frp_port: 6100,
            message: "registered".into(),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "registered");
        assert_eq!(value["device_id"], "device_6100");
    }
}
