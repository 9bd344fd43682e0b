//! Device control WebSocket.
//!
//! Flow:
//! 1. Device connects to `/ws/device/{frp_port}` (optionally `?force=true`)
//! 2. Device sends `device_online` with its specs
//! 3. Server binds the port, registers the device, replies `registered`
//! 4. Heartbeats (`ping`/`pong`) and informational traffic follow; the
//!    server pings every 30 s and each ping carries a 10 s pong deadline —
//!    a miss drops `ws_up` until traffic resumes
//!
//! On disconnect the device is soft-deleted: marked offline, its port
//! returned to the allocator, and (phones) the ADB attachment dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;

use fg_devices::adb::AdbChannel;
use fg_devices::channel::DeviceChannel;
use fg_devices::registry::{device_id_for_port, DeviceUpdate};
use fg_protocol::{DeviceKind, WsMessage};

use crate::events::Event;
use crate::state::AppState;

/// Outbound sinks of the connected device sockets.
#[derive(Default)]
pub struct DeviceSockets {
    sinks: Mutex<HashMap<String, mpsc::Sender<WsMessage>>>,
}

impl DeviceSockets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.sinks.lock().contains_key(device_id)
    }

    /// Send a message to one device. Returns false if it is not connected.
    pub async fn send(&self, device_id: &str, message: WsMessage) -> bool {
        let sink = self.sinks.lock().get(device_id).cloned();
        match sink {
            Some(sink) => sink.send(message).await.is_ok(),
            None => false,
        }
    }

    fn insert(&self, device_id: &str, sink: mpsc::Sender<WsMessage>) {
        self.sinks.lock().insert(device_id.to_owned(), sink);
    }

    /// Remove only if `sink` is still the registered one (a forced
    /// replacement may already have taken the slot).
    fn remove_if_current(&self, device_id: &str, sink: &mpsc::Sender<WsMessage>) -> bool {
        let mut sinks = self.sinks.lock();
        if sinks
            .get(device_id)
            .is_some_and(|current| current.same_channel(sink))
        {
            sinks.remove(device_id);
            return true;
        }
        false
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Evict a prior holder of the same port (logged as an eviction).
    #[serde(default)]
    pub force: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// GET /ws/device/:frp_port — upgrade to WebSocket.
pub async fn device_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(frp_port): Path<u16>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, frp_port, query.force))
}

async fn handle_socket(socket: WebSocket, state: AppState, frp_port: u16, force: bool) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // 1. Wait for device_online (10 s deadline).
    let Some(mut specs) = wait_for_online(&mut ws_stream).await else {
        tracing::warn!(frp_port, "device disconnected before device_online");
        return;
    };
    // The path port is authoritative.
    specs.frp_port = frp_port;
    let device_id = device_id_for_port(frp_port);

    // 2. Resolve port/connection conflicts.
    if state.sockets.is_connected(&device_id) && !force {
        tracing::warn!(
            device_id = %device_id,
            frp_port,
            "port already claimed by a live connection; rejecting (retry with force)"
        );
        let _ = ws_sink.close().await;
        return;
    }
    let (ok, message) = state
        .allocator
        .allocate(&device_id, frp_port, &specs.device_name, force);
    if !ok {
        tracing::warn!(device_id = %device_id, frp_port, %message, "port binding rejected");
        let _ = ws_sink.close().await;
        return;
    }
    if force && state.sockets.is_connected(&device_id) {
        // Evict the prior incarnation: drop its ADB attachment so the new
        // tunnel client owns the channel.
        tracing::warn!(device_id = %device_id, "evicting previous connection (force)");
        if specs.device_type == DeviceKind::Phone {
            let _ = AdbChannel::new(frp_port).disconnect().await;
        }
    }

    // 3. Register and acknowledge. First-time registrations inherit the
    //    counters a previous server run persisted for this identity.
    let device = state.registry.register(&specs);
    if device.total_tasks == 0 {
        if let Some((total, success, failed)) = state.store.device_counters(&device_id) {
            state.registry.restore_counters(&device_id, total, success, failed);
        }
    }
    state.store.upsert_device(&device);
    let welcome = WsMessage::Registered {
        device_id: device_id.clone(),
        frp_port,
        message: format!("registered as {device_id}"),
        timestamp: Utc::now(),
    };
    if send_ws_message(&mut ws_sink, &welcome).await.is_err() {
        tracing::warn!(device_id = %device_id, "failed to send registered reply");
        return;
    }
    tracing::info!(
        device_id = %device_id,
        kind = %specs.device_type,
        name = %specs.device_name,
        "device connected"
    );

    // 4. Outbound channel: writer task drains it into the socket.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(64);
    state.sockets.insert(&device_id, outbound_tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if send_ws_message(&mut ws_sink, &message).await.is_err() {
                break;
            }
        }
    });

    // 5. Heartbeat pings every interval, each with a pong deadline. A
    //    missed deadline drops `ws_up`; any later inbound traffic restores
    //    it (see `handle_inbound`).
    let ping_tx = outbound_tx.clone();
    let ping_state = state.clone();
    let ping_device = device_id.clone();
    let ping_interval = Duration::from_secs(state.config.tasks.heartbeat_interval_secs);
    let pong_deadline = Duration::from_secs(state.config.tasks.heartbeat_timeout_secs.max(1));
    let pinger = tokio::spawn(async move {
        loop {
            tokio::time::sleep(ping_interval).await;
            let ping_sent = Utc::now();
            if ping_tx.send(WsMessage::Ping).await.is_err() {
                break;
            }
            tokio::time::sleep(pong_deadline).await;
            let last_heartbeat = ping_state
                .registry
                .get(&ping_device)
                .and_then(|d| d.last_heartbeat);
            if pong_deadline_missed(last_heartbeat, ping_sent) {
                tracing::warn!(
                    device_id = %ping_device,
                    deadline_secs = pong_deadline.as_secs(),
                    "pong deadline missed, marking ws down"
                );
                ping_state.registry.update(
                    &ping_device,
                    DeviceUpdate {
                        ws_up: Some(false),
                        ..Default::default()
                    },
                );
            }
        }
    });

    // 6. Forward task lifecycle broadcasts to the device.
    let event_tx = outbound_tx.clone();
    let mut event_rx = state.events.subscribe();
    let forwarder = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            let Event::TaskStatusChange {
                task_id,
                status,
                pending_question,
            } = event;
            let message = WsMessage::TaskStatusChange {
                task_id: task_id.to_string(),
                status,
                pending_question,
            };
            if event_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    // 7. Reader loop.
    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<WsMessage>(&text) {
                Ok(ws_msg) => {
                    handle_inbound(&state, &device_id, ws_msg, &outbound_tx).await;
                }
                Err(_) => {
                    tracing::debug!(device_id = %device_id, "ignoring unparseable message");
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                // Native WS heartbeat.
                mark_alive(&state, &device_id);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // 8. Cleanup: soft-delete unless a forced replacement already owns the
    //    identity.
    pinger.abort();
    forwarder.abort();
    writer.abort();
    let was_current = state.sockets.remove_if_current(&device_id, &outbound_tx);
    if was_current {
        if let Some(freed_port) = state.registry.unregister(&device_id) {
            if specs.device_type == DeviceKind::Phone {
                let _ = AdbChannel::new(freed_port).disconnect().await;
            }
            state.allocator.release_device(&device_id);
        }
        if let Some(device) = state.registry.get(&device_id) {
            state.store.upsert_device(&device);
        }
        tracing::info!(device_id = %device_id, "device disconnected");
    } else {
        tracing::info!(device_id = %device_id, "replaced connection closed");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn wait_for_online(
    stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<fg_protocol::DeviceSpecs> {
    let deadline = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(Ok(message)) = stream.next().await {
            if let Message::Text(text) = message {
                if let Ok(WsMessage::DeviceOnline { specs }) =
                    serde_json::from_str::<WsMessage>(&text)
                {
                    return Some(specs);
                }
            }
        }
        None
    })
    .await;
    deadline.unwrap_or(None)
}

async fn send_ws_message(
    sink: &mut (impl SinkExt<Message> + Unpin),
    message: &WsMessage,
) -> Result<(), ()> {
    let json = serde_json::to_string(message).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

/// Any traffic proves the socket alive: refresh the heartbeat and restore
/// `ws_up` if a missed pong deadline had dropped it.
fn mark_alive(state: &AppState, device_id: &str) {
    state.registry.update(
        device_id,
        DeviceUpdate {
            ws_up: Some(true),
            heartbeat: Some(Utc::now()),
            ..Default::default()
        },
    );
    state.allocator.touch_device(device_id);
}

/// True when no heartbeat has been seen since the ping went out.
fn pong_deadline_missed(
    last_heartbeat: Option<chrono::DateTime<Utc>>,
    ping_sent: chrono::DateTime<Utc>,
) -> bool {
    last_heartbeat.map_or(true, |heartbeat| heartbeat < ping_sent)
}

async fn handle_inbound(
    state: &AppState,
    device_id: &str,
    message: WsMessage,
    outbound: &mpsc::Sender<WsMessage>,
) {
    mark_alive(state, device_id);

    match message {
        WsMessage::Ping => {
            let _ = outbound.send(WsMessage::Pong).await;
        }
        WsMessage::Pong => {
            // Heartbeat acknowledged — touch already done above.
        }
        WsMessage::TaskProgress {
            task_id,
            step,
            message,
        } => {
            tracing::debug!(
                device_id = %device_id,
                task_id = %task_id,
                step,
                message = message.as_deref().unwrap_or(""),
                "task progress from device"
            );
        }
        WsMessage::Log { level, message } => {
            tracing::debug!(device_id = %device_id, level = %level, "{message}");
        }
        other => {
            tracing::debug!(
                device_id = %device_id,
                message = ?std::mem::discriminant(&other),
                "unexpected inbound message"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn pong_deadline_logic() {
        let ping_sent = Utc::now();
        // No heartbeat at all: missed.
        assert!(pong_deadline_missed(None, ping_sent));
        // Heartbeat predates the ping: missed.
        assert!(pong_deadline_missed(
            Some(ping_sent - ChronoDuration::seconds(5)),
            ping_sent
        ));
        // Heartbeat after the ping: the pong arrived in time.
        assert!(!pong_deadline_missed(
            Some(ping_sent + ChronoDuration::seconds(1)),
            ping_sent
        ));
    }
}
