//! Internal event bus for task lifecycle broadcasts.
//!
//! The scheduler publishes `task_status_change` events; connected device
//! sockets (and any future observer endpoint) subscribe and forward them.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskStatusChange {
        task_id: Uuid,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pending_question: Option<Value>,
    },
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        // Send fails only when nobody is subscribed; that is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
