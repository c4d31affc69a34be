//! Notification sink the daemon pushes named events through.
//!
//! Delivery is fire-and-forget: core logic never depends on anyone
//! listening. The production sink fans out over a tokio broadcast channel
//! (frontends subscribe, a logger task drains what nobody consumed).

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, name: &str, payload: Value);
}

/// Fans events out to all subscribers. Send errors (no receivers) are
/// ignored by design of the broadcast channel contract.
pub struct BroadcastSink {
    tx: broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<Event>) {
        let (tx, rx) = broadcast::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, name: &str, payload: Value) {
        let _ = self.tx.send(Event {
            name: name.to_string(),
            payload,
        });
    }
}

/// Captures everything emitted, for assertions in tests.
#[derive(Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut self.events.lock().expect("sink lock poisoned"))
    }

    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("sink lock poisoned")
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, name: &str, payload: Value) {
        self.events.lock().expect("sink lock poisoned").push(Event {
            name: name.to_string(),
            payload,
        });
    }
}
