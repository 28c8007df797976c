//! In-process event bus.
//!
//! Commands and the background sync loop publish named events with a JSON
//! payload. Front ends (the CLI `watch` loop, tests, an embedding shell)
//! subscribe through a `tokio::sync::broadcast` receiver.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_BUFFER: usize = 256;

/// A published event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppEvent {
    pub name: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, name: &str, payload: Value) {
        let event = AppEvent {
            name: name.to_string(),
            payload,
            at: Utc::now(),
        };
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(event = %name, delivered, "event emitted");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
