//! In-process event bus.
//!
//! Components publish; the API layer's SSE and WebSocket fan-outs subscribe
//! and relay payloads verbatim. Each subscriber has a bounded buffer: a slow
//! consumer loses events for itself only, never for the others.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::Measurement;
use crate::queue::QueueStatus;
use crate::scheduler::ScheduleInfo;

const BUS_CAPACITY: usize = 256;

/// Everything that can be observed live.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Event {
    Result(Measurement),
    Status(String),
    Schedule(Vec<ScheduleInfo>),
    Queue(QueueStatus),
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to all current subscribers. Publishing with no subscribers is
    /// a no-op.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
