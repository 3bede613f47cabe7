//! Event fan-out to passive subscribers (WebSocket clients, tests).
//!
//! Built on a broadcast channel: delivery is best-effort, lagging or
//! dead receivers never block producers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Ring capacity per subscriber before older events are dropped.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ZoneUpdate {
        zone_id: i64,
        is_active: bool,
    },
    MoistureUpdate {
        zone_id: i64,
        sensor: String,
        moisture: i64,
        timestamp: DateTime<Utc>,
    },
    MqttStatus {
        connected: bool,
    },
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Event>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish to all current subscribers. Having none is normal.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
