//! Events published to the presentation layer.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::transfer_state::{SessionReport, SessionStatus, TransferKind};

/// Default capacity of the event bus. Slow subscribers lag rather than block.
pub const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateChanged {
    pub session_id: String,
    pub kind: TransferKind,
    pub status: SessionStatus,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub completed_count: usize,
    pub total_count: usize,
    pub current_item_name: Option<String>,
    pub speed: f64,
}

/// A conflict waiting for an interactive decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictPrompt {
    pub session_id: String,
    pub target_path: String,
    pub name: String,
    pub is_directory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "type")]
pub enum TransferEvent {
    SessionStateChanged(SessionStateChanged),
    ConflictRequested(ConflictPrompt),
    SessionFinished(SessionReport),
    HistoryChanged,
}

/// Broadcast channel shared by every component that reports to the UI.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TransferEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: TransferEvent) {
        // No subscribers is not an error; the UI may not be attached yet.
        if self.tx.send(event).is_err() {
            tracing::trace!("event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}
