//! Progress aggregation.
//!
//! Backends report raw byte counters through a [`ProgressSink`]; the
//! aggregator folds them into the owning session, smooths the speed and
//! publishes `SessionStateChanged` events.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::control::TransferControl;
use crate::events::{EventBus, TransferEvent};
use crate::transfer_state::{ItemStatus, SessionHandle};

/// Weight of the newest sample in the exponential speed average.
const SPEED_SMOOTHING: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub session_id: String,
    pub item_id: String,
    pub bytes: u64,
    /// Bytes per second since the previous report for this item.
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub session_id: String,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub completed_count: usize,
    pub total_count: usize,
    pub current_item: Option<String>,
    pub speed: f64,
}

/// Blends a new sample into the running speed. A fresh or just-resumed
/// session starts from zero, so its first sample is damped too.
pub fn smooth_speed(previous: f64, instantaneous: f64) -> f64 {
    SPEED_SMOOTHING * instantaneous + (1.0 - SPEED_SMOOTHING) * previous
}

pub struct ProgressAggregator {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    events: EventBus,
}

impl ProgressAggregator {
    pub fn new(events: EventBus) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn register(&self, session: SessionHandle) {
        let id = session.read().id.clone();
        self.sessions.write().insert(id, session);
    }

    pub fn unregister(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
    }

    /// Applies one backend notification. Stale or out-of-phase updates are
    /// dropped and `false` is returned.
    pub fn on_progress(&self, update: ProgressUpdate) -> bool {
        let Some(session) = self.sessions.read().get(&update.session_id).cloned() else {
            return false;
        };
        let event = {
            let mut s = session.write();
            let Some(index) = s.item_index(&update.item_id) else {
                return false;
            };
            if !s.items[index].record_progress(update.bytes) {
                return false;
            }
            s.speed = smooth_speed(s.speed, update.rate);
            s.recompute_transferred();
            s.state_event()
        };
        self.events.emit(TransferEvent::SessionStateChanged(event));
        true
    }

    /// Marks the item at `index` in flight and makes it the current item.
    pub fn begin_item(&self, session: &SessionHandle, index: usize) -> bool {
        let event = {
            let mut s = session.write();
            let kind = s.kind;
            let Some(item) = s.items.get_mut(index) else {
                return false;
            };
            if !item.transition(kind.in_flight_status()) {
                return false;
            }
            item.uploaded_bytes = 0;
            let item_id = item.id.clone();
            s.current_item_index = Some(index);
            s.active_item_id = Some(item_id);
            s.recompute_transferred();
            s.state_event()
        };
        self.events.emit(TransferEvent::SessionStateChanged(event));
        true
    }

    /// Moves an item to a terminal state. `completed_count` grows only the
    /// first time an item reaches a counted state.
    pub fn finish_item(
        &self,
        session: &SessionHandle,
        item_id: &str,
        status: ItemStatus,
        error: Option<String>,
    ) -> bool {
        let event = {
            let mut s = session.write();
            let Some(index) = s.item_index(item_id) else {
                return false;
            };
            let item = &mut s.items[index];
            if !item.transition(status) {
                return false;
            }
            if status == ItemStatus::Completed {
                item.uploaded_bytes = item.size;
            }
            if error.is_some() {
                item.error = error;
            }
            if status.counts_as_done() {
                s.completed_count += 1;
            }
            if s.active_item_id.as_deref() == Some(item_id) {
                s.active_item_id = None;
            }
            s.recompute_transferred();
            s.state_event()
        };
        self.events.emit(TransferEvent::SessionStateChanged(event));
        true
    }

    /// Emits the session's current state as-is.
    pub fn publish(&self, session: &SessionHandle) {
        let event = session.read().state_event();
        self.events.emit(TransferEvent::SessionStateChanged(event));
    }

    pub fn snapshot(&self, session_id: &str) -> Option<ProgressSnapshot> {
        let session = self.sessions.read().get(session_id).cloned()?;
        let s = session.read();
        Some(ProgressSnapshot {
            session_id: s.id.clone(),
            transferred_bytes: s.transferred_bytes,
            total_bytes: s.total_bytes,
            completed_count: s.completed_count,
            total_count: s.total_count,
            current_item: s.current_item().map(|item| item.name.clone()),
            speed: s.speed,
        })
    }

    /// Consumes backend notifications until every sender is gone.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ProgressUpdate>) {
        while let Some(update) = rx.recv().await {
            if !self.on_progress(update) {
                tracing::trace!("dropped stale progress update");
            }
        }
        tracing::debug!("progress channel closed");
    }
}

struct LastReport {
    at: Instant,
    bytes: u64,
}

/// Handle a backend uses to report progress for one item. It doubles as the
/// in-progress cancellation checkpoint: [`ProgressSink::report`] returns
/// `false` once the session is cancelled.
#[derive(Clone)]
pub struct ProgressSink {
    session_id: Arc<str>,
    item_id: Arc<str>,
    tx: mpsc::UnboundedSender<ProgressUpdate>,
    control: Arc<TransferControl>,
    last: Arc<Mutex<LastReport>>,
}

impl ProgressSink {
    pub fn new(
        session_id: &str,
        item_id: &str,
        tx: mpsc::UnboundedSender<ProgressUpdate>,
        control: Arc<TransferControl>,
    ) -> Self {
        Self {
            session_id: Arc::from(session_id),
            item_id: Arc::from(item_id),
            tx,
            control,
            last: Arc::new(Mutex::new(LastReport {
                at: Instant::now(),
                bytes: 0,
            })),
        }
    }

    /// A sink whose reports go nowhere, for callers outside a session.
    pub fn detached(control: Arc<TransferControl>) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self::new("", "", tx, control)
    }

    pub fn report(&self, bytes: u64) -> bool {
        if self.control.is_cancelled() {
            return false;
        }
        let rate = {
            let mut last = self.last.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(last.at).as_secs_f64();
            let delta = bytes.saturating_sub(last.bytes);
            last.at = now;
            last.bytes = bytes;
            if elapsed > 0.0 {
                delta as f64 / elapsed
            } else {
                0.0
            }
        };
        // A closed channel only means nobody is listening any more.
        let _ = self.tx.send(ProgressUpdate {
            session_id: self.session_id.to_string(),
            item_id: self.item_id.to_string(),
            bytes,
            rate,
        });
        !self.control.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    pub fn control(&self) -> &Arc<TransferControl> {
        &self.control
    }

    /// Parks a worker thread while the session is paused.
    pub fn block_while_paused(&self) {
        if self.control.is_paused() {
            self.control.block_while_paused();
            self.touch();
        }
    }

    /// Time since the last report or pause.
    pub fn idle_for(&self) -> Duration {
        self.last.lock().at.elapsed()
    }

    pub fn touch(&self) {
        self.last.lock().at = Instant::now();
    }
}
