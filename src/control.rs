//! Cooperative cancellation and download pause for a single session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::errors::{TransferError, TransferResult};

/// Where in the per-item loop a cancellation check happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPoint {
    BeforeConflict,
    AfterConflict,
    BeforeTransfer,
    InProgress,
    AfterItem,
}

impl CheckPoint {
    fn describe(self) -> &'static str {
        match self {
            CheckPoint::BeforeConflict => "before conflict resolution",
            CheckPoint::AfterConflict => "after conflict resolution",
            CheckPoint::BeforeTransfer => "before transfer",
            CheckPoint::InProgress => "during transfer",
            CheckPoint::AfterItem => "after item",
        }
    }
}

/// Per-session control flags. Cancellation is monotonic; pause only applies
/// to sessions created with `pausable = true` (downloads).
pub struct TransferControl {
    cancelled: AtomicBool,
    paused: AtomicBool,
    pausable: bool,
    notify: Notify,
}

impl TransferControl {
    pub fn new(pausable: bool) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            pausable,
            notify: Notify::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_pausable(&self) -> bool {
        self.pausable
    }

    /// Sets the cancel flag. Returns `true` if this call set it.
    pub fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        first
    }

    pub fn pause(&self) -> TransferResult<()> {
        if !self.pausable {
            return Err(TransferError::InvalidState("upload sessions cannot be paused".into()));
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Fails with `Cancelled` once the flag is set.
    pub fn checkpoint(&self, at: CheckPoint) -> TransferResult<()> {
        if self.is_cancelled() {
            return Err(TransferError::Cancelled(format!(
                "cancellation observed {}",
                at.describe()
            )));
        }
        Ok(())
    }

    /// Resolves once the session is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Waits while paused. Cancellation ends the wait with an error.
    pub async fn wait_while_paused(&self) -> TransferResult<()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            self.checkpoint(CheckPoint::BeforeTransfer)?;
            if !self.is_paused() {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Blocking variant for backends that report progress from a worker thread.
    pub fn block_while_paused(&self) {
        while self.is_paused() && !self.is_cancelled() {
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}
