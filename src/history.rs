//! Persisted transfer history and crash recovery.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::errors::{TransferError, TransferResult};
use crate::persistence::Persistence;
use crate::transfer_state::{SessionStatus, TransferKind, TransferSession};

pub const INTERRUPTED_MESSAGE: &str =
    "Interrupted: the application exited before the transfer finished";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl HistoryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HistoryStatus::Completed | HistoryStatus::Failed | HistoryStatus::Cancelled
        )
    }
}

impl From<SessionStatus> for HistoryStatus {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Queued => HistoryStatus::Queued,
            SessionStatus::Starting
            | SessionStatus::Uploading
            | SessionStatus::Downloading
            | SessionStatus::Cancelling => HistoryStatus::Active,
            SessionStatus::Paused => HistoryStatus::Paused,
            SessionStatus::Completed => HistoryStatus::Completed,
            SessionStatus::Failed => HistoryStatus::Failed,
            SessionStatus::Cancelled => HistoryStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    pub kind: TransferKind,
    pub file_name: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub total_size: u64,
    pub transferred_size: u64,
    pub status: HistoryStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_folder: bool,
    pub total_files: usize,
    pub completed_files: usize,
    pub error: Option<String>,
}

impl HistoryRecord {
    pub fn from_session(session: &TransferSession) -> Self {
        let (local_path, remote_path) = match (session.roots.first(), session.items.first()) {
            (Some(root), _) => (root.local_path.clone(), root.remote_path.clone()),
            (None, Some(item)) => (item.local_path.clone(), item.remote_path.clone()),
            (None, None) => (session.local_base.clone(), session.remote_base.clone()),
        };
        Self {
            id: session.id.clone(),
            kind: session.kind,
            file_name: session.display_name(),
            remote_path,
            local_path,
            total_size: session.total_bytes,
            transferred_size: session.transferred_bytes,
            status: session.status.into(),
            started_at: session.started_at,
            updated_at: Utc::now(),
            completed_at: session.ended_at,
            is_folder: session.is_folder(),
            total_files: session.total_count,
            completed_files: session.completed_count,
            error: session.error.clone(),
        }
    }

    /// Rewrites a record whose session died with the process.
    ///
    /// Returns `true` if the record was changed.
    pub fn recover_interrupted(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        self.status = HistoryStatus::Failed;
        self.transferred_size = 0;
        self.error = Some(INTERRUPTED_MESSAGE.to_string());
        self.updated_at = now;
        self.completed_at = Some(now);
        true
    }
}

/// In-memory view of the history, written through to a [`Persistence`].
pub struct HistoryManager {
    store: Arc<dyn Persistence>,
    records: RwLock<Vec<HistoryRecord>>,
    max_entries: RwLock<usize>,
}

impl HistoryManager {
    /// Loads history, recovering interrupted records before anything else can
    /// observe them.
    pub fn load(store: Arc<dyn Persistence>, max_entries: usize) -> TransferResult<Self> {
        let mut records = match store.load_history() {
            Ok(records) => records,
            Err(TransferError::Serialization(e)) => {
                tracing::warn!(error = %e, "history file is corrupt, starting empty");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let mut recovered = 0usize;
        for record in records.iter_mut() {
            if record.recover_interrupted() {
                recovered += 1;
            }
        }

        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let capped = records.len() > max_entries;
        records.truncate(max_entries);

        if recovered > 0 || capped {
            tracing::info!(recovered, "recovered interrupted transfers");
            store.save_history(&records)?;
        }

        Ok(Self {
            store,
            records: RwLock::new(records),
            max_entries: RwLock::new(max_entries),
        })
    }

    /// Inserts or updates a record and persists the history.
    pub fn upsert(&self, record: HistoryRecord) -> TransferResult<()> {
        let snapshot = {
            let mut records = self.records.write();
            match records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record,
                None => records.insert(0, record),
            }
            let max = *self.max_entries.read();
            records.truncate(max);
            records.clone()
        };
        self.store.save_history(&snapshot)
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<HistoryRecord> {
        self.records.read().iter().find(|r| r.id == id).cloned()
    }

    pub fn remove(&self, id: &str) -> TransferResult<bool> {
        let snapshot = {
            let mut records = self.records.write();
            let before = records.len();
            records.retain(|r| r.id != id);
            if records.len() == before {
                return Ok(false);
            }
            records.clone()
        };
        self.store.save_history(&snapshot)?;
        Ok(true)
    }

    /// Drops every terminal record. Returns how many were removed.
    pub fn clear_finished(&self) -> TransferResult<usize> {
        let (removed, snapshot) = {
            let mut records = self.records.write();
            let before = records.len();
            records.retain(|r| !r.status.is_terminal());
            (before - records.len(), records.clone())
        };
        if removed > 0 {
            self.store.save_history(&snapshot)?;
        }
        Ok(removed)
    }

    pub fn set_max_entries(&self, max_entries: usize) {
        *self.max_entries.write() = max_entries;
    }
}
