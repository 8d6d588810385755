//! Session and item state for transfer sessions.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::conflict::{ConflictAction, ConflictPolicy};
use crate::errors::{TransferError, TransferResult};
use crate::events::SessionStateChanged;

/// Shared, lock-protected session. The lock is never held across an await.
pub type SessionHandle = Arc<RwLock<TransferSession>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Upload,
    Download,
}

impl TransferKind {
    /// Item status used while this kind of transfer is in flight.
    pub fn in_flight_status(self) -> ItemStatus {
        match self {
            TransferKind::Upload => ItemStatus::Uploading,
            TransferKind::Download => ItemStatus::Downloading,
        }
    }

    /// Session status used while items are being processed.
    pub fn active_status(self) -> SessionStatus {
        match self {
            TransferKind::Upload => SessionStatus::Uploading,
            TransferKind::Download => SessionStatus::Downloading,
        }
    }

    /// Only downloads support pause/resume.
    pub fn can_pause(self) -> bool {
        self == TransferKind::Download
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Uploading,
    Downloading,
    Completed,
    Skipped,
    Failed,
    /// Interrupted by session cancellation or connection loss.
    Aborted,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Skipped | ItemStatus::Failed | ItemStatus::Aborted
        )
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, ItemStatus::Uploading | ItemStatus::Downloading)
    }

    /// States that count toward the session's `completed_count`.
    pub fn counts_as_done(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Skipped | ItemStatus::Failed)
    }

    /// States whose full size counts toward `transferred_bytes`.
    pub fn counts_bytes(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Skipped)
    }

    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        match self {
            ItemStatus::Pending => next != ItemStatus::Pending,
            ItemStatus::Uploading | ItemStatus::Downloading => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferItem {
    pub id: String,
    pub name: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub size: u64,
    pub is_directory: bool,
    pub status: ItemStatus,
    pub uploaded_bytes: u64,
    pub error: Option<String>,
    /// Index into the session's folder roots this item was expanded from.
    pub root: Option<usize>,
    /// A folder-level overwrite already covers this item.
    #[serde(default)]
    pub overwrite_approved: bool,
    /// Remote directory input not yet expanded into its contents.
    #[serde(default)]
    pub needs_expansion: bool,
}

impl TransferItem {
    fn with(
        name: String,
        local_path: PathBuf,
        remote_path: String,
        size: u64,
        is_directory: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            local_path,
            remote_path,
            size,
            is_directory,
            status: ItemStatus::Pending,
            uploaded_bytes: 0,
            error: None,
            root: None,
            overwrite_approved: false,
            needs_expansion: false,
        }
    }

    pub fn file(
        name: impl Into<String>,
        local_path: PathBuf,
        remote_path: impl Into<String>,
        size: u64,
    ) -> Self {
        Self::with(name.into(), local_path, remote_path.into(), size, false)
    }

    pub fn directory(
        name: impl Into<String>,
        local_path: PathBuf,
        remote_path: impl Into<String>,
    ) -> Self {
        Self::with(name.into(), local_path, remote_path.into(), 0, true)
    }

    /// An entry that could not be read during enumeration. It stays pending
    /// with its error recorded and fails once the session reaches it.
    pub fn unreadable(
        name: impl Into<String>,
        local_path: PathBuf,
        remote_path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut item = Self::with(name.into(), local_path, remote_path.into(), 0, false);
        item.error = Some(message.into());
        item
    }

    /// The enumeration error of a pending unreadable entry.
    pub fn enumeration_error(&self) -> Option<&str> {
        match self.status {
            ItemStatus::Pending => self.error.as_deref(),
            _ => None,
        }
    }

    pub fn in_root(mut self, root: usize) -> Self {
        self.root = Some(root);
        self
    }

    /// Path written by the transfer: remote for uploads, local for downloads.
    pub fn target(&self, kind: TransferKind) -> String {
        match kind {
            TransferKind::Upload => self.remote_path.clone(),
            TransferKind::Download => self.local_path.to_string_lossy().into_owned(),
        }
    }

    /// Moves the item forward. Backward or repeated transitions are refused.
    pub fn transition(&mut self, next: ItemStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Records a byte counter from the backend.
    ///
    /// Returns `false` when the notification is stale (lower than what is
    /// already recorded) or the item is not in flight.
    pub fn record_progress(&mut self, bytes: u64) -> bool {
        if !self.status.is_in_flight() || bytes < self.uploaded_bytes {
            return false;
        }
        self.uploaded_bytes = bytes.min(self.size);
        true
    }
}

/// A directory the user selected, expanded into the session's items.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderRoot {
    pub name: String,
    pub local_path: PathBuf,
    pub remote_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Queued,
    Starting,
    Uploading,
    Downloading,
    Paused,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match self {
            Queued => matches!(next, Starting | Failed | Cancelled),
            Starting => matches!(next, Uploading | Downloading | Cancelling | Failed | Cancelled),
            Uploading => matches!(next, Cancelling | Completed | Failed | Cancelled),
            Downloading => matches!(next, Paused | Cancelling | Completed | Failed | Cancelled),
            Paused => matches!(next, Downloading | Cancelling | Failed | Cancelled),
            // A cancellation observed while the last item was finishing leaves nothing to cancel.
            Cancelling => matches!(next, Cancelled | Failed | Completed),
            Completed | Failed | Cancelled => false,
        }
    }
}

/// Informational reference to the site a session talks to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRef {
    pub name: String,
    pub host: String,
}

/// A failed item, as reported to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub name: String,
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSession {
    pub id: String,
    pub kind: TransferKind,
    pub items: Vec<TransferItem>,
    pub roots: Vec<FolderRoot>,
    pub current_item_index: Option<usize>,
    pub active_item_id: Option<String>,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub completed_count: usize,
    pub total_count: usize,
    pub speed: f64,
    pub conflict_policy: ConflictPolicy,
    pub cancel_requested: bool,
    pub status: SessionStatus,
    pub site: SiteRef,
    /// Upload: unused. Download: destination folder.
    pub local_base: PathBuf,
    /// Upload: destination folder. Download: unused.
    pub remote_base: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Conflict action cached by an "apply to all" answer.
    pub apply_to_all: Option<ConflictAction>,
    #[serde(skip)]
    known_paths: HashSet<String>,
}

impl TransferSession {
    pub fn new(
        kind: TransferKind,
        site: SiteRef,
        conflict_policy: ConflictPolicy,
        local_base: PathBuf,
        remote_base: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            items: Vec::new(),
            roots: Vec::new(),
            current_item_index: None,
            active_item_id: None,
            total_bytes: 0,
            transferred_bytes: 0,
            completed_count: 0,
            total_count: 0,
            speed: 0.0,
            conflict_policy,
            cancel_requested: false,
            status: SessionStatus::Queued,
            site,
            local_base,
            remote_base: remote_base.into(),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            apply_to_all: None,
            known_paths: HashSet::new(),
        }
    }

    pub fn into_handle(self) -> SessionHandle {
        Arc::new(RwLock::new(self))
    }

    pub fn add_root(&mut self, root: FolderRoot) -> usize {
        self.roots.push(root);
        self.roots.len() - 1
    }

    pub fn push_item(&mut self, item: TransferItem) {
        if !item.is_directory {
            self.total_bytes += item.size;
        }
        self.total_count += 1;
        if item.status.counts_as_done() {
            self.completed_count += 1;
        }
        self.known_paths.insert(item.target(self.kind));
        self.items.push(item);
        self.recompute_transferred();
    }

    /// Replaces one item with the entries it expanded into.
    ///
    /// Only valid before any item has started; totals are rebuilt.
    pub fn splice_item(&mut self, index: usize, replacement: Vec<TransferItem>) {
        if index >= self.items.len() {
            return;
        }
        self.items.splice(index..=index, replacement);
        self.rebuild_totals();
    }

    fn rebuild_totals(&mut self) {
        self.total_bytes = self
            .items
            .iter()
            .filter(|item| !item.is_directory)
            .map(|item| item.size)
            .sum();
        self.total_count = self.items.len();
        self.completed_count = self
            .items
            .iter()
            .filter(|item| item.status.counts_as_done())
            .count();
        let kind = self.kind;
        let targets: Vec<String> = self.items.iter().map(|item| item.target(kind)).collect();
        self.known_paths.extend(targets);
        self.recompute_transferred();
    }

    /// `Σ size(completed|skipped) + uploaded(in-flight item)`.
    pub fn recompute_transferred(&mut self) {
        self.transferred_bytes = self
            .items
            .iter()
            .map(|item| {
                if item.status.counts_bytes() {
                    item.size
                } else if item.status.is_in_flight() {
                    item.uploaded_bytes
                } else {
                    0
                }
            })
            .sum();
    }

    pub fn set_status(&mut self, next: SessionStatus) -> TransferResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(TransferError::InvalidState(format!(
                "session {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        if next == SessionStatus::Uploading && self.kind != TransferKind::Upload
            || next == SessionStatus::Downloading && self.kind != TransferKind::Download
        {
            return Err(TransferError::InvalidState(format!(
                "{:?} is not a valid status for a {:?} session",
                next, self.kind
            )));
        }
        if next == SessionStatus::Paused && !self.kind.can_pause() {
            return Err(TransferError::InvalidState("upload sessions cannot be paused".into()));
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Moves the session to a terminal state and drops per-session caches.
    pub fn finish(&mut self, status: SessionStatus, error: Option<String>) -> TransferResult<()> {
        self.set_status(status)?;
        self.error = error;
        self.apply_to_all = None;
        self.current_item_index = None;
        self.active_item_id = None;
        self.speed = 0.0;
        self.recompute_transferred();
        Ok(())
    }

    /// Latches the cancel flag. Returns `true` the first time.
    pub fn request_cancel(&mut self) -> bool {
        let first = !self.cancel_requested;
        self.cancel_requested = true;
        first
    }

    pub fn item_index(&self, item_id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == item_id)
    }

    pub fn current_item(&self) -> Option<&TransferItem> {
        self.current_item_index.and_then(|index| self.items.get(index))
    }

    /// Items that did not reach a counted terminal state (pending, in flight or aborted).
    pub fn has_unfinished_items(&self) -> bool {
        self.items.iter().any(|item| !item.status.counts_as_done())
    }

    /// Whether `path` is already a source or destination of this session.
    pub fn is_known_path(&self, path: &str) -> bool {
        self.known_paths.contains(path)
    }

    pub fn claim_path(&mut self, path: impl Into<String>) {
        self.known_paths.insert(path.into());
    }

    pub fn is_folder(&self) -> bool {
        !self.roots.is_empty()
    }

    /// Short label for history and notifications.
    pub fn display_name(&self) -> String {
        let mut names = self
            .roots
            .iter()
            .map(|root| root.name.clone())
            .chain(
                self.items
                    .iter()
                    .filter(|item| item.root.is_none())
                    .map(|item| item.name.clone()),
            );
        let first = names.next().unwrap_or_default();
        let others = names.count();
        if others == 0 {
            first
        } else {
            format!("{} (+{} more)", first, others)
        }
    }

    pub fn failures(&self) -> Vec<ItemFailure> {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Failed)
            .map(|item| ItemFailure {
                name: item.name.clone(),
                path: item.target(self.kind),
                reason: item.error.clone().unwrap_or_else(|| "unknown error".into()),
            })
            .collect()
    }

    pub fn state_event(&self) -> SessionStateChanged {
        SessionStateChanged {
            session_id: self.id.clone(),
            kind: self.kind,
            status: self.status,
            transferred_bytes: self.transferred_bytes,
            total_bytes: self.total_bytes,
            completed_count: self.completed_count,
            total_count: self.total_count,
            current_item_name: self.current_item().map(|item| item.name.clone()),
            speed: self.speed,
        }
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            id: self.id.clone(),
            kind: self.kind,
            status: self.status,
            site: self.site.clone(),
            total_bytes: self.total_bytes,
            transferred_bytes: self.transferred_bytes,
            completed_count: self.completed_count,
            total_count: self.total_count,
            error: self.error.clone(),
            failures: self.failures(),
            items: self.items.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

/// Final account of a session, handed out once it reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub id: String,
    pub kind: TransferKind,
    pub status: SessionStatus,
    pub site: SiteRef,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub completed_count: usize,
    pub total_count: usize,
    pub error: Option<String>,
    pub failures: Vec<ItemFailure>,
    pub items: Vec<TransferItem>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionReport {
    pub fn items_with_status(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|item| item.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_session() -> TransferSession {
        TransferSession::new(
            TransferKind::Upload,
            SiteRef::default(),
            ConflictPolicy::Prompt,
            PathBuf::new(),
            "/www",
        )
    }

    #[test]
    fn item_status_only_moves_forward() {
        let mut item = TransferItem::file("a.txt", PathBuf::from("/tmp/a.txt"), "/www/a.txt", 10);
        assert!(item.transition(ItemStatus::Uploading));
        assert!(!item.transition(ItemStatus::Pending));
        assert!(item.transition(ItemStatus::Completed));
        assert!(!item.transition(ItemStatus::Failed));
        assert_eq!(item.status, ItemStatus::Completed);
    }

    #[test]
    fn progress_is_monotonic_and_clamped() {
        let mut item = TransferItem::file("a.txt", PathBuf::from("/tmp/a.txt"), "/www/a.txt", 100);
        assert!(!item.record_progress(10), "pending items ignore progress");
        item.transition(ItemStatus::Uploading);
        assert!(item.record_progress(40));
        assert!(!item.record_progress(30));
        assert_eq!(item.uploaded_bytes, 40);
        assert!(item.record_progress(500));
        assert_eq!(item.uploaded_bytes, 100);
    }

    #[test]
    fn totals_exclude_directories() {
        let mut session = upload_session();
        session.push_item(TransferItem::file("a", PathBuf::from("/a"), "/www/a", 5));
        session.push_item(TransferItem::directory("empty", PathBuf::from("/e"), "/www/e"));
        session.push_item(TransferItem::file("b", PathBuf::from("/b"), "/www/b", 7));
        assert_eq!(session.total_bytes, 12);
        assert_eq!(session.total_count, 3);
        assert!(session.is_known_path("/www/b"));
    }

    #[test]
    fn unreadable_entries_wait_for_their_turn() {
        let mut session = upload_session();
        session.push_item(TransferItem::unreadable("x", PathBuf::from("/x"), "/www/x", "denied"));
        assert_eq!(session.completed_count, 0);
        assert!(session.failures().is_empty());
        assert_eq!(session.items[0].enumeration_error(), Some("denied"));

        session.items[0].transition(ItemStatus::Failed);
        assert_eq!(session.items[0].enumeration_error(), None);
        assert_eq!(session.failures()[0].reason, "denied");
    }

    #[test]
    fn uploads_cannot_pause() {
        let mut session = upload_session();
        session.set_status(SessionStatus::Starting).unwrap();
        session.set_status(SessionStatus::Uploading).unwrap();
        assert!(session.set_status(SessionStatus::Paused).is_err());
        assert!(session.set_status(SessionStatus::Downloading).is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut session = upload_session();
        session.set_status(SessionStatus::Cancelled).unwrap();
        assert!(session.ended_at.is_some());
        assert!(session.set_status(SessionStatus::Starting).is_err());
    }

    #[test]
    fn cancel_flag_latches() {
        let mut session = upload_session();
        assert!(session.request_cancel());
        assert!(!session.request_cancel());
        assert!(session.cancel_requested);
    }

    #[test]
    fn finish_clears_apply_to_all() {
        let mut session = upload_session();
        session.apply_to_all = Some(ConflictAction::Skip);
        session.set_status(SessionStatus::Starting).unwrap();
        session.set_status(SessionStatus::Uploading).unwrap();
        session.finish(SessionStatus::Completed, None).unwrap();
        assert!(session.apply_to_all.is_none());
    }

    #[test]
    fn splice_rebuilds_totals() {
        let mut session = TransferSession::new(
            TransferKind::Download,
            SiteRef::default(),
            ConflictPolicy::Skip,
            PathBuf::from("/dl"),
            "",
        );
        let mut placeholder = TransferItem::directory("docs", PathBuf::from("/dl/docs"), "/docs");
        placeholder.needs_expansion = true;
        session.push_item(placeholder);
        session.splice_item(
            0,
            vec![
                TransferItem::file("a", PathBuf::from("/dl/docs/a"), "/docs/a", 3),
                TransferItem::file("b", PathBuf::from("/dl/docs/b"), "/docs/b", 4),
            ],
        );
        assert_eq!(session.total_count, 2);
        assert_eq!(session.total_bytes, 7);
    }

    #[test]
    fn display_name_summarizes_multiple_inputs() {
        let mut session = upload_session();
        session.push_item(TransferItem::file("a.txt", PathBuf::from("/a.txt"), "/www/a.txt", 1));
        session.push_item(TransferItem::file("b.txt", PathBuf::from("/b.txt"), "/www/b.txt", 1));
        session.push_item(TransferItem::file("c.txt", PathBuf::from("/c.txt"), "/www/c.txt", 1));
        assert_eq!(session.display_name(), "a.txt (+2 more)");
    }
}
