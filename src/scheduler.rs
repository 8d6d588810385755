//! Session registry and scheduler.
//!
//! Sessions are admitted FIFO per kind: one upload at a time, downloads up
//! to `maxConcurrentDownloads`. Each admitted session runs on its own task
//! with its own connection and walks its items strictly in order.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

use crate::backend::{BackendFactory, RemoteEntry, SiteConfig};
use crate::conflict::{
    ClaimingProbe, ConflictAction, ConflictPolicy, ConflictResolver, ConflictResponse, Resolution,
    TargetClaims, TargetProbe,
};
use crate::connection::{Connection, ConnectionManager};
use crate::control::{CheckPoint, TransferControl};
use crate::errors::{TransferError, TransferResult};
use crate::events::{EventBus, TransferEvent};
use crate::file_ops::{join_remote, remote_parent};
use crate::history::{HistoryManager, HistoryRecord};
use crate::progress::{ProgressAggregator, ProgressSink, ProgressSnapshot, ProgressUpdate};
use crate::settings::Settings;
use crate::transfer_state::{
    FolderRoot, ItemStatus, SessionHandle, SessionReport, SessionStatus, SiteRef, TransferItem,
    TransferKind, TransferSession,
};
use crate::walker::{walk, walk_remote, WalkOptions, WalkResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    /// Local files and folders, in the order they were selected.
    pub sources: Vec<PathBuf>,
    pub remote_dir: String,
    /// Falls back to the configured default.
    #[serde(default)]
    pub conflict_policy: Option<ConflictPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub sources: Vec<RemoteEntry>,
    pub local_dir: PathBuf,
    #[serde(default)]
    pub conflict_policy: Option<ConflictPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum TransferRequest {
    Upload(UploadRequest),
    Download(DownloadRequest),
}

/// Resolves to the session's final report once it reaches a terminal state.
pub struct TransferTicket {
    pub session_id: String,
    rx: watch::Receiver<Option<SessionReport>>,
}

impl TransferTicket {
    pub async fn wait(mut self) -> TransferResult<SessionReport> {
        let report = self
            .rx
            .wait_for(|report| report.is_some())
            .await
            .map_err(|_| TransferError::Internal(format!("session {} vanished", self.session_id)))?
            .clone();
        report.ok_or_else(|| TransferError::Internal("empty session report".into()))
    }
}

#[derive(Clone)]
struct SessionEntry {
    handle: SessionHandle,
    control: Arc<TransferControl>,
    done_tx: Arc<watch::Sender<Option<SessionReport>>>,
}

#[derive(Default)]
struct Queues {
    uploads: VecDeque<String>,
    downloads: VecDeque<String>,
    active_upload: Option<String>,
    active_downloads: HashSet<String>,
}

impl Queues {
    fn push(&mut self, kind: TransferKind, id: String) {
        match kind {
            TransferKind::Upload => self.uploads.push_back(id),
            TransferKind::Download => self.downloads.push_back(id),
        }
    }

    /// Removes a session that has not been admitted yet.
    fn remove_queued(&mut self, id: &str) -> bool {
        let before = self.uploads.len() + self.downloads.len();
        self.uploads.retain(|queued| queued != id);
        self.downloads.retain(|queued| queued != id);
        before != self.uploads.len() + self.downloads.len()
    }

    fn release(&mut self, id: &str) {
        if self.active_upload.as_deref() == Some(id) {
            self.active_upload = None;
        }
        self.active_downloads.remove(id);
    }

    fn drain(&mut self, kind: TransferKind) -> Vec<String> {
        match kind {
            TransferKind::Upload => self.uploads.drain(..).collect(),
            TransferKind::Download => self.downloads.drain(..).collect(),
        }
    }
}

pub struct TransferScheduler {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    queues: Mutex<Queues>,
    settings: RwLock<Settings>,
    connections: ConnectionManager,
    resolver: ConflictResolver,
    /// Local download targets, shared by every running download.
    claims: TargetClaims,
    aggregator: Arc<ProgressAggregator>,
    history: Arc<HistoryManager>,
    events: EventBus,
    progress_tx: mpsc::UnboundedSender<ProgressUpdate>,
    accepting: AtomicBool,
}

impl TransferScheduler {
    /// Must be called from within a tokio runtime; the progress consumer is
    /// spawned here.
    pub fn new(
        factory: Arc<dyn BackendFactory>,
        site: SiteConfig,
        settings: Settings,
        history: Arc<HistoryManager>,
        events: EventBus,
    ) -> TransferResult<Arc<Self>> {
        settings.validate()?;
        let aggregator = Arc::new(ProgressAggregator::new(events.clone()));
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        tokio::spawn(aggregator.clone().run(progress_rx));

        Ok(Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            queues: Mutex::new(Queues::default()),
            connections: ConnectionManager::new(factory, site, settings.clone()),
            settings: RwLock::new(settings),
            resolver: ConflictResolver::new(events.clone()),
            claims: TargetClaims::new(),
            aggregator,
            history,
            events,
            progress_tx,
            accepting: AtomicBool::new(true),
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn update_settings(self: &Arc<Self>, settings: Settings) -> TransferResult<()> {
        settings.validate()?;
        self.connections.update_settings(&settings);
        self.history.set_max_entries(settings.max_history_entries);
        *self.settings.write() = settings;
        // A higher download limit may admit queued sessions right away.
        self.pump();
        Ok(())
    }

    pub fn set_site(&self, site: SiteConfig) {
        self.connections.set_site(site);
    }

    /// Builds a session for `request`, queues it and admits whatever fits.
    pub fn start(self: &Arc<Self>, request: TransferRequest) -> TransferResult<TransferTicket> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(TransferError::InvalidState("scheduler is shutting down".into()));
        }
        let settings = self.settings();
        let site = self.connections.site().site_ref();
        let session = match request {
            TransferRequest::Upload(request) => build_upload(request, site, &settings)?,
            TransferRequest::Download(request) => build_download(request, site, &settings)?,
        };

        let id = session.id.clone();
        let kind = session.kind;
        let control = Arc::new(TransferControl::new(kind.can_pause()));
        let (done_tx, done_rx) = watch::channel(None);
        let handle = session.into_handle();

        self.sessions.write().insert(
            id.clone(),
            SessionEntry {
                handle: handle.clone(),
                control,
                done_tx: Arc::new(done_tx),
            },
        );
        self.record_history(&handle);
        self.aggregator.publish(&handle);
        {
            let s = handle.read();
            tracing::info!(
                session = %id,
                ?kind,
                items = s.total_count,
                bytes = s.total_bytes,
                "session queued"
            );
        }
        self.queues.lock().push(kind, id.clone());
        self.pump();

        Ok(TransferTicket {
            session_id: id,
            rx: done_rx,
        })
    }

    /// Requests cancellation. Queued sessions end immediately; running ones
    /// move to `Cancelling` and stop at the next check point.
    pub fn cancel(self: &Arc<Self>, session_id: &str) -> TransferResult<()> {
        let entry = self.entry(session_id)?;
        if self.queues.lock().remove_queued(session_id) {
            tracing::info!(session = %session_id, "queued session cancelled");
            entry.control.cancel();
            entry.handle.write().request_cancel();
            self.finalize(session_id, &entry, SessionStatus::Cancelled, None);
            return Ok(());
        }
        if entry.handle.read().status.is_terminal() {
            return Ok(());
        }
        self.begin_cancel(&entry.handle, &entry.control);
        Ok(())
    }

    pub fn pause(&self, session_id: &str) -> TransferResult<()> {
        let entry = self.entry(session_id)?;
        if !entry.control.is_pausable() {
            return Err(TransferError::InvalidState("upload sessions cannot be paused".into()));
        }
        let event = {
            let mut s = entry.handle.write();
            if s.status != SessionStatus::Downloading {
                return Err(TransferError::InvalidState(format!(
                    "cannot pause a session that is {:?}",
                    s.status
                )));
            }
            entry.control.pause()?;
            s.set_status(SessionStatus::Paused)?;
            s.speed = 0.0;
            s.state_event()
        };
        tracing::info!(session = %session_id, "session paused");
        self.events.emit(TransferEvent::SessionStateChanged(event));
        self.record_history(&entry.handle);
        Ok(())
    }

    pub fn resume(&self, session_id: &str) -> TransferResult<()> {
        let entry = self.entry(session_id)?;
        let event = {
            let mut s = entry.handle.write();
            if s.status != SessionStatus::Paused {
                return Err(TransferError::InvalidState(format!(
                    "cannot resume a session that is {:?}",
                    s.status
                )));
            }
            s.set_status(SessionStatus::Downloading)?;
            s.state_event()
        };
        entry.control.resume();
        tracing::info!(session = %session_id, "session resumed");
        self.events.emit(TransferEvent::SessionStateChanged(event));
        self.record_history(&entry.handle);
        Ok(())
    }

    /// Answers the session's pending conflict prompt. `None` dismisses it,
    /// which cancels the session.
    pub fn submit_conflict_decision(
        &self,
        session_id: &str,
        response: Option<ConflictResponse>,
    ) -> TransferResult<()> {
        self.entry(session_id)?;
        self.resolver.submit(session_id, response)
    }

    pub fn has_pending_conflict(&self, session_id: &str) -> bool {
        self.resolver.has_pending(session_id)
    }

    /// Copy of a live session.
    pub fn session(&self, session_id: &str) -> Option<TransferSession> {
        let handle = self.sessions.read().get(session_id).map(|e| e.handle.clone())?;
        let session = handle.read().clone();
        Some(session)
    }

    pub fn snapshot(&self, session_id: &str) -> Option<ProgressSnapshot> {
        if let Some(snapshot) = self.aggregator.snapshot(session_id) {
            return Some(snapshot);
        }
        let session = self.session(session_id)?;
        Some(ProgressSnapshot {
            session_id: session.id,
            transferred_bytes: session.transferred_bytes,
            total_bytes: session.total_bytes,
            completed_count: session.completed_count,
            total_count: session.total_count,
            current_item: None,
            speed: 0.0,
        })
    }

    /// Every live session, oldest first.
    pub fn active_sessions(&self) -> Vec<TransferSession> {
        let handles: Vec<SessionHandle> =
            self.sessions.read().values().map(|e| e.handle.clone()).collect();
        let mut sessions: Vec<TransferSession> = handles.iter().map(|h| h.read().clone()).collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    /// Cancels everything, waits for sessions to wind down and drops all
    /// connections.
    pub async fn shutdown(self: &Arc<Self>) {
        self.accepting.store(false, Ordering::SeqCst);
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        let mut waiters = Vec::new();
        for id in ids {
            if let Ok(entry) = self.entry(&id) {
                waiters.push(entry.done_tx.subscribe());
            }
            let _ = self.cancel(&id);
        }

        let settings = self.settings();
        let budget = settings.cancel_grace_period() + settings.call_timeout();
        let wait_all = join_all(waiters.into_iter().map(|mut rx| async move {
            let _ = rx.wait_for(|report| report.is_some()).await;
        }));
        if tokio::time::timeout(budget, wait_all).await.is_err() {
            tracing::warn!("sessions still running at shutdown");
        }
        tracing::debug!(open = self.connections.active_count(), "closing connections");
        self.connections.shutdown().await;
        tracing::info!("scheduler shut down");
    }

    fn entry(&self, session_id: &str) -> TransferResult<SessionEntry> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| TransferError::SessionNotFound(session_id.to_string()))
    }

    /// Admits queued sessions while capacity allows.
    fn pump(self: &Arc<Self>) {
        let max_downloads = self.settings.read().max_concurrent_downloads;
        let admitted: Vec<String> = {
            let mut queues = self.queues.lock();
            let mut admitted = Vec::new();
            if queues.active_upload.is_none() {
                if let Some(id) = queues.uploads.pop_front() {
                    queues.active_upload = Some(id.clone());
                    admitted.push(id);
                }
            }
            while queues.active_downloads.len() < max_downloads {
                match queues.downloads.pop_front() {
                    Some(id) => {
                        queues.active_downloads.insert(id.clone());
                        admitted.push(id);
                    }
                    None => break,
                }
            }
            admitted
        };

        for id in admitted {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_session(id).await });
        }
    }

    async fn run_session(self: Arc<Self>, session_id: String) {
        let entry = match self.entry(&session_id) {
            Ok(entry) => entry,
            Err(_) => {
                self.queues.lock().release(&session_id);
                self.pump();
                return;
            }
        };
        let handle = entry.handle.clone();
        let control = entry.control.clone();

        if let Err(e) = self.transition(&handle, SessionStatus::Starting) {
            tracing::warn!(session = %session_id, error = %e, "session could not start");
        }
        self.aggregator.register(handle.clone());
        self.record_history(&handle);

        let outcome = match self.connections.acquire(&session_id).await {
            Ok(connection) => {
                let outcome = self.drive(&handle, &control, &connection).await;
                self.connections.release(&connection).await;
                outcome
            }
            Err(e) => Err(e),
        };

        let (status, error) = match &outcome {
            Ok(()) => (SessionStatus::Completed, None),
            Err(e) if e.is_cancellation() => (SessionStatus::Cancelled, None),
            Err(e) => (SessionStatus::Failed, Some(e.to_string())),
        };
        self.finalize(&session_id, &entry, status, error);

        if let Err(e) = &outcome {
            if e.is_connection_level() {
                let kind = handle.read().kind;
                self.fail_queued(kind, &e.to_string());
            }
        }
        self.pump();
    }

    /// Moves a session to its terminal state, publishes it and hands the
    /// report to the ticket.
    fn finalize(
        &self,
        session_id: &str,
        entry: &SessionEntry,
        status: SessionStatus,
        error: Option<String>,
    ) {
        let (report, event) = {
            let mut s = entry.handle.write();
            if status == SessionStatus::Completed && s.status == SessionStatus::Paused {
                // Paused after the last byte; nothing left to resume.
                let _ = s.set_status(SessionStatus::Downloading);
            }
            if let Err(e) = s.finish(status, error) {
                tracing::warn!(session = %session_id, error = %e, "unexpected terminal transition");
            }
            (s.report(), s.state_event())
        };

        self.resolver.clear_session(session_id);
        let released = self.claims.release_session(session_id);
        if released > 0 {
            tracing::trace!(session = %session_id, released, "released download targets");
        }
        self.aggregator.unregister(session_id);
        self.record_history(&entry.handle);
        self.sessions.write().remove(session_id);
        self.queues.lock().release(session_id);

        tracing::info!(
            session = %session_id,
            status = ?report.status,
            completed = report.completed_count,
            total = report.total_count,
            failures = report.failures.len(),
            "session finished"
        );
        self.events.emit(TransferEvent::SessionStateChanged(event));
        self.events.emit(TransferEvent::SessionFinished(report.clone()));
        entry.done_tx.send_replace(Some(report));
    }

    /// Queued sessions of `kind` would hit the same dead site; fail them.
    fn fail_queued(&self, kind: TransferKind, reason: &str) {
        let queued = self.queues.lock().drain(kind);
        for id in queued {
            if let Ok(entry) = self.entry(&id) {
                tracing::warn!(session = %id, "failing queued session after connection loss");
                self.finalize(
                    &id,
                    &entry,
                    SessionStatus::Failed,
                    Some(format!("Connection lost before start: {}", reason)),
                );
            }
        }
    }

    fn begin_cancel(&self, handle: &SessionHandle, control: &TransferControl) {
        control.cancel();
        let event = {
            let mut s = handle.write();
            s.request_cancel();
            if matches!(
                s.status,
                SessionStatus::Starting
                    | SessionStatus::Uploading
                    | SessionStatus::Downloading
                    | SessionStatus::Paused
            ) {
                let _ = s.set_status(SessionStatus::Cancelling);
            }
            s.state_event()
        };
        tracing::info!(session = %event.session_id, "cancellation requested");
        self.events.emit(TransferEvent::SessionStateChanged(event));
    }

    fn transition(&self, handle: &SessionHandle, status: SessionStatus) -> TransferResult<()> {
        let event = {
            let mut s = handle.write();
            s.set_status(status)?;
            s.state_event()
        };
        self.events.emit(TransferEvent::SessionStateChanged(event));
        Ok(())
    }

    fn record_history(&self, handle: &SessionHandle) {
        let record = HistoryRecord::from_session(&handle.read());
        match self.history.upsert(record) {
            Ok(()) => self.events.emit(TransferEvent::HistoryChanged),
            Err(e) => tracing::warn!(error = %e, "failed to persist history"),
        }
    }

    /// Runs every item of an admitted session.
    ///
    /// `Ok` means the session completed. A cancellation observed after every
    /// item already finished also counts as completion.
    async fn drive(
        &self,
        handle: &SessionHandle,
        control: &Arc<TransferControl>,
        connection: &Arc<Connection>,
    ) -> TransferResult<()> {
        let result = self.drive_items(handle, control, connection).await;
        match result {
            Err(e) if e.is_cancellation() => {
                let unfinished = handle.read().has_unfinished_items();
                if unfinished {
                    Err(e)
                } else {
                    Ok(())
                }
            }
            other => other,
        }
    }

    async fn drive_items(
        &self,
        handle: &SessionHandle,
        control: &Arc<TransferControl>,
        connection: &Arc<Connection>,
    ) -> TransferResult<()> {
        control.checkpoint(CheckPoint::BeforeTransfer)?;
        self.expand_remote_folders(handle, control, connection).await?;
        self.resolve_folder_conflicts(handle, control, connection).await?;
        self.activate(handle, control)?;
        self.record_history(handle);

        let mut created_dirs = HashSet::new();
        let total = handle.read().items.len();
        for index in 0..total {
            self.process_item(handle, control, connection, index, &mut created_dirs)
                .await?;
        }
        Ok(())
    }

    /// Starting → Uploading/Downloading, unless a cancel already arrived.
    fn activate(&self, handle: &SessionHandle, control: &TransferControl) -> TransferResult<()> {
        let event = {
            let mut s = handle.write();
            control.checkpoint(CheckPoint::BeforeTransfer)?;
            let active = s.kind.active_status();
            s.set_status(active)?;
            s.state_event()
        };
        self.events.emit(TransferEvent::SessionStateChanged(event));
        Ok(())
    }

    /// Replaces remote folder placeholders with their contents.
    async fn expand_remote_folders(
        &self,
        handle: &SessionHandle,
        control: &TransferControl,
        connection: &Arc<Connection>,
    ) -> TransferResult<()> {
        let options = WalkOptions::from_settings(&self.settings())?;
        loop {
            let next = {
                let s = handle.read();
                s.items
                    .iter()
                    .position(|item| item.needs_expansion)
                    .map(|index| (index, s.items[index].clone()))
            };
            let Some((index, placeholder)) = next else {
                break;
            };
            control.checkpoint(CheckPoint::BeforeTransfer)?;

            let walk = walk_remote(
                connection,
                &placeholder.remote_path,
                &placeholder.local_path,
                &options,
            );
            let walked = until_lost(connection, walk).await;
            let root = placeholder.root.unwrap_or_default();
            let items = match walked {
                Ok(result) => walked_items(result, root, &placeholder),
                Err(e) if e.is_connection_level() || e.is_cancellation() => return Err(e),
                Err(e) => vec![TransferItem::unreadable(
                    placeholder.name.clone(),
                    placeholder.local_path.clone(),
                    placeholder.remote_path.clone(),
                    e.item_message(),
                )
                .in_root(root)],
            };
            tracing::debug!(
                path = %placeholder.remote_path,
                items = items.len(),
                "expanded remote folder"
            );
            handle.write().splice_item(index, items);
        }
        self.aggregator.publish(handle);
        Ok(())
    }

    /// Consults the resolver once per folder input whose destination exists.
    async fn resolve_folder_conflicts(
        &self,
        handle: &SessionHandle,
        control: &TransferControl,
        connection: &Arc<Connection>,
    ) -> TransferResult<()> {
        let (kind, roots, session_id) = {
            let s = handle.read();
            (s.kind, s.roots.clone(), s.id.clone())
        };
        let local = ClaimingProbe::new(&self.claims, &session_id);

        for (root_index, root) in roots.iter().enumerate() {
            let has_work = handle
                .read()
                .items
                .iter()
                .any(|item| item.root == Some(root_index) && !item.status.is_terminal());
            if !has_work {
                continue;
            }
            control.checkpoint(CheckPoint::BeforeConflict)?;

            let target = match kind {
                TransferKind::Upload => root.remote_path.clone(),
                TransferKind::Download => root.local_path.to_string_lossy().into_owned(),
            };
            let probe = probe_for(kind, connection, &local);
            let exists = match until_lost(connection, probe.exists(&target)).await {
                Ok(exists) => exists,
                Err(e) if e.is_connection_level() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        path = %target,
                        error = %e,
                        "could not check folder destination"
                    );
                    continue;
                }
            };
            if !exists {
                continue;
            }

            let resolution = until_lost(
                connection,
                self.resolver.resolve(handle, control, &target, &root.name, true, probe),
            )
            .await?;
            let decision = match resolution {
                Resolution::Cancelled => {
                    self.begin_cancel(handle, control);
                    return Err(TransferError::ConflictUnresolved(format!(
                        "no decision for {}",
                        target
                    )));
                }
                Resolution::Decided(decision) => decision,
            };
            control.checkpoint(CheckPoint::AfterConflict)?;

            match decision.action {
                ConflictAction::Overwrite => {
                    let mut s = handle.write();
                    for item in s.items.iter_mut().filter(|item| item.root == Some(root_index)) {
                        item.overwrite_approved = true;
                    }
                }
                ConflictAction::Skip => {
                    let ids: Vec<String> = handle
                        .read()
                        .items
                        .iter()
                        .filter(|item| item.root == Some(root_index) && !item.status.is_terminal())
                        .map(|item| item.id.clone())
                        .collect();
                    for id in ids {
                        self.aggregator.finish_item(handle, &id, ItemStatus::Skipped, None);
                    }
                }
                ConflictAction::Rename => {
                    rebase_root(&mut handle.write(), root_index, &decision.final_path);
                }
            }
            tracing::debug!(
                folder = %target,
                action = ?decision.action,
                "folder conflict resolved"
            );
        }
        Ok(())
    }

    async fn process_item(
        &self,
        handle: &SessionHandle,
        control: &Arc<TransferControl>,
        connection: &Arc<Connection>,
        index: usize,
        created_dirs: &mut HashSet<String>,
    ) -> TransferResult<()> {
        let (item, kind, session_id) = {
            let s = handle.read();
            (s.items[index].clone(), s.kind, s.id.clone())
        };
        if item.status.is_terminal() {
            return Ok(());
        }

        control.checkpoint(CheckPoint::BeforeConflict)?;
        control.wait_while_paused().await?;
        handle.write().current_item_index = Some(index);
        self.aggregator.publish(handle);

        if let Some(reason) = item.enumeration_error() {
            tracing::warn!(item = %item.name, error = %reason, "source could not be read");
            self.aggregator
                .finish_item(handle, &item.id, ItemStatus::Failed, Some(reason.to_string()));
            return control.checkpoint(CheckPoint::AfterItem);
        }
        if item.is_directory {
            return self.create_directory(handle, connection, &item, kind, created_dirs).await;
        }

        let target = item.target(kind);
        let local = ClaimingProbe::new(&self.claims, &session_id);
        let probe = probe_for(kind, connection, &local);
        let existed = match until_lost(connection, probe.exists(&target)).await {
            Ok(existed) => existed,
            Err(e) => return self.fail_item(handle, &item, e),
        };

        let mut final_target = target.clone();
        let mut target_is_new = !existed;
        if existed && !item.overwrite_approved {
            let resolution = until_lost(
                connection,
                self.resolver.resolve(handle, control, &target, &item.name, false, probe),
            )
            .await;
            match resolution {
                Err(e) => return self.fail_item(handle, &item, e),
                Ok(Resolution::Cancelled) => {
                    self.begin_cancel(handle, control);
                    return Err(TransferError::ConflictUnresolved(format!(
                        "no decision for {}",
                        target
                    )));
                }
                Ok(Resolution::Decided(decision)) => match decision.action {
                    ConflictAction::Skip => {
                        tracing::debug!(item = %item.name, "skipped existing target");
                        self.aggregator.finish_item(handle, &item.id, ItemStatus::Skipped, None);
                        return Ok(());
                    }
                    ConflictAction::Overwrite => {}
                    ConflictAction::Rename => {
                        final_target = decision.final_path;
                        target_is_new = true;
                        let mut s = handle.write();
                        let item_mut = &mut s.items[index];
                        match kind {
                            TransferKind::Upload => item_mut.remote_path = final_target.clone(),
                            TransferKind::Download => {
                                item_mut.local_path = PathBuf::from(&final_target)
                            }
                        }
                    }
                },
            }
        }
        control.checkpoint(CheckPoint::AfterConflict)?;

        if let Err(e) = self.ensure_parent(connection, kind, &final_target, created_dirs).await {
            return self.fail_item(handle, &item, e);
        }
        control.checkpoint(CheckPoint::BeforeTransfer)?;

        self.aggregator.begin_item(handle, index);
        let sink = ProgressSink::new(
            &session_id,
            &item.id,
            self.progress_tx.clone(),
            control.clone(),
        );
        let grace = self.settings.read().cancel_grace_period();
        let transfer = async {
            match kind {
                TransferKind::Upload => {
                    connection.put(&item.local_path, &final_target, &sink).await
                }
                TransferKind::Download => {
                    connection
                        .get(&item.remote_path, Path::new(&final_target), &sink)
                        .await
                }
            }
        };
        let result = tokio::select! {
            result = transfer => result,
            _ = async {
                control.cancelled().await;
                tokio::time::sleep(grace).await;
            } => Err(TransferError::Cancelled(format!(
                "{} abandoned after {:?}",
                item.name, grace
            ))),
            reason = connection.lost() => Err(TransferError::Connection(reason)),
        };

        match result {
            Ok(bytes) => {
                tracing::debug!(item = %item.name, bytes, "item completed");
                self.aggregator.finish_item(handle, &item.id, ItemStatus::Completed, None);
            }
            Err(e) if e.is_cancellation() => {
                self.aggregator.finish_item(handle, &item.id, ItemStatus::Aborted, None);
                if target_is_new {
                    self.remove_partial(connection, kind, &final_target).await;
                }
                return Err(e);
            }
            Err(e) if e.is_connection_level() => {
                self.aggregator
                    .finish_item(handle, &item.id, ItemStatus::Aborted, Some(e.item_message()));
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(item = %item.name, error = %e, "item failed");
                self.aggregator
                    .finish_item(handle, &item.id, ItemStatus::Failed, Some(e.item_message()));
            }
        }

        control.checkpoint(CheckPoint::AfterItem)
    }

    /// Records a per-item failure and carries on; connection loss and
    /// cancellation still end the session.
    fn fail_item(
        &self,
        handle: &SessionHandle,
        item: &TransferItem,
        err: TransferError,
    ) -> TransferResult<()> {
        if err.is_connection_level() || err.is_cancellation() {
            return Err(err);
        }
        tracing::warn!(item = %item.name, error = %err, "item failed");
        self.aggregator
            .finish_item(handle, &item.id, ItemStatus::Failed, Some(err.item_message()));
        Ok(())
    }

    async fn create_directory(
        &self,
        handle: &SessionHandle,
        connection: &Arc<Connection>,
        item: &TransferItem,
        kind: TransferKind,
        created_dirs: &mut HashSet<String>,
    ) -> TransferResult<()> {
        let target = item.target(kind);
        let result = match kind {
            TransferKind::Upload => until_lost(connection, connection.mkdir(&target)).await,
            TransferKind::Download => tokio::fs::create_dir_all(&item.local_path)
                .await
                .map_err(|e| TransferError::filesystem(&item.local_path, e)),
        };
        match result {
            Ok(()) => {
                created_dirs.insert(target);
                self.aggregator.finish_item(handle, &item.id, ItemStatus::Completed, None);
                Ok(())
            }
            Err(e) => self.fail_item(handle, item, e),
        }
    }

    /// Creates the target's parent directory once per session.
    async fn ensure_parent(
        &self,
        connection: &Arc<Connection>,
        kind: TransferKind,
        target: &str,
        created_dirs: &mut HashSet<String>,
    ) -> TransferResult<()> {
        match kind {
            TransferKind::Upload => {
                let Some(parent) = remote_parent(target) else {
                    return Ok(());
                };
                if parent == "/" || created_dirs.contains(parent) {
                    return Ok(());
                }
                until_lost(connection, connection.mkdir(parent)).await?;
                created_dirs.insert(parent.to_string());
            }
            TransferKind::Download => {
                let Some(parent) = Path::new(target).parent() else {
                    return Ok(());
                };
                let key = parent.to_string_lossy().into_owned();
                if key.is_empty() || created_dirs.contains(&key) {
                    return Ok(());
                }
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TransferError::filesystem(parent, e))?;
                created_dirs.insert(key);
            }
        }
        Ok(())
    }

    /// Best-effort removal of a partially written target.
    async fn remove_partial(&self, connection: &Connection, kind: TransferKind, target: &str) {
        let result = match kind {
            TransferKind::Upload => connection.delete(target, false).await,
            TransferKind::Download => tokio::fs::remove_file(target)
                .await
                .map_err(|e| TransferError::filesystem(Path::new(target), e)),
        };
        match result {
            Ok(()) => tracing::debug!(path = %target, "removed partial file"),
            Err(e) => tracing::debug!(path = %target, error = %e, "partial file not removed"),
        }
    }
}

/// Races `fut` against the loss of `connection`.
async fn until_lost<T, F>(connection: &Connection, fut: F) -> TransferResult<T>
where
    F: Future<Output = TransferResult<T>>,
{
    tokio::select! {
        result = fut => result,
        reason = connection.lost() => Err(TransferError::Connection(reason)),
    }
}

fn probe_for<'a>(
    kind: TransferKind,
    connection: &'a Arc<Connection>,
    local: &'a ClaimingProbe<'a>,
) -> &'a dyn TargetProbe {
    match kind {
        TransferKind::Upload => &**connection,
        TransferKind::Download => local,
    }
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Items for one folder root: empty directories, files, then unreadable
/// subtrees. An entirely empty folder becomes a single directory item.
fn walked_items(result: WalkResult, root: usize, folder: &TransferItem) -> Vec<TransferItem> {
    if result.is_empty() {
        return vec![TransferItem::directory(
            folder.name.clone(),
            folder.local_path.clone(),
            folder.remote_path.clone(),
        )
        .in_root(root)];
    }
    let dirs = result
        .empty_dirs
        .into_iter()
        .map(|dir| {
            TransferItem::directory(dir.name, dir.local_path, dir.remote_path).in_root(root)
        });
    let files = result
        .files
        .into_iter()
        .map(|file| {
            TransferItem::file(file.name, file.local_path, file.remote_path, file.size)
                .in_root(root)
        });
    let errors = result.errors.into_iter().map(|err| {
        TransferItem::unreadable(err.name, err.local_path, err.remote_path, err.message)
            .in_root(root)
    });
    dirs.chain(files).chain(errors).collect()
}

/// Moves every item of a folder root under `new_target`.
fn rebase_root(session: &mut TransferSession, root_index: usize, new_target: &str) {
    let kind = session.kind;
    let Some(root) = session.roots.get(root_index).cloned() else {
        return;
    };
    let mut claimed = Vec::new();
    for item in session.items.iter_mut().filter(|item| item.root == Some(root_index)) {
        match kind {
            TransferKind::Upload => {
                if let Some(rest) = item.remote_path.strip_prefix(&root.remote_path) {
                    item.remote_path = format!("{}{}", new_target, rest);
                }
            }
            TransferKind::Download => {
                if let Ok(rest) = item.local_path.strip_prefix(&root.local_path) {
                    item.local_path = Path::new(new_target).join(rest);
                }
            }
        }
        claimed.push(item.target(kind));
    }
    for path in claimed {
        session.claim_path(path);
    }
    if let Some(root) = session.roots.get_mut(root_index) {
        match kind {
            TransferKind::Upload => root.remote_path = new_target.to_string(),
            TransferKind::Download => root.local_path = PathBuf::from(new_target),
        }
    }
}

fn build_upload(
    request: UploadRequest,
    site: SiteRef,
    settings: &Settings,
) -> TransferResult<TransferSession> {
    if request.sources.is_empty() {
        return Err(TransferError::InvalidPath("nothing selected for upload".into()));
    }
    let policy = request
        .conflict_policy
        .unwrap_or(settings.default_conflict_resolution);
    let options = WalkOptions::from_settings(settings)?;
    let mut session = TransferSession::new(
        TransferKind::Upload,
        site,
        policy,
        PathBuf::new(),
        request.remote_dir.clone(),
    );

    for source in request.sources {
        let name = source_name(&source);
        let remote = join_remote(&request.remote_dir, &name);
        match std::fs::metadata(&source) {
            Err(e) => {
                tracing::warn!(path = %source.display(), error = %e, "upload source unreadable");
                session.push_item(TransferItem::unreadable(name, source, remote, e.to_string()));
            }
            Ok(metadata) if metadata.is_dir() => {
                let root = session.add_root(FolderRoot {
                    name: name.clone(),
                    local_path: source.clone(),
                    remote_path: remote.clone(),
                });
                let folder = TransferItem::directory(name.clone(), source.clone(), remote.clone());
                let items = match walk(&source, &remote, &options) {
                    Ok(result) => walked_items(result, root, &folder),
                    Err(e) => vec![
                        TransferItem::unreadable(name, source, remote, e.item_message())
                            .in_root(root),
                    ],
                };
                for item in items {
                    session.push_item(item);
                }
            }
            Ok(metadata) => {
                session.push_item(TransferItem::file(name, source, remote, metadata.len()))
            }
        }
    }
    Ok(session)
}

fn build_download(
    request: DownloadRequest,
    site: SiteRef,
    settings: &Settings,
) -> TransferResult<TransferSession> {
    if request.sources.is_empty() {
        return Err(TransferError::InvalidPath("nothing selected for download".into()));
    }
    let policy = request
        .conflict_policy
        .unwrap_or(settings.default_conflict_resolution);
    let mut session = TransferSession::new(
        TransferKind::Download,
        site,
        policy,
        request.local_dir.clone(),
        "",
    );

    for entry in request.sources {
        let local = request.local_dir.join(&entry.name);
        if entry.is_directory {
            let root = session.add_root(FolderRoot {
                name: entry.name.clone(),
                local_path: local.clone(),
                remote_path: entry.path.clone(),
            });
            let mut placeholder =
                TransferItem::directory(entry.name, local, entry.path).in_root(root);
            placeholder.needs_expansion = true;
            session.push_item(placeholder);
        } else {
            session.push_item(TransferItem::file(entry.name, local, entry.path, entry.size));
        }
    }
    Ok(session)
}
