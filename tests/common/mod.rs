#![allow(dead_code)]

use async_trait::async_trait;
use ftpdeck::backend::{BackendFactory, RemoteEntry, SiteConfig, TransferBackend};
use ftpdeck::errors::{TransferError, TransferResult};
use ftpdeck::file_ops::{remote_file_name, remote_parent};
use ftpdeck::history::HistoryManager;
use ftpdeck::progress::ProgressSink;
use ftpdeck::scheduler::{DownloadRequest, TransferRequest, TransferScheduler, UploadRequest};
use ftpdeck::{ConflictPolicy, EventBus, MemoryStore, Settings, TransferEvent};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{watch, Notify};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn setup_temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

pub fn write_file(root: &Path, relative: &str, size: usize) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, vec![b'x'; size]).unwrap();
    path
}

/// Short timeouts so failure paths finish quickly.
pub fn fast_settings() -> Settings {
    Settings {
        heartbeat_interval_ms: 50,
        call_timeout_ms: 2_000,
        transfer_stall_timeout_ms: 5_000,
        cancel_grace_period_ms: 200,
        ..Settings::default()
    }
}

/// Polls `condition` until it holds or the wait budget runs out.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn upload(
    sources: Vec<PathBuf>,
    remote_dir: &str,
    policy: Option<ConflictPolicy>,
) -> TransferRequest {
    TransferRequest::Upload(UploadRequest {
        sources,
        remote_dir: remote_dir.to_string(),
        conflict_policy: policy,
    })
}

pub fn download(
    sources: Vec<RemoteEntry>,
    local_dir: &Path,
    policy: Option<ConflictPolicy>,
) -> TransferRequest {
    TransferRequest::Download(DownloadRequest {
        sources,
        local_dir: local_dir.to_path_buf(),
        conflict_policy: policy,
    })
}

pub fn remote_file(path: &str, size: u64) -> RemoteEntry {
    RemoteEntry {
        name: remote_file_name(path).to_string(),
        path: path.to_string(),
        size,
        is_directory: false,
        modified: None,
    }
}

pub fn remote_dir(path: &str) -> RemoteEntry {
    RemoteEntry {
        name: remote_file_name(path).to_string(),
        path: path.to_string(),
        size: 0,
        is_directory: true,
        modified: None,
    }
}

/// Everything published on the bus so far, without waiting.
pub fn drain_events(
    rx: &mut tokio::sync::broadcast::Receiver<TransferEvent>,
) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Holds a transfer half-way until opened.
pub struct Gate {
    partial: u64,
    reached: Notify,
    open_tx: watch::Sender<bool>,
}

impl Gate {
    pub async fn reached(&self) {
        tokio::time::timeout(WAIT, self.reached.notified())
            .await
            .expect("gated transfer never started");
    }

    pub fn open(&self) {
        self.open_tx.send_replace(true);
    }
}

#[derive(Clone)]
pub enum Failure {
    Item(String),
    Connection(String),
}

#[derive(Default)]
struct RemoteState {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    dirs: Mutex<BTreeSet<String>>,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
    failures: Mutex<HashMap<String, Failure>>,
    log: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    connections: AtomicUsize,
    broken: AtomicBool,
}

/// Scripted in-memory remote store shared by every backend it creates.
#[derive(Clone, Default)]
pub struct MockRemote {
    state: Arc<RemoteState>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: &str, size: usize) {
        self.add_parents(path);
        self.state.files.lock().insert(path.to_string(), vec![b'r'; size]);
    }

    pub fn add_dir(&self, path: &str) {
        self.add_parents(path);
        self.state.dirs.lock().insert(path.to_string());
    }

    fn add_parents(&self, path: &str) {
        let mut dirs = self.state.dirs.lock();
        let mut current = remote_parent(path);
        while let Some(dir) = current {
            if dir == "/" {
                break;
            }
            dirs.insert(dir.to_string());
            current = remote_parent(dir);
        }
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.state.files.lock().contains_key(path)
    }

    pub fn file_size(&self, path: &str) -> Option<usize> {
        self.state.files.lock().get(path).map(|data| data.len())
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state.dirs.lock().contains(path)
    }

    /// Gates the transfer of `path` after `partial` bytes.
    pub fn gate(&self, path: &str, partial: u64) -> Arc<Gate> {
        let (open_tx, _) = watch::channel(false);
        let gate = Arc::new(Gate {
            partial,
            reached: Notify::new(),
            open_tx,
        });
        self.state.gates.lock().insert(path.to_string(), gate.clone());
        gate
    }

    pub fn fail(&self, path: &str, failure: Failure) {
        self.state.failures.lock().insert(path.to_string(), failure);
    }

    /// Every later call, keep-alives included, fails at connection level.
    pub fn drop_connection(&self) {
        self.state.broken.store(true, Ordering::SeqCst);
    }

    pub fn log(&self) -> Vec<String> {
        self.state.log.lock().clone()
    }

    pub fn transfers(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|entry| entry.starts_with("put ") || entry.starts_with("get "))
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn factory(&self) -> Arc<dyn BackendFactory> {
        let remote = self.clone();
        Arc::new(move |_: &SiteConfig| {
            Box::new(MockBackend {
                state: remote.state.clone(),
            }) as Box<dyn TransferBackend>
        })
    }

    /// Scheduler backed by this remote and an in-memory history.
    pub fn scheduler(&self, settings: Settings) -> Arc<TransferScheduler> {
        let store = Arc::new(MemoryStore::new());
        let history = Arc::new(HistoryManager::load(store, settings.max_history_entries).unwrap());
        TransferScheduler::new(
            self.factory(),
            SiteConfig::default(),
            settings,
            history,
            EventBus::default(),
        )
        .unwrap()
    }
}

struct MockBackend {
    state: Arc<RemoteState>,
}

struct InFlight<'a>(&'a RemoteState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a RemoteState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockBackend {
    fn check(&self, path: &str) -> TransferResult<()> {
        if self.state.broken.load(Ordering::SeqCst) {
            return Err(TransferError::Connection("connection reset".into()));
        }
        match self.state.failures.lock().get(path).cloned() {
            Some(Failure::Item(message)) => Err(TransferError::item(path, message)),
            Some(Failure::Connection(message)) => {
                self.state.broken.store(true, Ordering::SeqCst);
                Err(TransferError::Connection(message))
            }
            None => Ok(()),
        }
    }

    /// Reports progress in two steps, honouring gates, pause and cancel.
    async fn stream(&self, path: &str, size: u64, sink: &ProgressSink) -> TransferResult<()> {
        let gate = self.state.gates.lock().get(path).cloned();
        if let Some(gate) = gate {
            let partial = gate.partial.min(size);
            sink.report(partial);
            gate.reached.notify_one();
            let mut open = gate.open_tx.subscribe();
            loop {
                if *open.borrow_and_update() {
                    break;
                }
                if sink.is_cancelled() {
                    return Err(TransferError::Cancelled("cancelled mid-transfer".into()));
                }
                let _ = tokio::time::timeout(Duration::from_millis(10), open.changed()).await;
            }
        }
        while sink.is_paused() && !sink.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if !sink.report(size) {
            return Err(TransferError::Cancelled("cancelled mid-transfer".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransferBackend for MockBackend {
    async fn connect(&mut self) -> TransferResult<()> {
        if self.state.broken.load(Ordering::SeqCst) {
            return Err(TransferError::Connection("connection refused".into()));
        }
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        self.state.log.lock().push("connect".into());
        Ok(())
    }

    async fn disconnect(&mut self) -> TransferResult<()> {
        Ok(())
    }

    async fn list(&mut self, path: &str) -> TransferResult<Vec<RemoteEntry>> {
        self.check(path)?;
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };
        let is_child = |candidate: &str| {
            candidate
                .strip_prefix(&prefix)
                .map(|rest| !rest.is_empty() && !rest.contains('/'))
                .unwrap_or(false)
        };
        let mut entries: Vec<RemoteEntry> = self
            .state
            .dirs
            .lock()
            .iter()
            .filter(|dir| is_child(dir))
            .map(|dir| RemoteEntry {
                name: remote_file_name(dir).to_string(),
                path: dir.clone(),
                size: 0,
                is_directory: true,
                modified: None,
            })
            .collect();
        entries.extend(
            self.state
                .files
                .lock()
                .iter()
                .filter(|(file, _)| is_child(file))
                .map(|(file, data)| RemoteEntry {
                    name: remote_file_name(file).to_string(),
                    path: file.clone(),
                    size: data.len() as u64,
                    is_directory: false,
                    modified: None,
                }),
        );
        Ok(entries)
    }

    async fn stat(&mut self, path: &str) -> TransferResult<Option<RemoteEntry>> {
        if self.state.broken.load(Ordering::SeqCst) {
            return Err(TransferError::Connection("connection reset".into()));
        }
        if path == "/" || self.state.dirs.lock().contains(path) {
            return Ok(Some(RemoteEntry {
                name: remote_file_name(path).to_string(),
                path: path.to_string(),
                size: 0,
                is_directory: true,
                modified: None,
            }));
        }
        Ok(self.state.files.lock().get(path).map(|data| RemoteEntry {
            name: remote_file_name(path).to_string(),
            path: path.to_string(),
            size: data.len() as u64,
            is_directory: false,
            modified: None,
        }))
    }

    async fn get(
        &mut self,
        remote: &str,
        local: &Path,
        sink: &ProgressSink,
    ) -> TransferResult<u64> {
        self.check(remote)?;
        let data = self
            .state
            .files
            .lock()
            .get(remote)
            .cloned()
            .ok_or_else(|| TransferError::item(remote, "550 No such file"))?;
        self.state.log.lock().push(format!("get {}", remote));
        let _guard = InFlight::enter(&self.state);
        self.stream(remote, data.len() as u64, sink).await?;
        tokio::fs::write(local, &data)
            .await
            .map_err(|e| TransferError::filesystem(local, e))?;
        Ok(data.len() as u64)
    }

    async fn put(
        &mut self,
        local: &Path,
        remote: &str,
        sink: &ProgressSink,
    ) -> TransferResult<u64> {
        self.check(remote)?;
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| TransferError::filesystem(local, e))?;
        self.state.log.lock().push(format!("put {}", remote));
        let _guard = InFlight::enter(&self.state);
        self.stream(remote, data.len() as u64, sink).await?;
        let size = data.len() as u64;
        self.state.files.lock().insert(remote.to_string(), data);
        Ok(size)
    }

    async fn mkdir(&mut self, path: &str) -> TransferResult<()> {
        self.check(path)?;
        self.state.log.lock().push(format!("mkdir {}", path));
        let mut dirs = self.state.dirs.lock();
        let mut current = Some(path);
        while let Some(dir) = current {
            if dir == "/" {
                break;
            }
            dirs.insert(dir.to_string());
            current = remote_parent(dir);
        }
        Ok(())
    }

    async fn delete(&mut self, path: &str, _recursive: bool) -> TransferResult<()> {
        self.state.log.lock().push(format!("delete {}", path));
        let removed =
            self.state.files.lock().remove(path).is_some() || self.state.dirs.lock().remove(path);
        if removed {
            Ok(())
        } else {
            Err(TransferError::item(path, "550 No such file"))
        }
    }

    async fn rename(&mut self, from: &str, to: &str) -> TransferResult<()> {
        let data = self
            .state
            .files
            .lock()
            .remove(from)
            .ok_or_else(|| TransferError::item(from, "550 No such file"))?;
        self.state.files.lock().insert(to.to_string(), data);
        Ok(())
    }

    async fn keepalive(&mut self) -> TransferResult<()> {
        if self.state.broken.load(Ordering::SeqCst) {
            return Err(TransferError::Connection("connection reset".into()));
        }
        Ok(())
    }
}
