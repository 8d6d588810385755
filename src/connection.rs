//! Connected backends and their liveness.
//!
//! Each admitted session acquires its own [`Connection`]. Operations are
//! serialized through an async mutex, bounded by timeouts, and a heartbeat
//! task probes the backend while it is idle. The first connection-level
//! failure marks the connection lost and wakes everything racing
//! [`Connection::lost`].

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::backend::{BackendFactory, RemoteEntry, SiteConfig, TransferBackend};
use crate::conflict::TargetProbe;
use crate::errors::{TransferError, TransferResult};
use crate::progress::ProgressSink;
use crate::settings::Settings;
use crate::transfer_state::SiteRef;

/// Longest pause between two stall checks during a transfer.
const MAX_STALL_CHECK: Duration = Duration::from_secs(1);

pub struct Connection {
    id: String,
    session_id: String,
    site: SiteRef,
    backend: tokio::sync::Mutex<Box<dyn TransferBackend>>,
    alive: AtomicBool,
    lost_reason: Mutex<Option<String>>,
    lost_notify: Notify,
    call_timeout: Duration,
    stall_timeout: Duration,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn new(
        session_id: &str,
        site: SiteRef,
        backend: Box<dyn TransferBackend>,
        settings: &Settings,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            site,
            backend: tokio::sync::Mutex::new(backend),
            alive: AtomicBool::new(true),
            lost_reason: Mutex::new(None),
            lost_notify: Notify::new(),
            call_timeout: settings.call_timeout(),
            stall_timeout: settings.transfer_stall_timeout(),
            stop_tx: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn site(&self) -> &SiteRef {
        &self.site
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn lost_reason(&self) -> Option<String> {
        self.lost_reason.lock().clone()
    }

    /// Marks the connection unusable. Only the first reason is kept.
    pub fn mark_lost(&self, reason: impl Into<String>) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let reason = reason.into();
            tracing::warn!(
                connection = %self.id,
                session = %self.session_id,
                %reason,
                "connection lost"
            );
            *self.lost_reason.lock() = Some(reason);
        }
        self.lost_notify.notify_waiters();
    }

    /// Resolves with the loss reason once the connection is lost.
    pub async fn lost(&self) -> String {
        loop {
            let notified = self.lost_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_alive() {
                return self.lost_reason().unwrap_or_else(|| "connection lost".into());
            }
            notified.await;
        }
    }

    fn ensure_alive(&self) -> TransferResult<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(TransferError::Connection(
                self.lost_reason().unwrap_or_else(|| "connection lost".into()),
            ))
        }
    }

    fn observe<T>(&self, result: TransferResult<T>) -> TransferResult<T> {
        if let Err(e) = &result {
            if e.is_connection_level() {
                self.mark_lost(e.to_string());
            }
        }
        result
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> TransferResult<T>
    where
        F: Future<Output = TransferResult<T>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout(format!(
                "{} did not answer within {:?}",
                op, self.call_timeout
            ))),
        }
    }

    /// Runs a transfer, failing it once no progress arrives for the stall timeout.
    async fn watch_stall<T, F>(&self, fut: F, sink: &ProgressSink) -> TransferResult<T>
    where
        F: Future<Output = TransferResult<T>>,
    {
        tokio::pin!(fut);
        let period = (self.stall_timeout / 4).clamp(Duration::from_millis(1), MAX_STALL_CHECK);
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                result = &mut fut => return result,
                _ = ticker.tick() => {
                    if sink.is_paused() {
                        sink.touch();
                    } else if sink.idle_for() >= self.stall_timeout {
                        return Err(TransferError::Timeout(format!(
                            "no progress for {:?}",
                            self.stall_timeout
                        )));
                    }
                }
            }
        }
    }

    pub async fn list(&self, path: &str) -> TransferResult<Vec<RemoteEntry>> {
        self.ensure_alive()?;
        let mut backend = self.backend.lock().await;
        let result = self.bounded("list", backend.list(path)).await;
        self.observe(result)
    }

    pub async fn stat(&self, path: &str) -> TransferResult<Option<RemoteEntry>> {
        self.ensure_alive()?;
        let mut backend = self.backend.lock().await;
        let result = self.bounded("stat", backend.stat(path)).await;
        self.observe(result)
    }

    pub async fn exists(&self, path: &str) -> TransferResult<bool> {
        self.ensure_alive()?;
        let mut backend = self.backend.lock().await;
        let result = self.bounded("exists", backend.exists(path)).await;
        self.observe(result)
    }

    pub async fn mkdir(&self, path: &str) -> TransferResult<()> {
        self.ensure_alive()?;
        let mut backend = self.backend.lock().await;
        let result = self.bounded("mkdir", backend.mkdir(path)).await;
        self.observe(result)
    }

    pub async fn delete(&self, path: &str, recursive: bool) -> TransferResult<()> {
        self.ensure_alive()?;
        let mut backend = self.backend.lock().await;
        let result = self.bounded("delete", backend.delete(path, recursive)).await;
        self.observe(result)
    }

    pub async fn rename(&self, from: &str, to: &str) -> TransferResult<()> {
        self.ensure_alive()?;
        let mut backend = self.backend.lock().await;
        let result = self.bounded("rename", backend.rename(from, to)).await;
        self.observe(result)
    }

    pub async fn put(
        &self,
        local: &Path,
        remote: &str,
        sink: &ProgressSink,
    ) -> TransferResult<u64> {
        self.ensure_alive()?;
        let mut backend = self.backend.lock().await;
        sink.touch();
        let result = self.watch_stall(backend.put(local, remote, sink), sink).await;
        self.observe(result)
    }

    pub async fn get(
        &self,
        remote: &str,
        local: &Path,
        sink: &ProgressSink,
    ) -> TransferResult<u64> {
        self.ensure_alive()?;
        let mut backend = self.backend.lock().await;
        sink.touch();
        let result = self.watch_stall(backend.get(remote, local, sink), sink).await;
        self.observe(result)
    }

    /// One keep-alive probe. Skipped while an operation holds the backend.
    ///
    /// Returns `false` once the connection is lost.
    async fn heartbeat(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        let Ok(mut backend) = self.backend.try_lock() else {
            tracing::trace!(connection = %self.id, "backend busy, skipping heartbeat");
            return true;
        };
        match tokio::time::timeout(self.call_timeout, backend.keepalive()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.mark_lost(format!("heartbeat failed: {}", e));
                false
            }
            Err(_) => {
                self.mark_lost(format!("heartbeat timed out after {:?}", self.call_timeout));
                false
            }
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        *self.stop_tx.lock() = Some(stop_tx);
        let connection = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; the connect just proved liveness.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {
                        if !connection.heartbeat().await {
                            break;
                        }
                    }
                }
            }
            tracing::trace!(connection = %connection.id, "heartbeat stopped");
        });
    }

    /// Stops the heartbeat and disconnects the backend.
    pub async fn close(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.try_send(());
        }
        match tokio::time::timeout(self.call_timeout, self.backend.lock()).await {
            Ok(mut backend) => {
                match tokio::time::timeout(self.call_timeout, backend.disconnect()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(connection = %self.id, error = %e, "disconnect failed")
                    }
                    Err(_) => tracing::debug!(connection = %self.id, "disconnect timed out"),
                }
            }
            Err(_) => {
                tracing::warn!(connection = %self.id, "backend still busy, dropping connection")
            }
        }
    }
}

#[async_trait]
impl TargetProbe for Connection {
    async fn exists(&self, path: &str) -> TransferResult<bool> {
        Connection::exists(self, path).await
    }
}

/// Hands out one connected backend per session.
pub struct ConnectionManager {
    factory: Arc<dyn BackendFactory>,
    site: RwLock<SiteConfig>,
    settings: RwLock<Settings>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn BackendFactory>, site: SiteConfig, settings: Settings) -> Self {
        Self {
            factory,
            site: RwLock::new(site),
            settings: RwLock::new(settings),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn site(&self) -> SiteConfig {
        self.site.read().clone()
    }

    pub fn set_site(&self, site: SiteConfig) {
        *self.site.write() = site;
    }

    /// Applies to connections acquired afterwards.
    pub fn update_settings(&self, settings: &Settings) {
        *self.settings.write() = settings.clone();
    }

    pub fn active_count(&self) -> usize {
        self.connections.read().len()
    }

    pub async fn acquire(&self, session_id: &str) -> TransferResult<Arc<Connection>> {
        let site = self.site();
        let settings = self.settings.read().clone();
        let mut backend = self.factory.create(&site);

        match tokio::time::timeout(settings.call_timeout(), backend.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_connection_level() => return Err(e),
            Ok(Err(e)) => return Err(TransferError::Connection(e.to_string())),
            Err(_) => {
                return Err(TransferError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    site.host,
                    settings.call_timeout()
                )))
            }
        }

        let connection = Arc::new(Connection::new(session_id, site.site_ref(), backend, &settings));
        connection.spawn_heartbeat(settings.heartbeat_interval());
        self.connections
            .write()
            .insert(connection.id.clone(), connection.clone());
        tracing::info!(
            connection = %connection.id,
            session = %session_id,
            host = %site.host,
            "connection acquired"
        );
        Ok(connection)
    }

    pub async fn release(&self, connection: &Arc<Connection>) {
        self.connections.write().remove(&connection.id);
        connection.close().await;
        tracing::debug!(connection = %connection.id, "connection released");
    }

    pub async fn shutdown(&self) {
        let all: Vec<Arc<Connection>> = self.connections.write().drain().map(|(_, c)| c).collect();
        join_all(all.iter().map(|c| c.close())).await;
    }
}
