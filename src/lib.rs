//! Transfer session manager for a desktop remote-file client.
//!
//! [`TransferApp`] is the surface the presentation layer talks to. It owns
//! the scheduler, the history and the settings, and publishes every state
//! change on a [`TransferEvent`] bus.

pub mod backend;
pub mod conflict;
pub mod connection;
pub mod control;
pub mod errors;
pub mod events;
pub mod file_ops;
pub mod history;
pub mod logging;
pub mod persistence;
pub mod progress;
pub mod scheduler;
pub mod settings;
pub mod transfer_state;
pub mod walker;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

pub use backend::{BackendFactory, LocalBackend, RemoteEntry, SiteConfig, TransferBackend};
pub use conflict::{ConflictAction, ConflictPolicy, ConflictResponse};
pub use errors::{TransferError, TransferResult};
pub use events::{EventBus, TransferEvent};
pub use history::{HistoryRecord, HistoryStatus};
pub use persistence::{JsonFileStore, MemoryStore, Persistence};
pub use progress::ProgressSnapshot;
pub use scheduler::{
    DownloadRequest, TransferRequest, TransferScheduler, TransferTicket, UploadRequest,
};
pub use settings::Settings;
pub use transfer_state::{ItemStatus, SessionReport, SessionStatus, TransferKind, TransferSession};

use history::HistoryManager;

/// System directories that are never read from or written to.
const BLOCKED_PATHS: &[&str] = &[
    "/System",
    "/Library",
    "/private/etc",
    "/etc",
    "/usr",
    "/bin",
    "/sbin",
    "/dev",
    "/proc",
    "/sys",
    "/cores",
];

/// Canonicalizes `path` and rejects system directories.
pub fn validate_local_path(path: &Path) -> TransferResult<PathBuf> {
    let canonical = path.canonicalize().map_err(|e| {
        TransferError::PermissionDenied(format!("Cannot access path '{}': {}", path.display(), e))
    })?;

    for blocked in BLOCKED_PATHS {
        if canonical.starts_with(blocked) {
            return Err(TransferError::PermissionDenied(format!(
                "Access to system directory '{}' is not allowed",
                blocked
            )));
        }
    }

    if canonical.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(TransferError::PermissionDenied(
            "Path traversal sequences (..) are not allowed".to_string(),
        ));
    }

    Ok(canonical)
}

/// Like [`validate_local_path`], but the last component may not exist yet.
fn validate_destination(path: &Path) -> TransferResult<PathBuf> {
    if path.exists() {
        return validate_local_path(path);
    }
    let parent = path
        .parent()
        .ok_or_else(|| {
            TransferError::InvalidPath("Destination path has no parent directory".into())
        })?;
    let name = path
        .file_name()
        .ok_or_else(|| TransferError::InvalidPath("Destination path has no file name".into()))?;
    Ok(validate_local_path(parent)?.join(name))
}

pub struct TransferApp {
    store: Arc<dyn Persistence>,
    history: Arc<HistoryManager>,
    scheduler: Arc<TransferScheduler>,
    events: EventBus,
}

impl TransferApp {
    /// Loads settings and history. Interrupted transfers from a previous run
    /// are rewritten as failed before anything can observe them.
    ///
    /// Must be called from within a tokio runtime.
    pub fn initialize(
        store: Arc<dyn Persistence>,
        factory: Arc<dyn BackendFactory>,
        site: SiteConfig,
    ) -> TransferResult<Self> {
        let mut settings = store.load_settings()?;
        if let Err(e) = settings.validate() {
            tracing::warn!(error = %e, "stored settings are invalid, using defaults");
            settings = Settings::default();
        }

        let history = Arc::new(HistoryManager::load(store.clone(), settings.max_history_entries)?);
        let events = EventBus::default();
        let scheduler =
            TransferScheduler::new(factory, site, settings, history.clone(), events.clone())?;

        tracing::info!(history = history.records().len(), "transfer manager initialized");
        Ok(Self {
            store,
            history,
            scheduler,
            events,
        })
    }

    pub fn scheduler(&self) -> &Arc<TransferScheduler> {
        &self.scheduler
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    pub fn start(&self, request: TransferRequest) -> TransferResult<TransferTicket> {
        let request = match request {
            TransferRequest::Upload(mut upload) => {
                for source in upload.sources.iter_mut() {
                    // Missing sources surface as failed items instead.
                    if source.exists() {
                        *source = validate_local_path(source)?;
                    }
                }
                TransferRequest::Upload(upload)
            }
            TransferRequest::Download(mut download) => {
                download.local_dir = validate_destination(&download.local_dir)?;
                TransferRequest::Download(download)
            }
        };
        self.scheduler.start(request)
    }

    pub fn cancel(&self, session_id: &str) -> TransferResult<()> {
        self.scheduler.cancel(session_id)
    }

    pub fn pause(&self, session_id: &str) -> TransferResult<()> {
        self.scheduler.pause(session_id)
    }

    pub fn resume(&self, session_id: &str) -> TransferResult<()> {
        self.scheduler.resume(session_id)
    }

    pub fn submit_conflict_decision(
        &self,
        session_id: &str,
        response: ConflictResponse,
    ) -> TransferResult<()> {
        self.scheduler.submit_conflict_decision(session_id, Some(response))
    }

    /// Closing the prompt without an answer cancels the session.
    pub fn dismiss_conflict(&self, session_id: &str) -> TransferResult<()> {
        self.scheduler.submit_conflict_decision(session_id, None)
    }

    pub fn session(&self, session_id: &str) -> Option<TransferSession> {
        self.scheduler.session(session_id)
    }

    pub fn snapshot(&self, session_id: &str) -> Option<ProgressSnapshot> {
        self.scheduler.snapshot(session_id)
    }

    pub fn active_sessions(&self) -> Vec<TransferSession> {
        self.scheduler.active_sessions()
    }

    pub fn history(&self) -> Vec<HistoryRecord> {
        self.history.records()
    }

    /// Removes finished entries. Returns how many were dropped.
    pub fn clear_history(&self) -> TransferResult<usize> {
        let removed = self.history.clear_finished()?;
        if removed > 0 {
            self.events.emit(TransferEvent::HistoryChanged);
        }
        Ok(removed)
    }

    pub fn remove_history_entry(&self, id: &str) -> TransferResult<bool> {
        let removed = self.history.remove(id)?;
        if removed {
            self.events.emit(TransferEvent::HistoryChanged);
        }
        Ok(removed)
    }

    pub fn settings(&self) -> Settings {
        self.scheduler.settings()
    }

    pub fn update_settings(&self, settings: Settings) -> TransferResult<()> {
        settings.validate()?;
        self.store.save_settings(&settings)?;
        self.scheduler.update_settings(settings)
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn system_directories_are_blocked() {
        let err = validate_local_path(Path::new("/etc")).unwrap_err();
        assert!(matches!(err, TransferError::PermissionDenied(_)));
    }

    #[test]
    fn missing_paths_are_rejected() {
        assert!(validate_local_path(Path::new("/definitely/not/here")).is_err());
    }

    #[test]
    fn destination_may_not_exist_yet() {
        let dir = TempDir::new().unwrap();
        let dest = validate_destination(&dir.path().join("new-folder")).unwrap();
        assert!(dest.ends_with("new-folder"));
        assert!(validate_destination(&dir.path().join("a/b")).is_err());
    }

    #[tokio::test]
    async fn update_settings_persists() {
        let served = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let site = SiteConfig {
            root: Some(served.path().display().to_string()),
            ..SiteConfig::default()
        };
        let factory: Arc<dyn BackendFactory> = Arc::new(|site: &SiteConfig| {
            Box::new(LocalBackend::from_site(site)) as Box<dyn TransferBackend>
        });
        let app = TransferApp::initialize(store.clone(), factory, site).unwrap();

        let settings = Settings {
            max_concurrent_downloads: 1,
            ..Settings::default()
        };
        app.update_settings(settings.clone()).unwrap();
        assert_eq!(store.load_settings().unwrap(), settings);
        assert_eq!(app.settings(), settings);

        let bad = Settings {
            max_concurrent_downloads: 0,
            ..Settings::default()
        };
        assert!(app.update_settings(bad).is_err());
        assert_eq!(store.load_settings().unwrap(), settings);
    }
}
