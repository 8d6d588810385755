//! Backend serving a local directory tree as the remote store.
//!
//! Useful for mounted network shares and as the reference implementation of
//! [`TransferBackend`] in tests.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use super::{RemoteEntry, SiteConfig, TransferBackend};
use crate::errors::{TransferError, TransferResult};
use crate::file_ops::{copy_file_with_progress, join_remote, metadata_to_datetime, CopyOptions};
use crate::progress::ProgressSink;

pub struct LocalBackend {
    root: PathBuf,
    connected: bool,
    copy_options: CopyOptions,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            connected: false,
            copy_options: CopyOptions::default(),
        }
    }

    pub fn from_site(site: &SiteConfig) -> Self {
        let mut backend = Self::new(site.root.clone().unwrap_or_default());
        backend.copy_options.verify_integrity = site.verify_integrity;
        backend
    }

    /// Maps a remote path onto the served directory, refusing traversal.
    fn resolve(&self, remote: &str) -> TransferResult<PathBuf> {
        if !self.connected {
            return Err(TransferError::Connection("not connected".into()));
        }
        let relative = Path::new(remote.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(TransferError::InvalidPath(format!(
                        "'{}' escapes the served directory",
                        remote
                    )))
                }
            }
        }
        Ok(resolved)
    }

    fn entry(path: &str, name: String, metadata: &std::fs::Metadata) -> RemoteEntry {
        RemoteEntry {
            path: join_remote(path, &name),
            name,
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            is_directory: metadata.is_dir(),
            modified: metadata_to_datetime(metadata).ok(),
        }
    }

    async fn copy(
        &self,
        source: PathBuf,
        dest: PathBuf,
        sink: &ProgressSink,
    ) -> TransferResult<u64> {
        let options = self.copy_options.clone();
        let sink = sink.clone();
        tokio::task::spawn_blocking(move || {
            copy_file_with_progress(&source, &dest, &options, |bytes| {
                sink.block_while_paused();
                sink.report(bytes)
            })
        })
        .await
        .map_err(|e| TransferError::Internal(format!("copy task failed: {}", e)))?
    }
}

#[async_trait]
impl TransferBackend for LocalBackend {
    async fn connect(&mut self) -> TransferResult<()> {
        let metadata = tokio::fs::metadata(&self.root).await.map_err(|e| {
            TransferError::Connection(format!("cannot open {}: {}", self.root.display(), e))
        })?;
        if !metadata.is_dir() {
            return Err(TransferError::Connection(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        self.connected = true;
        tracing::debug!(root = %self.root.display(), "local backend connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> TransferResult<()> {
        self.connected = false;
        Ok(())
    }

    async fn list(&mut self, path: &str) -> TransferResult<Vec<RemoteEntry>> {
        let dir = self.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| TransferError::item(path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| TransferError::item(path, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            match tokio::fs::metadata(entry.path()).await {
                Ok(metadata) => entries.push(Self::entry(path, name, &metadata)),
                Err(e) => tracing::warn!(path, name, error = %e, "skipping unreadable entry"),
            }
        }
        Ok(entries)
    }

    async fn stat(&mut self, path: &str) -> TransferResult<Option<RemoteEntry>> {
        let resolved = self.resolve(path)?;
        match tokio::fs::metadata(&resolved).await {
            Ok(metadata) => {
                let name = crate::file_ops::remote_file_name(path).to_string();
                let mut entry = Self::entry(path, name, &metadata);
                entry.path = path.to_string();
                Ok(Some(entry))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransferError::item(path, e)),
        }
    }

    async fn get(
        &mut self,
        remote: &str,
        local: &Path,
        sink: &ProgressSink,
    ) -> TransferResult<u64> {
        let source = self.resolve(remote)?;
        self.copy(source, local.to_path_buf(), sink).await
    }

    async fn put(
        &mut self,
        local: &Path,
        remote: &str,
        sink: &ProgressSink,
    ) -> TransferResult<u64> {
        let dest = self.resolve(remote)?;
        self.copy(local.to_path_buf(), dest, sink).await
    }

    async fn mkdir(&mut self, path: &str) -> TransferResult<()> {
        let dir = self.resolve(path)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TransferError::item(path, e))
    }

    async fn delete(&mut self, path: &str, recursive: bool) -> TransferResult<()> {
        let target = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&target)
            .await
            .map_err(|e| TransferError::item(path, e))?;
        let result = if !metadata.is_dir() {
            tokio::fs::remove_file(&target).await
        } else if recursive {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_dir(&target).await
        };
        result.map_err(|e| TransferError::item(path, e))
    }

    async fn rename(&mut self, from: &str, to: &str) -> TransferResult<()> {
        let source = self.resolve(from)?;
        let dest = self.resolve(to)?;
        tokio::fs::rename(&source, &dest)
            .await
            .map_err(|e| TransferError::item(from, e))
    }
}
