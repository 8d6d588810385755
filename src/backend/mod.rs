//! The transfer backend boundary.
//!
//! A backend is one connected protocol client. The scheduler never shares a
//! backend between sessions; each admitted session gets its own through the
//! [`ConnectionManager`](crate::connection::ConnectionManager).

pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::TransferResult;
use crate::progress::ProgressSink;
use crate::transfer_state::SiteRef;

pub use local::LocalBackend;

/// Connection parameters for a remote site.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Never written back out.
    #[serde(skip_serializing, default)]
    pub secret: Option<String>,
    /// Initial remote directory; for [`LocalBackend`] the served directory.
    pub root: Option<String>,
    /// Re-hash both ends of every copy and fail the item on a mismatch.
    /// Only backends that can read the stored bytes back honour it.
    #[serde(default)]
    pub verify_integrity: bool,
}

impl SiteConfig {
    pub fn site_ref(&self) -> SiteRef {
        SiteRef {
            name: self.name.clone(),
            host: self.host.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub is_directory: bool,
    pub modified: Option<DateTime<Utc>>,
}

/// Operations the session manager needs from a protocol client.
///
/// Errors follow the crate's propagation rule: `Connection` and `Timeout`
/// mean the client is unusable, anything else is scoped to the path.
/// `get` and `put` report through the sink and stop early once
/// [`ProgressSink::report`] returns `false`.
#[async_trait]
pub trait TransferBackend: Send + Sync {
    async fn connect(&mut self) -> TransferResult<()>;

    async fn disconnect(&mut self) -> TransferResult<()>;

    async fn list(&mut self, path: &str) -> TransferResult<Vec<RemoteEntry>>;

    /// `Ok(None)` when nothing exists at `path`.
    async fn stat(&mut self, path: &str) -> TransferResult<Option<RemoteEntry>>;

    /// Downloads `remote` into `local`. Returns the bytes written.
    async fn get(&mut self, remote: &str, local: &Path, sink: &ProgressSink) -> TransferResult<u64>;

    /// Uploads `local` to `remote`. Returns the bytes written.
    async fn put(&mut self, local: &Path, remote: &str, sink: &ProgressSink) -> TransferResult<u64>;

    /// Creates `path` and any missing parents.
    async fn mkdir(&mut self, path: &str) -> TransferResult<()>;

    async fn delete(&mut self, path: &str, recursive: bool) -> TransferResult<()>;

    async fn rename(&mut self, from: &str, to: &str) -> TransferResult<()>;

    async fn exists(&mut self, path: &str) -> TransferResult<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    /// Cheap round trip used by the heartbeat.
    async fn keepalive(&mut self) -> TransferResult<()> {
        self.exists("/").await.map(|_| ())
    }
}

/// Creates fresh, unconnected backends.
pub trait BackendFactory: Send + Sync {
    fn create(&self, site: &SiteConfig) -> Box<dyn TransferBackend>;
}

impl<F> BackendFactory for F
where
    F: Fn(&SiteConfig) -> Box<dyn TransferBackend> + Send + Sync,
{
    fn create(&self, site: &SiteConfig) -> Box<dyn TransferBackend> {
        self(site)
    }
}
