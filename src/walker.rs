//! Recursive enumeration of folder inputs.

use futures::future::BoxFuture;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::connection::Connection;
use crate::errors::{TransferError, TransferResult};
use crate::file_ops::join_remote;
use crate::settings::Settings;

#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    pub follow_symlinks: bool,
    pub exclude: Option<GlobSet>,
}

impl WalkOptions {
    pub fn from_settings(settings: &Settings) -> TransferResult<Self> {
        let exclude = if settings.exclude_patterns.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in &settings.exclude_patterns {
                let glob = Glob::new(pattern).map_err(|e| {
                    TransferError::InvalidSettings(format!(
                        "Invalid exclude pattern '{}': {}",
                        pattern, e
                    ))
                })?;
                builder.add(glob);
            }
            Some(
                builder
                    .build()
                    .map_err(|e| TransferError::InvalidSettings(e.to_string()))?,
            )
        };
        Ok(Self {
            follow_symlinks: settings.follow_symlinks,
            exclude,
        })
    }

    /// Matches against the path relative to the walk root and the bare name.
    fn is_excluded(&self, relative: &str, name: &str) -> bool {
        self.exclude
            .as_ref()
            .map(|set| set.is_match(relative) || set.is_match(name))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedFile {
    pub name: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedDir {
    pub name: String,
    pub local_path: PathBuf,
    pub remote_path: String,
}

/// A subtree that could not be enumerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkError {
    pub name: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct WalkResult {
    pub files: Vec<WalkedFile>,
    pub empty_dirs: Vec<WalkedDir>,
    pub errors: Vec<WalkError>,
}

impl WalkResult {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.empty_dirs.is_empty() && self.errors.is_empty()
    }
}

/// Directories first, then by name.
fn walk_order(a: &DirEntry, b: &DirEntry) -> Ordering {
    b.file_type()
        .is_dir()
        .cmp(&a.file_type().is_dir())
        .then_with(|| a.file_name().cmp(b.file_name()))
}

fn relative_remote(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Enumerates `root` into files, empty directories and unreadable subtrees.
///
/// The root itself is never emitted. Remote paths are `base_remote` joined
/// with the path relative to `root`.
pub fn walk(root: &Path, base_remote: &str, options: &WalkOptions) -> TransferResult<WalkResult> {
    let metadata = std::fs::metadata(root).map_err(|e| TransferError::filesystem(root, e))?;
    if !metadata.is_dir() {
        return Err(TransferError::InvalidPath(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let mut result = WalkResult::default();
    let mut children: HashMap<PathBuf, usize> = HashMap::new();
    let mut dir_order: Vec<PathBuf> = Vec::new();
    let mut unreadable: HashSet<PathBuf> = HashSet::new();

    let mut entries = WalkDir::new(root)
        .min_depth(1)
        .follow_links(options.follow_symlinks)
        .sort_by(walk_order)
        .into_iter();

    while let Some(next) = entries.next() {
        let entry = match next {
            Ok(entry) => entry,
            Err(err) => {
                let local_path = err
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.to_path_buf());
                let relative = relative_remote(root, &local_path);
                tracing::warn!(
                    path = %local_path.display(),
                    error = %err,
                    "unreadable entry during walk"
                );
                unreadable.insert(local_path.clone());
                result.errors.push(WalkError {
                    name: display_name(&local_path),
                    remote_path: join_remote(base_remote, &relative),
                    local_path,
                    message: err.to_string(),
                });
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            // Only reachable when links are not followed.
            tracing::debug!(path = %entry.path().display(), "skipping symlink");
            continue;
        }

        let relative = relative_remote(root, entry.path());
        let name = entry.file_name().to_string_lossy().into_owned();
        if options.is_excluded(&relative, &name) {
            if file_type.is_dir() {
                entries.skip_current_dir();
            }
            continue;
        }

        if let Some(parent) = entry.path().parent() {
            if let Some(count) = children.get_mut(parent) {
                *count += 1;
            }
        }

        let remote_path = join_remote(base_remote, &relative);
        if file_type.is_dir() {
            children.insert(entry.path().to_path_buf(), 0);
            dir_order.push(entry.path().to_path_buf());
            continue;
        }

        match entry.metadata() {
            Ok(meta) => result.files.push(WalkedFile {
                name,
                local_path: entry.path().to_path_buf(),
                remote_path,
                size: meta.len(),
            }),
            Err(err) => result.errors.push(WalkError {
                name,
                local_path: entry.path().to_path_buf(),
                remote_path,
                message: err.to_string(),
            }),
        }
    }

    for dir in dir_order {
        if children.get(&dir).copied() == Some(0) && !unreadable.contains(&dir) {
            let relative = relative_remote(root, &dir);
            result.empty_dirs.push(WalkedDir {
                name: display_name(&dir),
                remote_path: join_remote(base_remote, &relative),
                local_path: dir,
            });
        }
    }

    tracing::debug!(
        root = %root.display(),
        files = result.files.len(),
        empty_dirs = result.empty_dirs.len(),
        errors = result.errors.len(),
        "walk finished"
    );
    Ok(result)
}

/// Enumerates a remote directory tree for a download into `local_base`.
///
/// Connection-level failures abort the walk; other listing failures are
/// recorded per subtree like the local walk does.
pub async fn walk_remote(
    connection: &Connection,
    remote_root: &str,
    local_base: &Path,
    options: &WalkOptions,
) -> TransferResult<WalkResult> {
    let mut result = WalkResult::default();
    // The root's own emptiness is the caller's business.
    walk_remote_dir(
        connection,
        remote_root.to_string(),
        local_base.to_path_buf(),
        String::new(),
        options,
        &mut result,
    )
    .await?;
    Ok(result)
}

/// Returns whether the directory turned out to be empty.
fn walk_remote_dir<'a>(
    connection: &'a Connection,
    remote_dir: String,
    local_dir: PathBuf,
    relative: String,
    options: &'a WalkOptions,
    result: &'a mut WalkResult,
) -> BoxFuture<'a, TransferResult<bool>> {
    Box::pin(async move {
        let mut listing = match connection.list(&remote_dir).await {
            Ok(listing) => listing,
            Err(err) if err.is_connection_level() || err.is_cancellation() => return Err(err),
            Err(err) => {
                tracing::warn!(path = %remote_dir, error = %err, "unreadable remote directory");
                result.errors.push(WalkError {
                    name: crate::file_ops::remote_file_name(&remote_dir).to_string(),
                    local_path: local_dir,
                    remote_path: remote_dir,
                    message: err.item_message(),
                });
                return Ok(false);
            }
        };
        listing.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.cmp(&b.name))
        });

        let mut included = 0usize;
        for entry in listing {
            let child_relative = if relative.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", relative, entry.name)
            };
            if options.is_excluded(&child_relative, &entry.name) {
                continue;
            }
            included += 1;
            let local_path = local_dir.join(&entry.name);
            if entry.is_directory {
                let empty = walk_remote_dir(
                    connection,
                    entry.path.clone(),
                    local_path.clone(),
                    child_relative,
                    options,
                    result,
                )
                .await?;
                if empty {
                    result.empty_dirs.push(WalkedDir {
                        name: entry.name,
                        local_path,
                        remote_path: entry.path,
                    });
                }
            } else {
                result.files.push(WalkedFile {
                    name: entry.name,
                    local_path,
                    remote_path: entry.path,
                    size: entry.size,
                });
            }
        }
        Ok(included == 0)
    })
}
