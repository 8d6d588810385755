//! Local file primitives and remote path helpers.

use chrono::{DateTime, TimeZone, Utc};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use xxhash_rust::xxh3::Xxh3;

use crate::errors::{TransferError, TransferResult};

pub const COPY_BUFFER_SIZE: usize = 256 * 1024;
pub const HASH_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub buffer_size: usize,
    pub preserve_metadata: bool,
    pub verify_integrity: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            buffer_size: COPY_BUFFER_SIZE,
            preserve_metadata: true,
            verify_integrity: false,
        }
    }
}

pub fn compute_file_hash(path: &Path) -> TransferResult<u64> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut hasher = Xxh3::new();

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.digest())
}

pub fn metadata_to_datetime(metadata: &std::fs::Metadata) -> TransferResult<DateTime<Utc>> {
    let modified = metadata.modified()?;
    let duration = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| TransferError::Internal(format!("Time error: {}", e)))?;

    Utc.timestamp_opt(duration.as_secs() as i64, duration.subsec_nanos())
        .single()
        .ok_or_else(|| TransferError::Internal("Invalid timestamp".into()))
}

/// Copies `source` to `dest`, reporting the running byte count after every
/// chunk. The callback returns `false` to abort with `Cancelled`.
pub fn copy_file_with_progress<F>(
    source: &Path,
    dest: &Path,
    options: &CopyOptions,
    mut progress_callback: F,
) -> TransferResult<u64>
where
    F: FnMut(u64) -> bool,
{
    let src_file = File::open(source).map_err(|e| TransferError::filesystem(source, e))?;
    let src_metadata = src_file.metadata()?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| TransferError::filesystem(parent, e))?;
    }

    let mut dest_file = File::create(dest).map_err(|e| TransferError::filesystem(dest, e))?;
    let mut reader = BufReader::with_capacity(options.buffer_size, src_file);
    let mut writer = BufWriter::with_capacity(options.buffer_size, &mut dest_file);

    let mut buffer = vec![0u8; options.buffer_size];
    let mut bytes_copied = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }

        writer.write_all(&buffer[..bytes_read])?;
        bytes_copied += bytes_read as u64;

        if !progress_callback(bytes_copied) {
            return Err(TransferError::Cancelled("Transfer cancelled by user".into()));
        }
    }

    writer.flush()?;
    drop(writer);

    dest_file.sync_all()?;

    if options.preserve_metadata {
        let permissions = src_metadata.permissions();
        let _ = fs::set_permissions(dest, permissions);
        let _ = filetime::set_file_mtime(
            dest,
            filetime::FileTime::from_system_time(src_metadata.modified()?),
        );
    }

    if options.verify_integrity {
        let src_hash = compute_file_hash(source)?;
        let dest_hash = compute_file_hash(dest)?;
        if src_hash != dest_hash {
            return Err(TransferError::item(
                dest.display().to_string(),
                "integrity check failed after copy",
            ));
        }
    }

    Ok(bytes_copied)
}

/// Joins remote path segments with `/`, collapsing duplicate separators.
pub fn join_remote(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if name.is_empty() {
        return if base.is_empty() { "/".into() } else { base.to_string() };
    }
    format!("{}/{}", base, name)
}

/// Parent directory of a remote path, or `None` for the root.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) if trimmed.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(pos) => Some(&trimmed[..pos]),
    }
}

/// Last segment of a remote path.
pub fn remote_file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}
