//! Error types for the transfer session manager.

use std::path::Path;

use thiserror::Error;

/// Main error type for transfer operations.
///
/// The variants follow how the scheduler propagates them: connection-level
/// errors end every session bound to the connection, per-item errors are
/// recorded on the item, and cancellation maps to the `Cancelled` terminal
/// state without ever being reported as a failure.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Conflict unresolved: {0}")]
    ConflictUnresolved(String),

    #[error("Transfer failed for {path}: {message}")]
    ItemTransfer { path: String, message: String },

    #[error("Filesystem error at {path}: {message}")]
    Filesystem { path: String, message: String },

    #[error("Transfer cancelled: {0}")]
    Cancelled(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransferError {
    /// Builds a per-item error for a remote-side failure.
    pub fn item(path: impl Into<String>, message: impl ToString) -> Self {
        TransferError::ItemTransfer {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Builds a per-item error for a local path that became inaccessible.
    pub fn filesystem(path: &Path, err: impl ToString) -> Self {
        TransferError::Filesystem {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    /// Errors that are fatal to every session bound to the connection.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, TransferError::Connection(_) | TransferError::Timeout(_))
    }

    /// Errors that end a session as cancelled rather than failed.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            TransferError::Cancelled(_) | TransferError::ConflictUnresolved(_)
        )
    }

    /// Message suitable for an item's `error` field.
    ///
    /// Per-item variants drop the path prefix since the item already names it.
    pub fn item_message(&self) -> String {
        match self {
            TransferError::ItemTransfer { message, .. } => message.clone(),
            TransferError::Filesystem { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl serde::Serialize for TransferError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias for transfer operations.
pub type TransferResult<T> = Result<T, TransferError>;
