//! User-tunable settings consumed by the scheduler.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::conflict::ConflictPolicy;
use crate::errors::{TransferError, TransferResult};

/// Default number of download sessions that may run at the same time.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub max_concurrent_downloads: usize,
    pub default_conflict_resolution: ConflictPolicy,
    /// Interval between keep-alive probes on an idle connection.
    pub heartbeat_interval_ms: u64,
    /// Upper bound for any non-transfer backend call (connect, stat, mkdir...).
    pub call_timeout_ms: u64,
    /// A get/put that reports no progress for this long is treated as a timeout.
    pub transfer_stall_timeout_ms: u64,
    /// How long an in-flight primitive may take to acknowledge a cancellation.
    pub cancel_grace_period_ms: u64,
    pub max_history_entries: usize,
    pub follow_symlinks: bool,
    pub exclude_patterns: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            default_conflict_resolution: ConflictPolicy::Prompt,
            heartbeat_interval_ms: 30_000,
            call_timeout_ms: 30_000,
            transfer_stall_timeout_ms: 120_000,
            cancel_grace_period_ms: 2_000,
            max_history_entries: 200,
            follow_symlinks: false,
            exclude_patterns: Vec::new(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> TransferResult<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(TransferError::InvalidSettings(
                "maxConcurrentDownloads must be at least 1".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 || self.call_timeout_ms == 0 {
            return Err(TransferError::InvalidSettings(
                "heartbeat interval and call timeout must be non-zero".into(),
            ));
        }
        if self.transfer_stall_timeout_ms == 0 {
            return Err(TransferError::InvalidSettings(
                "transferStallTimeoutMs must be non-zero".into(),
            ));
        }
        for pattern in &self.exclude_patterns {
            if pattern.trim().is_empty() {
                return Err(TransferError::InvalidSettings(
                    "Exclude pattern cannot be empty".into(),
                ));
            }
            globset::Glob::new(pattern).map_err(|e| {
                TransferError::InvalidSettings(format!(
                    "Invalid exclude pattern '{}': {}",
                    pattern, e
                ))
            })?;
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn transfer_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_stall_timeout_ms)
    }

    pub fn cancel_grace_period(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert_eq!(settings.max_concurrent_downloads, 3);
        assert_eq!(settings.default_conflict_resolution, ConflictPolicy::Prompt);
        settings.validate().unwrap();
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let json = r#"{"maxConcurrentDownloads": 5, "defaultConflictResolution": "rename"}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.max_concurrent_downloads, 5);
        assert_eq!(settings.default_conflict_resolution, ConflictPolicy::Rename);
        assert_eq!(settings.cancel_grace_period_ms, 2_000);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let settings = Settings {
            max_concurrent_downloads: 0,
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(TransferError::InvalidSettings(_))));
    }

    #[test]
    fn rejects_bad_glob() {
        let settings = Settings {
            exclude_patterns: vec!["[".into()],
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
