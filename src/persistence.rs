//! Storage for transfer history and settings.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;

use crate::errors::{TransferError, TransferResult};
use crate::history::HistoryRecord;
use crate::settings::Settings;

const HISTORY_FILE: &str = "history.json";
const SETTINGS_FILE: &str = "settings.json";

pub trait Persistence: Send + Sync {
    fn load_history(&self) -> TransferResult<Vec<HistoryRecord>>;
    fn save_history(&self, records: &[HistoryRecord]) -> TransferResult<()>;
    fn load_settings(&self) -> TransferResult<Settings>;
    fn save_settings(&self, settings: &Settings) -> TransferResult<()>;
}

/// JSON files in one directory, each replaced atomically on save.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> TransferResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| TransferError::filesystem(&dir, e))?;
        Ok(Self { dir })
    }

    /// `<data_local_dir>/ftpdeck`.
    pub fn default_location() -> TransferResult<Self> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| {
                TransferError::Internal("Could not determine app data directory".into())
            })?;
        Self::new(data_dir.join("ftpdeck"))
    }

    fn read<T: DeserializeOwned>(&self, name: &str) -> TransferResult<Option<T>> {
        let path = self.dir.join(name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TransferError::filesystem(&path, e)),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn write<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> TransferResult<()> {
        let target = self.dir.join(name);
        let temp_file = self.dir.join(format!("{}.tmp", name));

        let content = serde_json::to_string_pretty(value)?;
        std::fs::write(&temp_file, content)?;
        std::fs::rename(&temp_file, &target)?;

        Ok(())
    }
}

impl Persistence for JsonFileStore {
    fn load_history(&self) -> TransferResult<Vec<HistoryRecord>> {
        Ok(self.read(HISTORY_FILE)?.unwrap_or_default())
    }

    fn save_history(&self, records: &[HistoryRecord]) -> TransferResult<()> {
        self.write(HISTORY_FILE, records)
    }

    fn load_settings(&self) -> TransferResult<Settings> {
        match self.read::<Settings>(SETTINGS_FILE) {
            Ok(settings) => Ok(settings.unwrap_or_default()),
            Err(TransferError::Serialization(e)) => {
                tracing::warn!(error = %e, "settings file is corrupt, using defaults");
                Ok(Settings::default())
            }
            Err(e) => Err(e),
        }
    }

    fn save_settings(&self, settings: &Settings) -> TransferResult<()> {
        self.write(SETTINGS_FILE, settings)
    }
}

/// Keeps everything in memory. Used by tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    history: RwLock<Vec<HistoryRecord>>,
    settings: RwLock<Option<Settings>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(records: Vec<HistoryRecord>) -> Self {
        Self {
            history: RwLock::new(records),
            settings: RwLock::new(None),
        }
    }

    pub fn with_settings(self, settings: Settings) -> Self {
        *self.settings.write() = Some(settings);
        self
    }
}

impl Persistence for MemoryStore {
    fn load_history(&self) -> TransferResult<Vec<HistoryRecord>> {
        Ok(self.history.read().clone())
    }

    fn save_history(&self, records: &[HistoryRecord]) -> TransferResult<()> {
        *self.history.write() = records.to_vec();
        Ok(())
    }

    fn load_settings(&self) -> TransferResult<Settings> {
        Ok(self.settings.read().clone().unwrap_or_default())
    }

    fn save_settings(&self, settings: &Settings) -> TransferResult<()> {
        *self.settings.write() = Some(settings.clone());
        Ok(())
    }
}
