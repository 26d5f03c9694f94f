//! Flat JSON documents under one data directory: the timer snapshot, the
//! overlay theme and the increment settings. Writes are synchronous and go
//! through a temp file so a crash mid-write leaves the previous document.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};
use shared::domain::{IncrementSettings, ThemeSettings, TimerSnapshot};
use thiserror::Error;
use tracing::debug;

const TIMER_STATE_FILE: &str = "timer_state.json";
const THEME_SETTINGS_FILE: &str = "theme_settings.json";
const INCREMENT_SETTINGS_FILE: &str = "timer_settings.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to access '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode '{}': {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode '{}': {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StorageError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn load_timer(&self) -> Result<Option<TimerSnapshot>> {
        self.read_document(TIMER_STATE_FILE)
    }

    pub fn save_timer(&self, snapshot: &TimerSnapshot) -> Result<()> {
        self.write_document(TIMER_STATE_FILE, snapshot)
    }

    pub fn load_theme(&self) -> Result<Option<ThemeSettings>> {
        self.read_document(THEME_SETTINGS_FILE)
    }

    pub fn save_theme(&self, theme: &ThemeSettings) -> Result<()> {
        self.write_document(THEME_SETTINGS_FILE, theme)
    }

    pub fn load_increments(&self) -> Result<Option<IncrementSettings>> {
        self.read_document(INCREMENT_SETTINGS_FILE)
    }

    pub fn save_increments(&self, increments: &IncrementSettings) -> Result<()> {
        self.write_document(INCREMENT_SETTINGS_FILE, increments)
    }

    fn read_document<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.root.join(name);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| StorageError::Decode { path, source })
    }

    fn write_document<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.root.join(name);
        let bytes = serde_json::to_vec(value).map_err(|source| StorageError::Encode {
            path: path.clone(),
            source,
        })?;
        let tmp_path = self.root.join(format!(".{name}.tmp"));
        let io_err = |source| StorageError::Io {
            path: path.clone(),
            source,
        };

        let mut file = fs::File::create(&tmp_path).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        fs::rename(&tmp_path, &path).map_err(io_err)?;

        debug!(path = %path.display(), bytes = bytes.len(), "document written");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
