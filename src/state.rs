//! Durable send-state - one JSON record per calendar day
//!
//! The record answers "has today's message gone out yet" across reconnects
//! and process restarts. A record whose date is not today reads as fresh.

use crate::error::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Persisted delivery record for one calendar date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendState {
    pub date: NaiveDate,
    pub sent: bool,
    pub attempts: u32,
}

impl SendState {
    pub fn fresh(date: NaiveDate) -> Self {
        Self {
            date,
            sent: false,
            attempts: 0,
        }
    }
}

/// File-backed store for the single [`SendState`] record
pub struct SendStateStore {
    path: PathBuf,
}

impl SendStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record for `today`.
    ///
    /// A missing file or a record for another date yields a fresh record.
    /// An unreadable or corrupt file is an error; callers fall back to a
    /// fresh record themselves.
    pub fn load(&self, today: NaiveDate) -> Result<SendState> {
        match self.read()? {
            Some(state) if state.date == today => Ok(state),
            _ => Ok(SendState::fresh(today)),
        }
    }

    /// Raw record as stored, whatever its date
    pub fn read(&self) -> Result<Option<SendState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .map_err(|e| Error::Persistence(format!("{}: {}", self.path.display(), e)))?;
        let state = serde_json::from_str(&content)
            .map_err(|e| Error::Persistence(format!("{}: {}", self.path.display(), e)))?;
        Ok(Some(state))
    }

    /// Overwrite the record atomically
    pub fn save(&self, state: &SendState) -> Result<()> {
        self.write(state)
            .map_err(|e| Error::Persistence(format!("{}: {}", self.path.display(), e)))
    }

    fn write(&self, state: &SendState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Write to temp file in same directory (for atomic rename)
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut temp = NamedTempFile::new_in(parent)?;

        let json = serde_json::to_string_pretty(state)?;
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;

        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        Ok(())
    }
}
