//! Persistence of the tracked project list.
//!
//! Sessions are stored as an ordered JSON array of records in the config
//! directory. Only what is needed to recreate a session is kept; runtime
//! state (process, screen, attention) is never persisted.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::SessionPersistence;

/// One tracked project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Project directory
    pub path: PathBuf,
    /// Display name
    pub name: String,
    /// When the project was first added
    pub added_at: DateTime<Utc>,
    /// Extra launch arguments for this project only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
}

/// JSON file store for session records.
pub struct JsonSessionStore {
    /// Path to the sessions file
    path: PathBuf,
}

impl JsonSessionStore {
    /// Store backed by `<config_dir>/claudemux/sessions.json`.
    pub fn open_default() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("claudemux");

        Ok(Self::at(config_dir.join("sessions.json")))
    }

    /// Store backed by an explicit file.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionPersistence for JsonSessionStore {
    fn load(&self) -> Result<Vec<SessionRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read sessions file: {}", self.path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse sessions file: {}", self.path.display()))
    }

    fn save(&self, records: &[SessionRecord]) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content =
            serde_json::to_string_pretty(records).context("Failed to serialize sessions")?;

        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write sessions file: {}", self.path.display()))?;

        Ok(())
    }
}
