//! Configuration management for claudemux.
//!
//! Handles persistence and loading of launch and detection settings.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// What to run in each session's PTY
    #[serde(default)]
    pub launch: LaunchConfig,

    /// Attention detection tuning
    #[serde(default)]
    pub detection: DetectionConfig,
}

impl Config {
    /// Load configuration from disk, or return default if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate();

        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Clamp every setting into its valid range
    pub fn validate(&mut self) {
        self.launch.validate();
        self.detection.validate();
    }

    /// Get the path to the config file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not find config directory")?;

        Ok(config_dir.join("claudemux").join("config.json"))
    }
}

/// Launch configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Program started in each session
    #[serde(default = "default_command")]
    pub command: String,

    /// Whitespace-separated arguments passed to every session
    #[serde(default)]
    pub global_args: String,

    /// PTY height
    #[serde(default = "default_rows")]
    pub rows: u16,

    /// PTY width
    #[serde(default = "default_cols")]
    pub cols: u16,
}

fn default_command() -> String {
    "claude".to_string()
}

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            global_args: String::new(),
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

impl LaunchConfig {
    pub fn validate(&mut self) {
        if self.command.trim().is_empty() {
            self.command = default_command();
        }
        self.rows = self.rows.max(1);
        self.cols = self.cols.max(1);
    }
}

/// Attention detection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Output quiet time before the screen is scanned (50-5000ms)
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
}

fn default_quiet_period_ms() -> u64 {
    500
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period_ms(),
        }
    }
}

impl DetectionConfig {
    pub fn validate(&mut self) {
        self.quiet_period_ms = self.quiet_period_ms.clamp(50, 5000);
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }
}
