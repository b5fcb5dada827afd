//! Installer settings for Toolnest.
//!
//! Settings are persisted as JSON at `{config_dir}/toolnest/settings.json`.
//! Every field has a default, so a partial file is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::installer::paths::default_target_root;

// =============================================================================
// Path Store Selection
// =============================================================================

/// Where tool directories get registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PathStoreKind {
    /// The persistent user search path of the host platform
    #[default]
    System,
    /// An in-process store that is discarded on exit (dry runs)
    Memory,
}

impl std::fmt::Display for PathStoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

// =============================================================================
// Installer Settings
// =============================================================================

/// Installer settings - persisted to disk as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory tools are installed into. `None` uses the per-user data dir.
    pub target_root: Option<PathBuf>,

    /// Catalog JSON file. `None` uses the built-in catalog.
    pub catalog_path: Option<PathBuf>,

    /// Download attempts per tool, including the first.
    pub max_attempts: u32,

    /// Wait before the first download retry, in milliseconds.
    pub backoff_base_ms: u64,

    /// Per-request HTTP timeout, in seconds.
    pub request_timeout_secs: u64,

    /// Skip search path entries that are already present.
    pub dedupe_path_entries: bool,

    /// Search path backend.
    pub path_store: PathStoreKind,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_root: None,
            catalog_path: None,
            max_attempts: 3,
            backoff_base_ms: 1000,
            request_timeout_secs: 30,
            dedupe_path_entries: true,
            path_store: PathStoreKind::default(),
        }
    }
}

impl Settings {
    /// Default location of the settings file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("toolnest").join("settings.json"))
    }

    /// Load settings from the default location, using defaults if absent.
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::debug!("No config directory known, using default settings");
                Self::default()
            }
        }
    }

    /// Load settings from `path`.
    ///
    /// If the file doesn't exist or can't be parsed, returns defaults.
    pub fn load_from(path: &Path) -> Self {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str::<Settings>(&json) {
                Ok(loaded) => loaded,
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "Failed to parse settings, using defaults");
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "Failed to read settings, using defaults");
                Self::default()
            }
        };

        settings.validate();
        settings
    }

    /// Save settings to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;
        Ok(())
    }

    /// Validate and clamp settings to valid ranges.
    pub fn validate(&mut self) {
        self.max_attempts = self.max_attempts.clamp(1, 10);
        self.backoff_base_ms = self.backoff_base_ms.min(60_000);
        self.request_timeout_secs = self.request_timeout_secs.clamp(1, 600);
    }

    /// The effective install directory.
    pub fn target_root(&self) -> PathBuf {
        self.target_root
            .clone()
            .unwrap_or_else(default_target_root)
    }
}
