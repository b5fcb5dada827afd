//! Install manifest persistence.
//!
//! This module handles reading and writing the `manifest.json` file that
//! records which tools completed installation into a target root, with
//! their version and registered binary directory.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Current schema version for the manifest file.
const SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Manifest Data Structures
// ============================================================================

/// Information about a single installed tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledToolInfo {
    /// Installed version string.
    pub version: String,
    /// When the install completed.
    pub installed_at: DateTime<Utc>,
    /// Size of the downloaded archive in bytes.
    pub archive_size_bytes: u64,
    /// Directory that was registered on the search path.
    pub bin_dir: PathBuf,
}

/// Root structure for the manifest file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsManifest {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// Map of tool name to installation info.
    #[serde(default)]
    pub tools: BTreeMap<String, InstalledToolInfo>,
}

impl Default for ToolsManifest {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            tools: BTreeMap::new(),
        }
    }
}

impl ToolsManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_installed(&self, tool: &str) -> bool {
        self.tools.contains_key(tool)
    }

    pub fn get_tool(&self, tool: &str) -> Option<&InstalledToolInfo> {
        self.tools.get(tool)
    }

    /// Records a tool as installed, replacing any earlier record.
    pub fn mark_installed(
        &mut self,
        tool: &str,
        version: String,
        archive_size_bytes: u64,
        bin_dir: PathBuf,
    ) {
        let info = InstalledToolInfo {
            version,
            installed_at: Utc::now(),
            archive_size_bytes,
            bin_dir,
        };
        self.tools.insert(tool.to_string(), info);
    }

    /// Total size of all recorded archives in bytes.
    pub fn total_size_bytes(&self) -> u64 {
        self.tools.values().map(|info| info.archive_size_bytes).sum()
    }
}

// ============================================================================
// Manifest Persistence
// ============================================================================

/// Loads the manifest from `path`.
///
/// If the manifest doesn't exist, returns a new empty manifest.
/// If the manifest exists but is corrupted, logs a warning and returns empty.
pub fn load_manifest_from(path: &Path) -> Result<ToolsManifest> {
    if !path.exists() {
        debug!("Manifest not found at {}, creating new", path.display());
        return Ok(ToolsManifest::new());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest from {}", path.display()))?;

    match serde_json::from_str::<ToolsManifest>(&content) {
        Ok(mut manifest) => {
            if manifest.schema_version != SCHEMA_VERSION {
                info!(
                    "Manifest schema version {} differs from current {}, migrating",
                    manifest.schema_version, SCHEMA_VERSION
                );
                manifest.schema_version = SCHEMA_VERSION;
            }
            Ok(manifest)
        }
        Err(e) => {
            warn!(
                "Failed to parse manifest at {}: {}. Starting fresh.",
                path.display(),
                e
            );
            Ok(ToolsManifest::new())
        }
    }
}

/// Saves the manifest to `path`, creating parent directories.
pub fn save_manifest_to(manifest: &ToolsManifest, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create manifest directory: {}", parent.display())
        })?;
    }

    let content = serde_json::to_string_pretty(manifest).context("Failed to serialize manifest")?;

    fs::write(path, content)
        .with_context(|| format!("Failed to write manifest to {}", path.display()))?;

    debug!("Manifest saved to {}", path.display());
    Ok(())
}
