//! Filesystem layout for installed tools.
//!
//! Every tool lands under a target root directory:
//!
//! - `<root>/<archive-filename>`: the downloaded archive
//! - `<root>/<archive-stem>/`: the extraction root
//! - `<root>/manifest.json`: record of completed installs
//!
//! The archive filename is the last path segment of the tool URL, and the
//! stem is that filename with the archive extension stripped.

use std::path::{Path, PathBuf};
use tracing::info;
use url::Url;

use super::error::{InstallError, InstallResult};
use super::types::{ArchiveFormat, ToolSpec};

/// Subdirectory name used for the default target root.
const TOOLNEST_DIR: &str = "toolnest";

/// File name of the install manifest inside the target root.
const MANIFEST_FILE: &str = "manifest.json";

// ============================================================================
// Path Resolution
// ============================================================================

/// Returns the default target root.
///
/// Path: `{data_local_dir}/toolnest/tools/`, falling back to the OS temp
/// directory when no per-user data directory is known.
pub fn default_target_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(TOOLNEST_DIR)
        .join("tools")
}

/// Returns the path to the install manifest for a target root.
pub fn manifest_path(target_root: &Path) -> PathBuf {
    target_root.join(MANIFEST_FILE)
}

/// Derives the archive filename from the last path segment of a URL.
pub fn archive_file_name(url: &str) -> InstallResult<String> {
    let parsed =
        Url::parse(url).map_err(|e| InstallError::transfer(url, format!("Invalid URL: {}", e)))?;

    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(|name| name.to_string())
        .ok_or_else(|| InstallError::transfer(url, "URL has no file name"))
}

/// Resolved on-disk locations for one tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    /// Where the archive is downloaded to.
    pub archive: PathBuf,
    /// Extraction root for the tool.
    pub install_dir: PathBuf,
    /// Archive format inferred from the URL.
    pub format: ArchiveFormat,
}

impl ToolPaths {
    /// Resolves the archive and extraction paths of `spec` under `target_root`.
    pub fn for_tool(spec: &ToolSpec, target_root: &Path) -> InstallResult<Self> {
        let file_name = archive_file_name(&spec.url)?;
        let format =
            ArchiveFormat::from_url(&file_name).ok_or_else(|| InstallError::InvalidSpec {
                tool: spec.name.clone(),
                message: format!("Unsupported archive type: {}", file_name),
            })?;
        let stem = format.strip_extension(&file_name).to_string();

        Ok(Self {
            archive: target_root.join(&file_name),
            install_dir: target_root.join(stem),
            format,
        })
    }
}

// ============================================================================
// Existing Archives
// ============================================================================

/// An archive already present in the target root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingArchive {
    pub tool: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Lists the tools whose archive has already been downloaded.
///
/// Tools whose URL cannot be mapped to a file are skipped; they fail later
/// when their pipeline runs.
pub fn scan_existing_archives(tools: &[ToolSpec], target_root: &Path) -> Vec<ExistingArchive> {
    let mut found = Vec::new();

    for spec in tools {
        let Ok(paths) = ToolPaths::for_tool(spec, target_root) else {
            continue;
        };
        let Ok(metadata) = std::fs::metadata(&paths.archive) else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        info!(
            "Found existing archive for {}: {} ({})",
            spec.name,
            paths.archive.display(),
            format_size(metadata.len())
        );
        found.push(ExistingArchive {
            tool: spec.name.clone(),
            path: paths.archive,
            size_bytes: metadata.len(),
        });
    }

    found
}

/// Formats a byte count in B, KB, MB or GB with one decimal place.
pub fn format_size(size_bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size_bytes < KB {
        format!("{} B", size_bytes)
    } else if size_bytes < MB {
        format!("{:.1} KB", size_bytes as f64 / KB as f64)
    } else if size_bytes < GB {
        format!("{:.1} MB", size_bytes as f64 / MB as f64)
    } else {
        format!("{:.1} GB", size_bytes as f64 / GB as f64)
    }
}
