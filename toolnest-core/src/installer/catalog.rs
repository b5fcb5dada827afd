//! Tool catalog.
//!
//! The engine is parametric over the catalog: it is loaded from a JSON file
//! at startup, with a built-in default set of embedded development tools.
//!
//! Catalog file format:
//!
//! ```json
//! {
//!   "tools": [
//!     { "name": "CMake", "url": "https://.../cmake-4.0.1-windows-x86_64.zip",
//!       "bin_subdir": "bin", "single_executable": false,
//!       "description": "Cross-platform build tool", "version": "4.0.1" }
//!   ]
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

use super::types::ToolSpec;

/// On-disk catalog document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    /// Tools in installation order.
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

// ============================================================================
// Built-in Catalog
// ============================================================================

/// Returns the built-in catalog of embedded development tools.
pub fn builtin_catalog() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "Clangd".to_string(),
            url: "https://github.com/clangd/clangd/releases/download/20.1.0/clangd-windows-20.1.0.zip"
                .to_string(),
            bin_subdir: "bin".to_string(),
            single_executable: false,
            description: "C/C++ language server with completion and diagnostics".to_string(),
            version: "20.1.0".to_string(),
        },
        ToolSpec {
            name: "ARM-GCC".to_string(),
            url: "https://developer.arm.com/-/media/Files/downloads/gnu/14.2.rel1/binrel/arm-gnu-toolchain-14.2.rel1-mingw-w64-x86_64-arm-none-eabi.zip"
                .to_string(),
            bin_subdir: "bin".to_string(),
            single_executable: false,
            description: "GCC toolchain for ARM targets".to_string(),
            version: "14.2.rel1".to_string(),
        },
        ToolSpec {
            name: "CMake".to_string(),
            url: "https://github.com/Kitware/CMake/releases/download/v4.0.1/cmake-4.0.1-windows-x86_64.zip"
                .to_string(),
            bin_subdir: "bin".to_string(),
            single_executable: false,
            description: "Cross-platform build system generator".to_string(),
            version: "4.0.1".to_string(),
        },
        ToolSpec {
            name: "Ninja".to_string(),
            url: "https://github.com/ninja-build/ninja/releases/download/v1.12.1/ninja-win.zip"
                .to_string(),
            bin_subdir: String::new(),
            single_executable: true,
            description: "Small build system focused on speed".to_string(),
            version: "1.12.1".to_string(),
        },
        ToolSpec {
            name: "OpenOCD".to_string(),
            url: "https://github.com/xpack-dev-tools/openocd-xpack/releases/download/v0.12.0-6/xpack-openocd-0.12.0-6-win32-x64.zip"
                .to_string(),
            bin_subdir: "bin".to_string(),
            single_executable: false,
            description: "On-chip debugger for programming and debugging embedded devices"
                .to_string(),
            version: "0.12.0-6".to_string(),
        },
    ]
}

// ============================================================================
// Loading
// ============================================================================

/// Loads and validates a catalog from a JSON file.
pub fn load_catalog_from(path: &Path) -> Result<Vec<ToolSpec>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog from {}", path.display()))?;
    let tools = parse_catalog(&content)
        .with_context(|| format!("Invalid catalog {}", path.display()))?;
    debug!("Loaded {} tools from {}", tools.len(), path.display());
    Ok(tools)
}

/// Parses and validates a catalog document.
pub fn parse_catalog(content: &str) -> Result<Vec<ToolSpec>> {
    let file: CatalogFile = serde_json::from_str(content).context("Failed to parse catalog")?;
    validate_catalog(&file.tools)?;
    Ok(file.tools)
}

/// Checks names are unique and non-empty and URLs point at supported archives.
pub fn validate_catalog(tools: &[ToolSpec]) -> Result<()> {
    let mut seen = HashSet::new();

    for tool in tools {
        if tool.name.trim().is_empty() {
            anyhow::bail!("Catalog entry with URL {} has no name", tool.url);
        }
        if !seen.insert(tool.name.as_str()) {
            anyhow::bail!("Duplicate tool name in catalog: {}", tool.name);
        }
        if tool.archive_format().is_none() {
            anyhow::bail!(
                "{}: unsupported archive type in URL {}",
                tool.name,
                tool.url
            );
        }
    }

    Ok(())
}

/// Keeps only the tools named in `names` (case-insensitive), in catalog order.
///
/// An empty filter keeps everything. Unknown names are an error.
pub fn select_tools(catalog: &[ToolSpec], names: &[String]) -> Result<Vec<ToolSpec>> {
    if names.is_empty() {
        return Ok(catalog.to_vec());
    }

    for name in names {
        if !catalog.iter().any(|t| t.name.eq_ignore_ascii_case(name)) {
            anyhow::bail!("Unknown tool: {}", name);
        }
    }

    Ok(catalog
        .iter()
        .filter(|t| names.iter().any(|n| t.name.eq_ignore_ascii_case(n)))
        .cloned()
        .collect())
}
