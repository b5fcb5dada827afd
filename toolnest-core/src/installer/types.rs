//! Core types for the installation pipeline.
//!
//! This module defines the foundational types used across the installer:
//! tool specifications, archive formats, pipeline stages, the per-tool job
//! record and the stage-weighted progress model.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Tool Specification
// ============================================================================

/// Immutable description of one downloadable tool.
///
/// Tool specs come from the catalog and are never modified by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique key of the tool (e.g. "CMake").
    pub name: String,
    /// Download URL of the archive.
    pub url: String,
    /// Relative path of the binary directory inside the install root.
    #[serde(default)]
    pub bin_subdir: String,
    /// The archive holds a single executable; no binary subdirectory applies.
    #[serde(default)]
    pub single_executable: bool,
    /// Human-readable description (opaque to the engine).
    #[serde(default)]
    pub description: String,
    /// Display version (opaque to the engine).
    #[serde(default)]
    pub version: String,
}

impl ToolSpec {
    /// Creates a tool spec with empty description and version.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        bin_subdir: impl Into<String>,
        single_executable: bool,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            bin_subdir: bin_subdir.into(),
            single_executable,
            description: String::new(),
            version: String::new(),
        }
    }

    /// Returns the archive format inferred from the URL.
    pub fn archive_format(&self) -> Option<ArchiveFormat> {
        ArchiveFormat::from_url(&self.url)
    }
}

// ============================================================================
// Archive Format
// ============================================================================

/// Archive format for downloaded tool packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    /// ZIP archive (.zip)
    Zip,
    /// Gzip-compressed tar archive (.tar.gz, .tgz)
    TarGz,
    /// XZ-compressed tar archive (.tar.xz)
    TarXz,
}

impl ArchiveFormat {
    /// Infers the archive format from a URL or filename.
    ///
    /// Query strings and fragments are ignored.
    pub fn from_url(url: &str) -> Option<Self> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let lower = path.to_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar.xz") {
            Some(Self::TarXz)
        } else {
            None
        }
    }

    /// Returns the file extensions recognized for this format, longest first.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Zip => &[".zip"],
            Self::TarGz => &[".tar.gz", ".tgz"],
            Self::TarXz => &[".tar.xz"],
        }
    }

    /// Strips this format's extension from a file name.
    ///
    /// The match is case-insensitive; the name is returned unchanged when no
    /// extension matches.
    pub fn strip_extension<'a>(&self, file_name: &'a str) -> &'a str {
        for ext in self.extensions() {
            if file_name.len() <= ext.len() {
                continue;
            }
            let cut = file_name.len() - ext.len();
            if file_name.is_char_boundary(cut) && file_name[cut..].eq_ignore_ascii_case(ext) {
                return &file_name[..cut];
            }
        }
        file_name
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zip => write!(f, "zip"),
            Self::TarGz => write!(f, "tar.gz"),
            Self::TarXz => write!(f, "tar.xz"),
        }
    }
}

// ============================================================================
// Stages
// ============================================================================

/// A step of the installation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Pending,
    Downloading,
    Extracting,
    Normalizing,
    Registering,
    Completed,
    Failed,
    Cancelled,
}

impl Stage {
    /// Position in the forward pipeline order; `None` for Failed/Cancelled.
    fn ordinal(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Downloading => Some(1),
            Self::Extracting => Some(2),
            Self::Normalizing => Some(3),
            Self::Registering => Some(4),
            Self::Completed => Some(5),
            Self::Failed | Self::Cancelled => None,
        }
    }

    /// Returns true for Completed, Failed and Cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if a job in this stage may move to `next`.
    ///
    /// Forward moves go one step at a time. Failed and Cancelled are
    /// reachable from every non-terminal stage.
    pub fn can_transition_to(&self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.ordinal(), next.ordinal()) {
            (_, None) => true,
            (Some(current), Some(target)) => target == current + 1,
            (None, Some(_)) => false,
        }
    }

    /// Human-readable label used in status output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Extracting => "extracting",
            Self::Normalizing => "normalizing",
            Self::Registering => "registering",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

// ============================================================================
// Progress Model
// ============================================================================

/// Maps a stage-local fraction (0.0 to 1.0) to the overall 0 to 100 scale.
///
/// Downloading covers 0-33, Extracting 33-66 and Registering 66-100.
/// Normalizing carries no weight of its own.
pub fn overall_percent(stage: Stage, fraction: f64) -> f64 {
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    match stage {
        Stage::Pending => 0.0,
        Stage::Downloading => 33.0 * fraction,
        Stage::Extracting => 33.0 + 33.0 * fraction,
        Stage::Normalizing => 66.0,
        Stage::Registering => 66.0 + 34.0 * fraction,
        Stage::Completed => 100.0,
        Stage::Failed | Stage::Cancelled => 0.0,
    }
}

/// Outcome of a stage that can be interrupted by the user.
///
/// Cancellation is an expected result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T> {
    Finished(T),
    Cancelled,
}

impl<T> Completion<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// ============================================================================
// Install Job
// ============================================================================

/// Error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    /// Stage the job was in when it failed.
    pub stage: Stage,
    /// Rendered error chain.
    pub message: String,
}

/// Per-tool record of one pipeline run.
#[derive(Debug, Clone)]
pub struct InstallJob {
    /// Name of the tool being installed.
    pub tool: String,
    stage: Stage,
    download: f64,
    extract: f64,
    register: f64,
    overall: f64,
    error: Option<FailureRecord>,
}

impl InstallJob {
    /// Creates a job in the Pending stage.
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            stage: Stage::Pending,
            download: 0.0,
            extract: 0.0,
            register: 0.0,
            overall: 0.0,
            error: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Overall progress in percent (0 to 100).
    pub fn overall(&self) -> f64 {
        self.overall
    }

    /// Progress of a single stage (0.0 to 1.0).
    pub fn stage_progress(&self, stage: Stage) -> f64 {
        match stage {
            Stage::Downloading => self.download,
            Stage::Extracting => self.extract,
            Stage::Registering => self.register,
            Stage::Completed => 1.0,
            _ => 0.0,
        }
    }

    pub fn error(&self) -> Option<&FailureRecord> {
        self.error.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Moves the job to `next`. Illegal transitions are refused and return false.
    pub fn transition(&mut self, next: Stage) -> bool {
        if !self.stage.can_transition_to(next) {
            return false;
        }
        self.stage = next;
        if next == Stage::Completed {
            self.overall = 100.0;
        } else {
            self.bump_overall(overall_percent(next, 0.0));
        }
        true
    }

    /// Records stage-local progress and returns the new overall percentage.
    ///
    /// Updates for a stage other than the current one are ignored. Overall
    /// progress never decreases.
    pub fn record_progress(&mut self, stage: Stage, fraction: f64) -> f64 {
        if stage != self.stage {
            return self.overall;
        }
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let slot = match stage {
            Stage::Downloading => &mut self.download,
            Stage::Extracting => &mut self.extract,
            Stage::Registering => &mut self.register,
            _ => return self.overall,
        };
        if fraction > *slot {
            *slot = fraction;
        }
        self.bump_overall(overall_percent(stage, fraction));
        self.overall
    }

    /// Marks the job failed, remembering the stage it failed in.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        let stage = self.stage;
        if !self.transition(Stage::Failed) {
            return false;
        }
        self.error = Some(FailureRecord {
            stage,
            message: message.into(),
        });
        true
    }

    fn bump_overall(&mut self, value: f64) {
        if value > self.overall {
            self.overall = value.min(100.0);
        }
    }
}
