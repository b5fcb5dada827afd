//! Error types for the installation pipeline.
//!
//! Every stage failure maps to one of these kinds. A failure terminates only
//! the job it happened in; cancellation is not an error and is modeled by
//! [`Completion::Cancelled`](super::types::Completion).

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the individual pipeline stages.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Network or HTTP failure while fetching an archive.
    #[error("Transfer failed for {url}: {message}")]
    Transfer { url: String, message: String },

    /// The archive is unreadable or corrupt, or unpacking hit an I/O error.
    #[error("Extraction of {archive} failed: {message}")]
    Extract { archive: PathBuf, message: String },

    /// Unexpected filesystem state during layout normalization.
    #[error("Layout normalization in {dir} failed: {source}")]
    Layout {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The persistent search path could not be read or written.
    #[error("Search path registration failed: {0}")]
    Registration(String),

    /// The tool spec cannot be installed as described.
    #[error("Invalid tool spec for {tool}: {message}")]
    InvalidSpec { tool: String, message: String },

    /// The installer itself could not be set up, before any job ran.
    #[error("Installer setup failed: {0}")]
    Setup(String),
}

impl InstallError {
    pub(crate) fn transfer(url: &str, message: impl Into<String>) -> Self {
        Self::Transfer {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn extract(archive: &std::path::Path, message: impl Into<String>) -> Self {
        Self::Extract {
            archive: archive.to_path_buf(),
            message: message.into(),
        }
    }

    /// Short name of the error kind, used in logs and status output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transfer { .. } => "TransferError",
            Self::Extract { .. } => "ExtractError",
            Self::Layout { .. } => "LayoutError",
            Self::Registration(_) => "RegistrationError",
            Self::InvalidSpec { .. } => "InvalidSpec",
            Self::Setup(_) => "SetupError",
        }
    }
}

/// Result alias for pipeline stages.
pub type InstallResult<T> = Result<T, InstallError>;
