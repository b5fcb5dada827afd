//! Toolnest Core Library
//!
//! This crate provides the installation engine behind the `toolnest` CLI.
//! It includes:
//!
//! - A tool catalog (built-in or loaded from JSON)
//! - Streaming downloads with retry and cancellation
//! - Archive extraction with per-entry progress
//! - Layout normalization of extracted archives
//! - Registration of tool directories on the user search path
//! - A concurrent orchestrator reporting progress events
//! - Configuration management (settings)

pub mod config;
pub mod installer;

// Re-exports for convenience
pub use config::{PathStoreKind, Settings};

pub use installer::{
    builtin_catalog, event_channel, load_catalog_from, EventReceiver, EventSender, InstallError,
    InstallEvent, InstallJob, InstallOrchestrator, RunSummary, Stage, ToolSpec,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
