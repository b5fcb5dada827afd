//! Tool installation engine.
//!
//! This module downloads tool archives, unpacks them into a normalized
//! layout and registers each tool's binary directory on the persistent user
//! search path. Many tools install in parallel, each in its own pipeline.
//!
//! # Architecture
//!
//! - `types`: Core types (ToolSpec, Stage, InstallJob, progress model)
//! - `error`: Stage error kinds
//! - `paths`: Archive and extraction path derivation
//! - `catalog`: Built-in and JSON-loaded tool catalogs
//! - `manifest`: JSON persistence for installed tool state
//! - `downloader`: Streaming download with retry and cancellation
//! - `extractor`: Archive extraction (zip, tar.gz, tar.xz)
//! - `layout`: Collapsing of a single wrapper directory
//! - `env`: Persistent search path registration
//! - `events`: Event channel for observers
//! - `manager`: The orchestrator that drives all of the above
//!
//! # Example
//!
//! ```ignore
//! use toolnest_core::installer::{builtin_catalog, event_channel, InstallOrchestrator};
//! use toolnest_core::Settings;
//!
//! let settings = Settings::load();
//! let (tx, mut rx) = event_channel();
//! let orchestrator = InstallOrchestrator::from_settings(&settings, tx)?;
//!
//! orchestrator.start_all(&builtin_catalog(), &settings.target_root());
//! while let Some(event) = rx.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

pub mod catalog;
pub mod downloader;
pub mod env;
pub mod error;
pub mod events;
pub mod extractor;
pub mod layout;
pub mod manager;
pub mod manifest;
pub mod paths;
pub mod types;

// Re-export commonly used types
pub use catalog::{builtin_catalog, load_catalog_from, select_tools};
pub use downloader::{
    Downloader, HttpTransport, RetryPolicy, TransferBody, Transport, TransportError,
};
pub use env::{MemoryPathStore, PathRegistrar, PathRegistration, PathStore, ProfilePathStore};
pub use error::{InstallError, InstallResult};
pub use events::{event_channel, EventReceiver, EventSender, InstallEvent, RunSummary};
pub use manager::InstallOrchestrator;
pub use manifest::{load_manifest_from, save_manifest_to, InstalledToolInfo, ToolsManifest};
pub use paths::{default_target_root, format_size, scan_existing_archives, ExistingArchive};
pub use types::{ArchiveFormat, Completion, FailureRecord, InstallJob, Stage, ToolSpec};
