//! Configuration module for Toolnest.
//!
//! Manages installer settings stored as JSON in the user's config directory.

mod settings;

pub use settings::{PathStoreKind, Settings};
