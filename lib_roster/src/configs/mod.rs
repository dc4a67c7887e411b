//! # Configuration Modules
//!
//! Layered settings for the roster tools and their resolution into the typed
//! configs of the core.

/// Defaults < JSON file < env/CLI, merged field by field.
pub mod settings;

pub use settings::{load_settings, read_settings_file, Settings, DEFAULT_CONFIG_FILE};
