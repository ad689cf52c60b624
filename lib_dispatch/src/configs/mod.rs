//! # Configuration Modules
//!
//! Layered settings for the console clients: built-in defaults, then a JSON
//! file, then environment variables and command-line flags.

/// Client configuration: parsing, merging and conversion into session settings.
pub mod config_client;

pub use config_client::{ClientConfig, load_config, load_config_from};
