//! # Logging
//!
//! `fern` wiring for the `log` facade used across the crate.

/// Console plus single-file logging with rotation on start-up.
pub mod logger;

pub use logger::{cleanup_old_logs, parse_level, setup_logging};
