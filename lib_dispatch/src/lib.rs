//! # lib_dispatch
//!
//! Client side of the ride dispatch channel: a single STOMP-over-WebSocket
//! link, the topic routes hanging off it, the driver's offer queue, the
//! rider's assignment tracker with its REST polling backstop, and location
//! telemetry. Every module is gated behind a cargo feature (see `Cargo.toml`);
//! `full` turns all of them on.

#![forbid(unsafe_code)]

#[cfg(any(feature = "transport", feature = "retrieve"))]
pub mod errors;

#[cfg(feature = "transport")]
pub mod transport;

#[cfg(feature = "dispatch")]
pub mod dispatch;

#[cfg(feature = "retrieve")]
pub mod retrieve;

#[cfg(feature = "configs")]
pub mod configs;

#[cfg(feature = "loggers")]
pub mod loggers;

// --- Public API Re-exports ---
#[cfg(any(feature = "transport", feature = "retrieve"))]
pub use errors::*;
