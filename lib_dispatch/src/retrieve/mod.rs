//! # Data Retrieval Module
//!
//! The REST side of the dispatch client. Ride creation always goes through
//! here, and so does the polling backstop that keeps a ride moving when push
//! delivery over the STOMP link silently stops.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: A generic HTTP `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, featuring automatic retries with exponential
//!   backoff and bearer-token injection.
//! - **`dispatch_api`**: The `DispatchApi` trait the sessions consume and
//!   its `RestDispatchApi` implementation.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with retry middleware for resilient network requests.
pub mod ky_http;

/// Typed dispatch REST endpoints.
#[cfg(feature = "dispatch")]
pub mod dispatch_api;

// --- Public API Re-exports ---
pub use ky_http::{ApiClient, ApiResponse};
#[cfg(feature = "dispatch")]
pub use dispatch_api::{DispatchApi, RestDispatchApi};
