//! # Transport Module
//!
//! Everything between the dispatch logic and the wire. The link to the
//! dispatch server is a STOMP 1.2 session carried over a WebSocket; this
//! module speaks that protocol and owns the lifecycle of the single link a
//! session is allowed to have.
//!
//! ## Contained Modules:
//! - **`frame`**: STOMP frame encoding/decoding.
//! - **`socket`**: the `Connector` seam and the tokio-tungstenite backed
//!   `WsConnector` that pumps text frames in a background task.
//! - **`connection`**: connect/handshake/disconnect, status and lifecycle
//!   events, and the weak `Publisher` handle used for outbound frames.
//! - **`registry`**: topic subscriptions and inbound routing.
//! - **`loopback`**: an in-process broker implementing `Connector`.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// STOMP 1.2 text frame codec.
pub mod frame;
/// Socket abstraction and the WebSocket connector.
pub mod socket;
/// The single authenticated link and its lifecycle.
pub mod connection;
/// Topic subscriptions and message routing.
pub mod registry;
/// In-process STOMP broker for offline runs and tests.
#[cfg(feature = "loopback")]
pub mod loopback;

// --- Public API Re-exports ---
pub use connection::{
    Connection, ConnectionStatus, LifecycleEvent, Outbound, Publisher, TransportEvent,
};
pub use frame::{Command, Frame};
pub use registry::{Registry, Subscription};
pub use socket::{Connector, Socket, SocketEvent, WsConnector};
#[cfg(feature = "loopback")]
pub use loopback::LoopbackBroker;
