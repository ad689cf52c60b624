//! # Error Taxonomy
//!
//! One `thiserror` enum per failure family. None of these is ever fatal:
//! connection errors travel as lifecycle events, parse errors are logged and
//! the message dropped, state conflicts are logged no-ops, and only publish
//! and REST failures can end up as a user notice.

#[cfg(feature = "transport")]
use std::time::Duration;

use thiserror::Error;

/// The link to the dispatch server could not be established or was lost.
#[cfg(feature = "transport")]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("dispatch server unreachable: {0}")]
    Unreachable(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("no CONNECTED frame within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("server sent ERROR: {0}")]
    Server(String),

    #[error("connection closed")]
    Closed,
}

/// A STOMP frame could not be decoded.
#[cfg(feature = "transport")]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("malformed header line '{0}'")]
    MalformedHeader(String),

    #[error("invalid escape sequence in '{0}'")]
    InvalidEscape(String),

    #[error("missing blank line between headers and body")]
    MissingBody,

    #[error("content-length {declared} exceeds body of {actual} bytes")]
    Truncated { declared: usize, actual: usize },
}

/// An inbound message could not be turned into a dispatch event.
#[cfg(feature = "dispatch")]
#[derive(Debug, Error)]
pub enum MessageParseError {
    #[error("frame without destination header")]
    MissingDestination,

    #[error("payload on '{topic}' is not valid: {source}")]
    Payload {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

/// An outbound frame could not be handed to the socket.
#[cfg(feature = "transport")]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("not connected")]
    NotConnected,

    #[error("socket writer is gone")]
    ChannelClosed,

    #[error("could not encode payload: {0}")]
    Encode(String),
}

/// A driver or server action arrived for state that has already moved on.
#[cfg(feature = "dispatch")]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateConflict {
    #[error("ride {ride_id} is not the offer currently shown")]
    NotShown { ride_id: i64 },

    #[error("driver is on ride {active}; offer {ride_id} refused")]
    DriverBusy { ride_id: i64, active: i64 },

    #[error("ride {ride_id} is already queued")]
    Duplicate { ride_id: i64 },

    #[error("no active ride")]
    NoActiveRide,

    #[error("cannot {action} while ride is {phase}")]
    InvalidPhase { action: &'static str, phase: &'static str },
}

/// A location sample could not be delivered. Never retried; the next tick
/// supersedes it.
#[cfg(feature = "dispatch")]
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("sink cannot deliver samples about {0}")]
    UnsupportedSubject(String),
}

/// Outcome of a REST call that did not produce the expected body.
#[cfg(feature = "retrieve")]
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("session expired or unauthorized ({status})")]
    Unauthorized { status: u16 },

    #[error("request rejected ({status}): {body}")]
    Client { status: u16, body: String },

    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("response without body")]
    MissingBody,

    #[error("unexpected response body: {0}")]
    Decode(String),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

#[cfg(feature = "retrieve")]
impl ApiError {
    /// Maps a non-2xx status and its raw body onto the taxonomy.
    pub fn from_status(status: u16, body: Option<String>) -> Self {
        let body = body.unwrap_or_default();
        match status {
            401 | 403 => ApiError::Unauthorized { status },
            400..=499 => ApiError::Client { status, body },
            _ => ApiError::Server { status, body },
        }
    }

    /// True when the caller should treat the session as expired.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }
}
