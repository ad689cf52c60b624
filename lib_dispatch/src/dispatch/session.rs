//! # Session Context
//!
//! What a driver or rider session owns: the one connection, its subscription
//! registry, the REST boundary, the session store and the UI event stream.
//! Sessions are explicit objects driven by a single loop; nothing here is
//! global.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::dispatch::active_ride::{ActiveRide, RidePhase};
use crate::dispatch::model::RideCard;
use crate::dispatch::offers::RideOffer;
use crate::dispatch::tracker::RideRequest;
use crate::errors::{ApiError, MessageParseError};
use crate::retrieve::DispatchApi;
use crate::transport::{
    Connection, ConnectionStatus, Connector, Frame, LifecycleEvent, Registry, TransportEvent,
};

/// Identity of the signed-in user, supplied by the host application.
pub trait SessionStore: Send + Sync {
    fn token(&self) -> Option<String>;
    fn user_id(&self) -> Option<i64>;
    fn driver_id(&self) -> Option<i64>;
    /// Remembers the driver id once it has been resolved over REST.
    fn set_driver_id(&self, driver_id: i64);
}

/// A store holding fixed credentials, as read from configuration.
#[derive(Debug, Default)]
pub struct StaticSession {
    token: Option<String>,
    user_id: Option<i64>,
    driver_id: Mutex<Option<i64>>,
}

impl StaticSession {
    pub fn new(token: Option<String>, user_id: Option<i64>, driver_id: Option<i64>) -> Self {
        Self {
            token,
            user_id,
            driver_id: Mutex::new(driver_id),
        }
    }
}

impl SessionStore for StaticSession {
    fn token(&self) -> Option<String> {
        self.token.clone().filter(|t| !t.trim().is_empty())
    }

    fn user_id(&self) -> Option<i64> {
        self.user_id
    }

    fn driver_id(&self) -> Option<i64> {
        *self.driver_id.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_driver_id(&self, driver_id: i64) {
        *self.driver_id.lock().unwrap_or_else(|p| p.into_inner()) = Some(driver_id);
    }
}

/// Timing and endpoint knobs for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Base WebSocket endpoint; the socket path and token are appended.
    pub ws_endpoint: String,
    pub handshake_timeout: Duration,
    /// Rider REST poll interval while waiting for assignment.
    pub poll_interval: Duration,
    /// REST location updates while online without a ride.
    pub online_telemetry: Duration,
    /// STOMP location pings during a ride.
    pub ride_telemetry: Duration,
    /// Offers older than this are dropped.
    pub offer_ttl: Duration,
    pub expiry_sweep: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ws_endpoint: "ws://localhost:9090".to_string(),
            handshake_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(3),
            online_telemetry: Duration::from_secs(5),
            ride_telemetry: Duration::from_secs(5),
            offer_ttl: Duration::from_secs(30),
            expiry_sweep: Duration::from_secs(1),
        }
    }
}

/// User-facing failures. Each is shown once and never blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    SessionExpired,
    RideCreationFailed(String),
    OtpInvalid,
    ResponseNotDelivered { ride_id: i64 },
    ConnectionLost(String),
    OnlineStatusFailed(String),
    RideEndFailed(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::SessionExpired => write!(f, "Session expired, please sign in again"),
            Notice::RideCreationFailed(why) => write!(f, "Failed to create ride: {}", why),
            Notice::OtpInvalid => write!(f, "Invalid OTP"),
            Notice::ResponseNotDelivered { ride_id } => {
                write!(f, "Response for ride {} could not be delivered", ride_id)
            }
            Notice::ConnectionLost(why) => write!(f, "Connection lost: {}", why),
            Notice::OnlineStatusFailed(why) => write!(f, "Could not change online status: {}", why),
            Notice::RideEndFailed(why) => write!(f, "Could not end ride: {}", why),
        }
    }
}

/// Everything a front-end needs to render, as one tagged stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Connection(LifecycleEvent),
    OnlineChanged(bool),
    OfferShown(RideOffer),
    OfferCleared,
    RideAccepted(ActiveRide),
    RidePhaseChanged { ride_id: i64, phase: RidePhase },
    /// The driver's active ride was cancelled by the server.
    RideCancelled { ride_id: i64 },
    RideRequested(RideRequest),
    RideCardShown(RideCard),
    /// The rider's ride was cancelled by the server.
    AssignmentCancelled { ride_id: i64, reason: Option<String> },
    Notice(Notice),
}

/// Sending half of the UI stream. A front-end that went away is not an error.
#[derive(Debug, Clone)]
pub struct UiSink {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl UiSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("UI event dropped: no listener");
        }
    }

    pub fn notice(&self, notice: Notice) {
        log::warn!("Notice: {}", notice);
        self.emit(UiEvent::Notice(notice));
    }
}

/// Resources shared by both session roles. `R` is the role's route type.
pub struct SessionContext<C: Connector, A: DispatchApi, R: Clone> {
    pub(crate) connection: Connection<C>,
    pub(crate) registry: Registry<R>,
    pub(crate) transport: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    pub(crate) api: Arc<A>,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) ui: UiSink,
    pub(crate) settings: SessionSettings,
}

impl<C: Connector, A: DispatchApi, R: Clone> SessionContext<C, A, R> {
    pub fn new(
        connector: C,
        api: Arc<A>,
        store: Arc<dyn SessionStore>,
        settings: SessionSettings,
        ui: UiSink,
    ) -> Self {
        let (connection, transport) = Connection::new(connector, settings.handshake_timeout);
        Self {
            connection,
            registry: Registry::new(),
            transport: Some(transport),
            api,
            store,
            ui,
            settings,
        }
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn sockets_opened(&self) -> usize {
        self.connection.sockets_opened()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// The bearer token, or a SessionExpired notice.
    pub(crate) fn require_token(&self) -> Option<String> {
        let token = self.store.token();
        if token.is_none() {
            self.ui.notice(Notice::SessionExpired);
        }
        token
    }

    /// Brings the link up if it is down and replays subscriptions on a fresh
    /// link. Returns whether the link is up afterwards.
    pub(crate) async fn ensure_connected(&mut self, token: &str) -> bool {
        if self.connection.is_connected() {
            return true;
        }
        let endpoint = self.settings.ws_endpoint.clone();
        self.connection.connect(&endpoint, token).await;
        if self.connection.is_connected() {
            self.registry.attach(self.connection.publisher());
            true
        } else {
            log::warn!("Continuing without a live link; REST only");
            false
        }
    }

    /// Records lifecycle changes and forwards them to the UI.
    pub(crate) fn on_lifecycle(&mut self, event: LifecycleEvent) {
        match &event {
            LifecycleEvent::Opened => {}
            LifecycleEvent::Closed | LifecycleEvent::Error(_) => {
                let was_up = self.connection.is_connected();
                self.connection.mark_down(&event);
                self.registry.detach();
                if was_up {
                    let why = match &event {
                        LifecycleEvent::Error(e) => e.to_string(),
                        _ => "closed by server".to_string(),
                    };
                    self.ui.notice(Notice::ConnectionLost(why));
                }
            }
        }
        self.ui.emit(UiEvent::Connection(event));
    }

    /// Maps a REST failure to the notice it deserves.
    pub(crate) fn api_notice(&self, err: &ApiError, otherwise: impl FnOnce(String) -> Notice) {
        if err.is_unauthorized() {
            self.ui.notice(Notice::SessionExpired);
        } else {
            self.ui.notice(otherwise(err.to_string()));
        }
    }

    /// Drops every subscription and closes the link.
    pub(crate) fn teardown(&mut self) {
        self.registry.release();
        self.connection.disconnect();
    }
}

/// Decodes the JSON body of a routed MESSAGE.
pub(crate) fn decode_body<T: DeserializeOwned>(frame: &Frame) -> Result<T, MessageParseError> {
    let topic = frame
        .destination()
        .ok_or(MessageParseError::MissingDestination)?;
    serde_json::from_str(&frame.body).map_err(|source| MessageParseError::Payload {
        topic: topic.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::model::RideOfferPayload;
    use crate::transport::Command;

    #[test]
    fn blank_token_counts_as_signed_out() {
        let store = StaticSession::new(Some("  ".into()), Some(1), None);
        assert_eq!(store.token(), None);
    }

    #[test]
    fn driver_id_is_remembered() {
        let store = StaticSession::new(Some("t".into()), Some(5), None);
        assert_eq!(store.driver_id(), None);
        store.set_driver_id(17);
        assert_eq!(store.driver_id(), Some(17));
    }

    #[test]
    fn malformed_payload_names_its_topic() {
        let frame = Frame::new(Command::Message)
            .header("destination", "/user/queue/ride-request")
            .with_body("{\"rideId\":");
        let err = decode_body::<RideOfferPayload>(&frame).unwrap_err();
        assert!(err.to_string().contains("/user/queue/ride-request"));

        let no_dest = Frame::new(Command::Message).with_body("{}");
        assert!(matches!(
            decode_body::<RideOfferPayload>(&no_dest),
            Err(MessageParseError::MissingDestination)
        ));
    }

    #[test]
    fn notices_read_like_toasts() {
        assert_eq!(Notice::OtpInvalid.to_string(), "Invalid OTP");
        assert_eq!(
            Notice::ResponseNotDelivered { ride_id: 7 }.to_string(),
            "Response for ride 7 could not be delivered"
        );
    }
}
