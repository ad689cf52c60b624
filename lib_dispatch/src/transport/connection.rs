//! # Transport Connection
//!
//! Owns the one authenticated STOMP link a session may have. `connect` is a
//! no-op while a link is up or being set up, so callers can invoke it from
//! every role transition without ever opening a second socket. Failures never
//! come back as `Err`: the status moves to `Error` and a `LifecycleEvent`
//! carrying the cause goes out on the transport event stream. Retrying is the
//! caller's decision.
//!
//! Outbound traffic goes through `Publisher`, which only holds a weak
//! reference to the link. Dropping the `Connection` (or disconnecting) makes
//! every outstanding publisher fail fast with `PublishError::NotConnected`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::{ConnectionError, PublishError};
use crate::transport::frame::{Command, Frame};
use crate::transport::socket::{Connector, Socket, SocketEvent};

/// Observable state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Lifecycle notifications, mirrored from the STOMP session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Opened,
    Closed,
    Error(ConnectionError),
}

/// Everything the transport hands to the session's dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Lifecycle(LifecycleEvent),
    Frame(Frame),
}

/// The live half of an established link.
pub(crate) struct Link {
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
}

impl Link {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<String>, shutdown: CancellationToken) -> Self {
        Self { outbound, shutdown }
    }

    fn send(&self, frame: &Frame) -> Result<(), PublishError> {
        if self.shutdown.is_cancelled() {
            return Err(PublishError::NotConnected);
        }
        self.outbound
            .send(frame.encode())
            .map_err(|_| PublishError::ChannelClosed)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Anything outbound frames can be published through.
pub trait Outbound: Send + Sync {
    /// Publishes `body` (JSON text) to `destination`.
    fn publish(&self, destination: &str, body: &str) -> Result<(), PublishError>;
}

/// Weak handle for sending frames on the current link.
#[derive(Clone, Default)]
pub struct Publisher {
    link: Weak<Link>,
}

impl Publisher {
    /// A publisher bound to nothing; every send fails with `NotConnected`.
    pub fn detached() -> Self {
        Self::default()
    }

    pub(crate) fn for_link(link: &Arc<Link>) -> Self {
        Self {
            link: Arc::downgrade(link),
        }
    }

    /// True while the link this publisher was created for is still up.
    pub fn is_live(&self) -> bool {
        self.link
            .upgrade()
            .map(|l| !l.shutdown.is_cancelled())
            .unwrap_or(false)
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<(), PublishError> {
        let link = self.link.upgrade().ok_or(PublishError::NotConnected)?;
        link.send(frame)
    }
}

impl Outbound for Publisher {
    fn publish(&self, destination: &str, body: &str) -> Result<(), PublishError> {
        self.send_frame(&Frame::send(destination, body))
    }
}

/// The single dispatch-server link of a session.
pub struct Connection<C: Connector> {
    connector: C,
    status: ConnectionStatus,
    link: Option<Arc<Link>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    handshake_timeout: Duration,
    sockets_opened: usize,
}

impl<C: Connector> Connection<C> {
    /// Creates a disconnected connection and the receiver for its event stream.
    pub fn new(
        connector: C,
        handshake_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let connection = Self {
            connector,
            status: ConnectionStatus::Disconnected,
            link: None,
            events,
            handshake_timeout,
            sockets_opened: 0,
        };
        (connection, rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Number of sockets this connection has ever opened.
    pub fn sockets_opened(&self) -> usize {
        self.sockets_opened
    }

    /// Publisher for the current link (detached when there is none).
    pub fn publisher(&self) -> Publisher {
        self.link
            .as_ref()
            .map(Publisher::for_link)
            .unwrap_or_default()
    }

    /// Establishes the link, or does nothing when one is up or being set up.
    pub async fn connect(&mut self, endpoint: &str, token: &str) {
        if matches!(
            self.status,
            ConnectionStatus::Connected | ConnectionStatus::Connecting
        ) {
            log::debug!("connect() ignored: link already {:?}", self.status);
            return;
        }

        self.status = ConnectionStatus::Connecting;
        match self.establish(endpoint, token).await {
            Ok(link) => {
                self.link = Some(Arc::new(link));
                self.status = ConnectionStatus::Connected;
                log::info!("STOMP connected to {}", endpoint);
                self.emit(TransportEvent::Lifecycle(LifecycleEvent::Opened));
            }
            Err(e) => {
                self.link = None;
                self.status = ConnectionStatus::Error;
                log::warn!("STOMP connect to {} failed: {}", endpoint, e);
                self.emit(TransportEvent::Lifecycle(LifecycleEvent::Error(e)));
            }
        }
    }

    /// Records a close or error reported on the event stream and drops the link.
    pub fn mark_down(&mut self, event: &LifecycleEvent) {
        let next = match event {
            LifecycleEvent::Opened => return,
            LifecycleEvent::Closed => ConnectionStatus::Disconnected,
            LifecycleEvent::Error(_) => ConnectionStatus::Error,
        };
        if self.status == ConnectionStatus::Connected {
            self.link = None;
            self.status = next;
        }
    }

    /// Sends DISCONNECT (best effort) and closes the socket.
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            if let Err(e) = link.send(&Frame::disconnect()) {
                log::debug!("DISCONNECT not sent: {}", e);
            }
            link.shutdown.cancel();
            log::info!("STOMP link closed by client.");
        }
        self.status = ConnectionStatus::Disconnected;
    }

    async fn establish(&mut self, endpoint: &str, token: &str) -> Result<Link, ConnectionError> {
        let url = Url::parse(endpoint)
            .map_err(|e| ConnectionError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;

        let Socket {
            outbound,
            mut inbound,
            shutdown,
        } = self.connector.open(&url, token).await?;
        self.sockets_opened += 1;

        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            _ => "localhost".to_string(),
        };
        if outbound.send(Frame::connect(&host, token).encode()).is_err() {
            shutdown.cancel();
            return Err(ConnectionError::Closed);
        }

        let handshake =
            tokio::time::timeout(self.handshake_timeout, await_connected(&mut inbound)).await;
        let outcome = match handshake {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::HandshakeTimeout(self.handshake_timeout)),
        };
        if let Err(e) = outcome {
            shutdown.cancel();
            return Err(e);
        }

        tokio::spawn(read_loop(inbound, self.events.clone(), shutdown.clone()));
        Ok(Link::new(outbound, shutdown))
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Transport event dropped: session receiver is gone");
        }
    }
}

impl<C: Connector> Drop for Connection<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn await_connected(
    inbound: &mut mpsc::UnboundedReceiver<SocketEvent>,
) -> Result<(), ConnectionError> {
    loop {
        match inbound.recv().await {
            Some(SocketEvent::Text(text)) => {
                if Frame::is_heartbeat(&text) {
                    continue;
                }
                let frame =
                    Frame::decode(&text).map_err(|e| ConnectionError::Protocol(e.to_string()))?;
                return match frame.command {
                    Command::Connected => Ok(()),
                    Command::Error => Err(ConnectionError::AuthRejected(error_message(&frame))),
                    other => Err(ConnectionError::Protocol(format!(
                        "expected CONNECTED, got {}",
                        other.as_str()
                    ))),
                };
            }
            Some(SocketEvent::Failed(reason)) => return Err(ConnectionError::Unreachable(reason)),
            Some(SocketEvent::Closed) | None => return Err(ConnectionError::Closed),
        }
    }
}

// Forwards decoded frames until the link is shut down or the socket ends.
async fn read_loop(
    mut inbound: mpsc::UnboundedReceiver<SocketEvent>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = inbound.recv() => event,
        };
        if shutdown.is_cancelled() {
            break;
        }
        match event {
            Some(SocketEvent::Text(text)) => {
                if Frame::is_heartbeat(&text) {
                    continue;
                }
                match Frame::decode(&text) {
                    Ok(frame) if frame.command == Command::Error => {
                        let cause = ConnectionError::Server(error_message(&frame));
                        log::error!("STOMP server error: {}", cause);
                        let _ = events.send(TransportEvent::Lifecycle(LifecycleEvent::Error(cause)));
                        shutdown.cancel();
                        break;
                    }
                    Ok(frame) => {
                        if events.send(TransportEvent::Frame(frame)).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Dropping undecodable frame: {}", e),
                }
            }
            Some(SocketEvent::Failed(reason)) => {
                let _ = events.send(TransportEvent::Lifecycle(LifecycleEvent::Error(
                    ConnectionError::Unreachable(reason),
                )));
                break;
            }
            Some(SocketEvent::Closed) | None => {
                let _ = events.send(TransportEvent::Lifecycle(LifecycleEvent::Closed));
                break;
            }
        }
    }
}

fn error_message(frame: &Frame) -> String {
    frame
        .get("message")
        .map(str::to_string)
        .unwrap_or_else(|| frame.body.clone())
}
