//! # Loopback Broker
//!
//! A small in-process STOMP broker that implements `Connector`. It speaks just
//! enough of the protocol for a dispatch client: CONNECT/CONNECTED (or an
//! ERROR when told to reject credentials), SUBSCRIBE/UNSUBSCRIBE bookkeeping
//! per client, and MESSAGE delivery on demand. Frames clients send are
//! recorded so callers can assert on the outbound side; only the newest
//! `RECORDED_FRAMES` are kept, and a client is forgotten once its socket
//! closes, so a long offline run stays bounded.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::ConnectionError;
use crate::transport::frame::{Command, Frame, STOMP_VERSION};
use crate::transport::socket::{Connector, Socket, SocketEvent};

/// How many received frames the broker remembers.
pub const RECORDED_FRAMES: usize = 4096;

struct ClientSlot {
    inbound: mpsc::UnboundedSender<SocketEvent>,
    // subscription id -> destination
    subscriptions: HashMap<String, String>,
}

#[derive(Default)]
struct BrokerState {
    sockets_opened: usize,
    refuse: Option<String>,
    reject_auth: Option<String>,
    stall_handshake: bool,
    received: VecDeque<Frame>,
    clients: HashMap<usize, ClientSlot>,
    last_token: Option<String>,
    next_message_id: u64,
}

impl BrokerState {
    fn record(&mut self, frame: Frame) {
        if self.received.len() == RECORDED_FRAMES {
            self.received.pop_front();
        }
        self.received.push_back(frame);
    }
}

/// Shared handle to an in-process broker. Clones talk to the same broker.
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock only happens in a failing test; keep
    // serving with whatever state is there.
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Makes `open` fail with `Unreachable(reason)`, or succeed again with `None`.
    pub fn refuse_connections(&self, reason: Option<&str>) {
        self.lock().refuse = reason.map(str::to_string);
    }

    /// Answers CONNECT with an ERROR frame, or with CONNECTED again with `None`.
    pub fn reject_auth(&self, reason: Option<&str>) {
        self.lock().reject_auth = reason.map(str::to_string);
    }

    /// Never answers CONNECT while set.
    pub fn stall_handshake(&self, stall: bool) {
        self.lock().stall_handshake = stall;
    }

    pub fn sockets_opened(&self) -> usize {
        self.lock().sockets_opened
    }

    /// Number of clients whose socket is still open.
    pub fn open_clients(&self) -> usize {
        self.lock().clients.len()
    }

    /// The most recent frames received from any client, in arrival order.
    pub fn received(&self) -> Vec<Frame> {
        self.lock().received.iter().cloned().collect()
    }

    pub fn frames_with(&self, command: Command) -> Vec<Frame> {
        self.lock()
            .received
            .iter()
            .filter(|f| f.command == command)
            .cloned()
            .collect()
    }

    /// Bodies of the SEND frames addressed to `destination`.
    pub fn sent_to(&self, destination: &str) -> Vec<String> {
        self.lock()
            .received
            .iter()
            .filter(|f| f.command == Command::Send && f.destination() == Some(destination))
            .map(|f| f.body.clone())
            .collect()
    }

    /// Live subscriptions to `destination` across open clients.
    pub fn subscribers(&self, destination: &str) -> usize {
        self.lock()
            .clients
            .values()
            .flat_map(|c| c.subscriptions.values())
            .filter(|d| d.as_str() == destination)
            .count()
    }

    /// Token presented at the socket upgrade of the most recent client.
    pub fn last_token(&self) -> Option<String> {
        self.lock().last_token.clone()
    }

    /// Pushes a MESSAGE to every subscriber of `destination`. Returns how many
    /// subscriptions it reached.
    pub fn deliver(&self, destination: &str, body: &str) -> usize {
        let mut state = self.lock();
        let mut targets = Vec::new();
        for client in state.clients.values() {
            for (sub_id, dest) in &client.subscriptions {
                if dest == destination {
                    targets.push((client.inbound.clone(), sub_id.clone()));
                }
            }
        }

        let mut reached = 0;
        for (inbound, sub_id) in targets {
            state.next_message_id += 1;
            let frame = Frame::new(Command::Message)
                .header("destination", destination)
                .header("subscription", sub_id)
                .header("message-id", format!("m-{}", state.next_message_id))
                .header("content-type", "application/json")
                .with_body(body);
            if inbound.send(SocketEvent::Text(frame.encode())).is_ok() {
                reached += 1;
            }
        }
        log::debug!("Loopback delivered {} to {} subscriber(s)", destination, reached);
        reached
    }

    /// Closes every open client socket from the server side.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        for (_, client) in state.clients.drain() {
            let _ = client.inbound.send(SocketEvent::Closed);
        }
    }

    /// Polls `condition` until it holds or `timeout` elapses.
    pub async fn wait_until<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&LoopbackBroker) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn handle(&self, client: usize, text: &str) {
        if Frame::is_heartbeat(text) {
            return;
        }
        let frame = match Frame::decode(text) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("Loopback dropping bad frame from client {}: {}", client, e);
                return;
            }
        };

        let mut state = self.lock();
        state.record(frame.clone());
        let reject = state.reject_auth.clone();
        let stall = state.stall_handshake;
        let Some(slot) = state.clients.get_mut(&client) else {
            return;
        };

        let mut closed = false;
        match frame.command {
            Command::Connect | Command::Stomp => {
                if let Some(reason) = reject {
                    let error = Frame::new(Command::Error)
                        .header("message", reason)
                        .with_body("Authentication failed");
                    let _ = slot.inbound.send(SocketEvent::Text(error.encode()));
                    let _ = slot.inbound.send(SocketEvent::Closed);
                    closed = true;
                } else if !stall {
                    let connected = Frame::new(Command::Connected)
                        .header("version", STOMP_VERSION)
                        .header("heart-beat", "0,0");
                    let _ = slot.inbound.send(SocketEvent::Text(connected.encode()));
                }
            }
            Command::Subscribe => {
                if let (Some(id), Some(dest)) = (frame.get("id"), frame.destination()) {
                    slot.subscriptions.insert(id.to_string(), dest.to_string());
                }
            }
            Command::Unsubscribe => {
                if let Some(id) = frame.get("id") {
                    slot.subscriptions.remove(id);
                }
            }
            Command::Disconnect => {
                if let Some(receipt) = frame.get("receipt") {
                    let reply = Frame::new(Command::Receipt).header("receipt-id", receipt);
                    let _ = slot.inbound.send(SocketEvent::Text(reply.encode()));
                }
                closed = true;
            }
            _ => {}
        }
        if closed {
            state.clients.remove(&client);
        }
    }

    fn close_client(&self, client: usize) {
        self.lock().clients.remove(&client);
    }
}

impl Connector for LoopbackBroker {
    fn open(
        &self,
        _endpoint: &Url,
        token: &str,
    ) -> impl Future<Output = Result<Socket, ConnectionError>> + Send {
        let broker = self.clone();
        let token = token.to_string();
        async move {
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();
            let shutdown = CancellationToken::new();

            let client = {
                let mut state = broker.lock();
                if let Some(reason) = state.refuse.clone() {
                    return Err(ConnectionError::Unreachable(reason));
                }
                state.sockets_opened += 1;
                let client = state.sockets_opened;
                state.clients.insert(
                    client,
                    ClientSlot {
                        inbound: in_tx,
                        subscriptions: HashMap::new(),
                    },
                );
                state.last_token = Some(token);
                client
            };

            let serve_shutdown = shutdown.clone();
            let server = broker.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = serve_shutdown.cancelled() => break,
                        text = out_rx.recv() => match text {
                            Some(text) => server.handle(client, &text),
                            None => break,
                        },
                    }
                }
                server.close_client(client);
            });

            Ok(Socket {
                outbound: out_tx,
                inbound: in_rx,
                shutdown,
            })
        }
    }
}
