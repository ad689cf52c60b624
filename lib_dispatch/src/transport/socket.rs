//! # Sockets and Connectors
//!
//! A `Socket` is the smallest thing the connection layer needs from the
//! network: a queue of outbound text messages, a stream of inbound events and
//! a token that tears the pump down. `Connector` produces sockets; the
//! production implementation is `WsConnector`, which runs a tokio-tungstenite
//! client in a background task.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::ConnectionError;

/// Something that happened on the socket's read side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// One WebSocket text message (normally one STOMP frame).
    Text(String),
    /// The remote side closed the socket.
    Closed,
    /// The socket failed; the pump has stopped.
    Failed(String),
}

/// An open, pumped socket.
pub struct Socket {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
    /// Cancelling this closes the socket and stops the pump.
    pub shutdown: CancellationToken,
}

/// Opens sockets to the dispatch server.
pub trait Connector: Send + Sync + 'static {
    /// Opens a socket for `endpoint`, authenticated with `token` at the HTTP
    /// upgrade. The STOMP handshake is the caller's business.
    fn open(
        &self,
        endpoint: &Url,
        token: &str,
    ) -> impl Future<Output = Result<Socket, ConnectionError>> + Send;
}

/// Builds the upgrade URL: `{endpoint}/ws?token=<url-encoded "Bearer <token>">`.
pub fn upgrade_url(endpoint: &Url, token: &str) -> Result<Url, ConnectionError> {
    let base = endpoint.as_str().trim_end_matches('/');
    let mut url = Url::parse(&format!("{}/ws", base))
        .map_err(|e| ConnectionError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
    url.query_pairs_mut()
        .append_pair("token", &format!("Bearer {}", token));
    Ok(url)
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn open(
        &self,
        endpoint: &Url,
        token: &str,
    ) -> impl Future<Output = Result<Socket, ConnectionError>> + Send {
        let target = upgrade_url(endpoint, token);
        async move {
            let target = target?;
            log::info!("Opening dispatch socket: {}", endpoint_for_log(&target));

            let (ws_stream, _) = connect_async(target.as_str())
                .await
                .map_err(|e| ConnectionError::Unreachable(e.to_string()))?;

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();
            let shutdown = CancellationToken::new();
            let pump_shutdown = shutdown.clone();

            tokio::spawn(async move {
                let (mut write, mut read) = ws_stream.split();
                loop {
                    tokio::select! {
                        _ = pump_shutdown.cancelled() => {
                            let _ = write.close().await;
                            log::debug!("Dispatch socket pump stopped.");
                            break;
                        }
                        outbound = out_rx.recv() => {
                            let Some(text) = outbound else {
                                let _ = write.close().await;
                                break;
                            };
                            if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                                log::error!("Dispatch socket write failed: {}", e);
                                let _ = in_tx.send(SocketEvent::Failed(e.to_string()));
                                break;
                            }
                        }
                        inbound = read.next() => {
                            match inbound {
                                Some(Ok(WsMessage::Text(text))) => {
                                    if in_tx.send(SocketEvent::Text(text.as_str().to_owned())).is_err() {
                                        break;
                                    }
                                }
                                Some(Ok(WsMessage::Binary(bin))) => {
                                    match String::from_utf8(bin.to_vec()) {
                                        Ok(text) => {
                                            let _ = in_tx.send(SocketEvent::Text(text));
                                        }
                                        Err(_) => log::warn!("Dropping non UTF-8 binary frame ({} bytes)", bin.len()),
                                    }
                                }
                                Some(Ok(WsMessage::Close(_))) | None => {
                                    log::warn!("Dispatch socket closed by remote host.");
                                    let _ = in_tx.send(SocketEvent::Closed);
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    log::error!("Dispatch socket read error: {}", e);
                                    let _ = in_tx.send(SocketEvent::Failed(e.to_string()));
                                    break;
                                }
                            }
                        }
                    }
                }
            });

            Ok(Socket {
                outbound: out_tx,
                inbound: in_rx,
                shutdown,
            })
        }
    }
}

// The token travels in the query string; keep it out of the logs.
fn endpoint_for_log(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}
