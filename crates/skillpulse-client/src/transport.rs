//! Transport seam between the connection supervisor and the network.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::config::validate_url;
use crate::error::TransportError;

/// What a live link reports back to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(String),
    Closed { reason: String },
}

/// One established connection.
///
/// Dropping `outbound` asks the link to close. After `Closed` is delivered,
/// `inbound` yields nothing more.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<LinkEvent>,
}

impl Link {
    /// A link pair joined by channels, with the far ends handed back.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<String>, mpsc::Sender<LinkEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            outbound_rx,
            inbound_tx,
        )
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Link, TransportError>;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
    capacity: usize,
}

impl WsConnector {
    pub fn new(url: &str, capacity: usize) -> Result<Self, TransportError> {
        let url = validate_url(url).map_err(|err| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self { url, capacity })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (link, outbound_rx, inbound_tx) = Link::pair(self.capacity);
        tokio::spawn(pump(ws, outbound_rx, inbound_tx));
        Ok(link)
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Moves frames between the socket and the link channels until either side
/// goes away. Exactly one `Closed` is reported unless the owner hung up first.
async fn pump(
    ws: WsStream,
    mut outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<LinkEvent>,
) {
    let (mut sink, mut stream) = ws.split();
    let reason = loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(LinkEvent::Frame(text)).await.is_err() {
                        let _ = sink.close().await;
                        return;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = sink.send(Message::Pong(payload)).await {
                        break format!("pong failed: {err}");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) if !frame.reason.is_empty() => frame.reason.to_string(),
                        _ => "peer closed".to_string(),
                    };
                }
                Some(Ok(Message::Binary(payload))) => {
                    debug!(event = "ws_binary_ignored", bytes = payload.len());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break err.to_string(),
                None => break "stream ended".to_string(),
            },
            out = outbound.recv() => match out {
                Some(text) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        warn!(event = "ws_send_error", error = %err);
                        break err.to_string();
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return;
                }
            },
        }
    };
    let _ = inbound.send(LinkEvent::Closed { reason }).await;
}
