use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::client::TokenProvider;
use crate::error::ConnectError;

pub const NORMAL_CLOSE: u16 = 1000;
pub const ABNORMAL_CLOSE: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message(String),
    Error(String),
    Closed { code: u16, reason: String },
}

/// Both ends of one open push connection.
pub struct Channel {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: Url) -> Result<Channel, ConnectError>;
}

/// One logical push connection. Dropping it discards the channel.
pub struct TransportSession {
    id: Uuid,
    channel: Channel,
    closed: bool,
}

impl TransportSession {
    /// Fetches a fresh token right before every attempt and refuses to dial
    /// without one.
    pub async fn open(
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
        endpoint: Url,
        timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let token = tokens.auth_token().ok_or(ConnectError::MissingToken)?;
        let url = with_token(endpoint, &token);

        let channel = tokio::time::timeout(timeout, connector.connect(url))
            .await
            .map_err(|_| ConnectError::Timeout)??;

        let id = Uuid::new_v4();
        info!(session_id = %id, "push channel opened");

        Ok(Self {
            id,
            channel,
            closed: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn send(&self, text: String) -> Result<(), ConnectError> {
        self.channel
            .outbound
            .send(Outbound::Text(text))
            .map_err(|_| ConnectError::Closed)
    }

    pub fn close(mut self, code: u16) {
        self.closed = true;
        if self.channel.outbound.send(Outbound::Close(code)).is_err() {
            debug!(session_id = %self.id, "channel already gone at close");
        }
        info!(session_id = %self.id, code, "push channel closed");
    }

    /// Next inbound event; a vanished pump counts as an abnormal close.
    pub async fn next_event(&mut self) -> ChannelEvent {
        match self.channel.inbound.recv().await {
            Some(event) => event,
            None => ChannelEvent::Closed {
                code: ABNORMAL_CLOSE,
                reason: "channel dropped".to_string(),
            },
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.channel.outbound.send(Outbound::Close(NORMAL_CLOSE));
        }
    }
}

pub fn with_token(mut endpoint: Url, token: &str) -> Url {
    let retained: Vec<(String, String)> = endpoint
        .query_pairs()
        .filter(|(key, _)| key != "token")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    {
        let mut query = endpoint.query_pairs_mut();
        query.clear();
        for (key, value) in &retained {
            query.append_pair(key, value);
        }
        query.append_pair("token", token);
    }
    endpoint
}

/// tokio-tungstenite backed connector.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: Url) -> Result<Channel, ConnectError> {
        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|err| ConnectError::Handshake(err.to_string()))?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(pump(socket, out_rx, in_tx));

        Ok(Channel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn pump(
    socket: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<ChannelEvent>,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(err) = sink.send(Message::Text(text.into())).await {
                        let _ = inbound.send(ChannelEvent::Error(err.to_string()));
                        let _ = inbound.send(abnormal("send failed"));
                        break;
                    }
                }
                Some(Outbound::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "".into(),
                    };
                    if let Err(err) = sink.send(Message::Close(Some(frame))).await {
                        debug!(error = %err, "close frame not delivered");
                    }
                    break;
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(ChannelEvent::Message(text.as_str().to_string())).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.as_str().to_string()))
                        .unwrap_or((ABNORMAL_CLOSE, String::new()));
                    let _ = inbound.send(ChannelEvent::Closed { code, reason });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "push channel read failed");
                    let _ = inbound.send(ChannelEvent::Error(err.to_string()));
                    let _ = inbound.send(abnormal("read failed"));
                    break;
                }
                None => {
                    let _ = inbound.send(abnormal("stream ended"));
                    break;
                }
            },
        }
    }
}

fn abnormal(reason: &str) -> ChannelEvent {
    ChannelEvent::Closed {
        code: ABNORMAL_CLOSE,
        reason: reason.to_string(),
    }
}
