//! WebSocket transport through a `passage-relay` server
//!
//! Both peers join the room named after the transfer ID. The sender forwards
//! the base64-encoded envelope once the receiver is in the room, then waits
//! for the receiver's acknowledgement before reporting success. The relay
//! only ever sees ciphertext.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{
    connect_async_with_config, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Envelope, TransferId, Transport, TransportError, TransportResult};
use crate::config::{relay_endpoint, Config, DEFAULT_RELAY_URL};

/// Payload the receiver forwards once it holds the envelope
const ACK: &str = "ack";

/// Messages exchanged with the relay server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[allow(missing_docs)]
pub enum RelayMessage {
    /// Join (or open) the room for a transfer
    JoinRoom { room: String },
    /// Successfully joined room
    Joined { room: String, peer_count: usize },
    /// Peer joined your room
    PeerJoined,
    /// Peer left your room
    PeerLeft,
    /// Forward data to peer (opaque blob)
    Forward { data: String },
    /// Received data from peer
    Message { data: String },
    /// Error occurred
    Error { message: String },
    /// Ping
    Ping,
    /// Pong
    Pong,
}

/// Room for the envelope header, metadata JSON, cipher overhead and the
/// relay message wrapper around the base64 text
const MESSAGE_HEADROOM: u64 = 64 * 1024;

/// Largest WebSocket message needed to relay a file of `max_file_size` bytes
pub fn relay_message_limit(max_file_size: u64) -> usize {
    let base64_len = max_file_size.saturating_add(MESSAGE_HEADROOM).div_ceil(3).saturating_mul(4);
    usize::try_from(base64_len.saturating_add(MESSAGE_HEADROOM)).unwrap_or(usize::MAX)
}

/// WebSocket configuration sized for files up to `max_file_size` bytes
pub fn relay_ws_config(max_file_size: u64) -> WebSocketConfig {
    let limit = relay_message_limit(max_file_size);
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(limit);
    config.max_frame_size = Some(limit);
    config
}

/// One WebSocket connection to the relay, used for a single attempt
struct RelayConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    peer_connected: bool,
}

impl RelayConnection {
    /// Connect to a relay server
    async fn connect(relay_url: &str, max_file_size: u64) -> TransportResult<Self> {
        let config = relay_ws_config(max_file_size);
        let (ws, _) = connect_async_with_config(relay_url, Some(config), false)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(RelayConnection {
            ws,
            peer_connected: false,
        })
    }

    /// Join the room for a transfer
    async fn join_room(&mut self, room: &str) -> TransportResult<usize> {
        let msg = RelayMessage::JoinRoom {
            room: room.to_string(),
        };
        self.send_relay_message(&msg).await?;

        // Wait for joined response
        loop {
            match self.receive_relay_message().await? {
                RelayMessage::Joined { peer_count, .. } => {
                    if peer_count > 1 {
                        self.peer_connected = true;
                    }
                    return Ok(peer_count);
                }
                RelayMessage::Error { message } => {
                    return Err(TransportError::ConnectionFailed(message));
                }
                _ => continue,
            }
        }
    }

    /// Wait for peer to join the room
    async fn wait_for_peer(&mut self) -> TransportResult<()> {
        if self.peer_connected {
            return Ok(());
        }

        loop {
            match self.receive_relay_message().await? {
                RelayMessage::PeerJoined => {
                    self.peer_connected = true;
                    return Ok(());
                }
                RelayMessage::Error { message } => {
                    return Err(TransportError::ConnectionFailed(message));
                }
                _ => continue,
            }
        }
    }

    /// Forward an opaque payload to the peer
    async fn forward(&mut self, data: &[u8]) -> TransportResult<()> {
        let msg = RelayMessage::Forward {
            data: BASE64.encode(data),
        };
        self.send_relay_message(&msg).await
    }

    /// Next payload forwarded by the peer
    async fn next_data(&mut self) -> TransportResult<Vec<u8>> {
        loop {
            match self.receive_relay_message().await? {
                RelayMessage::Message { data } => {
                    return BASE64
                        .decode(data)
                        .map_err(|e| TransportError::InvalidData(e.to_string()));
                }
                RelayMessage::PeerJoined => {
                    self.peer_connected = true;
                    continue;
                }
                RelayMessage::PeerLeft => {
                    self.peer_connected = false;
                    return Err(TransportError::Disconnected);
                }
                RelayMessage::Error { message } => {
                    return Err(TransportError::ReceiveFailed(message));
                }
                _ => continue,
            }
        }
    }

    /// Send a relay protocol message
    async fn send_relay_message(&mut self, msg: &RelayMessage) -> TransportResult<()> {
        let json =
            serde_json::to_string(msg).map_err(|e| TransportError::SendFailed(e.to_string()))?;

        self.ws
            .send(Message::Text(json))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Receive a relay protocol message
    async fn receive_relay_message(&mut self) -> TransportResult<RelayMessage> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| TransportError::InvalidData(e.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TransportError::Disconnected);
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                _ => continue,
            }
        }
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Transport through a WebSocket relay
pub struct RelayTransport {
    url: RwLock<String>,
    priority: i32,
    probe_timeout: Duration,
    max_file_size: AtomicU64,
}

impl RelayTransport {
    /// Create a relay transport for `url`
    pub fn new(url: impl Into<String>, priority: i32) -> Self {
        RelayTransport {
            url: RwLock::new(url.into()),
            priority,
            probe_timeout: Duration::from_secs(3),
            max_file_size: AtomicU64::new(Config::default().max_file_size()),
        }
    }

    /// Largest file this transport will carry
    pub fn with_max_file_size(self, max_file_size: u64) -> Self {
        self.max_file_size.store(max_file_size, Ordering::Relaxed);
        self
    }

    fn max_file_size(&self) -> u64 {
        self.max_file_size.load(Ordering::Relaxed)
    }

    /// Limit for the TCP reachability probe
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    async fn deliver(&self, envelope: &Envelope) -> TransportResult<()> {
        if envelope.metadata.file_size > self.max_file_size() {
            return Err(TransportError::SendFailed(format!(
                "{} bytes exceeds the relay limit of {} bytes",
                envelope.metadata.file_size,
                self.max_file_size()
            )));
        }

        let url = self.url.read().await.clone();
        let bytes = envelope.to_bytes()?;

        let mut conn = RelayConnection::connect(&url, self.max_file_size()).await?;
        conn.join_room(envelope.metadata.transfer_id.as_str()).await?;
        conn.wait_for_peer().await?;
        conn.forward(&bytes).await?;

        let ack = conn.next_data().await?;
        conn.close().await;
        if ack != ACK.as_bytes() {
            return Err(TransportError::InvalidData("Unexpected acknowledgement".to_string()));
        }
        Ok(())
    }

    async fn collect(&self, transfer_id: &TransferId) -> TransportResult<Envelope> {
        let url = self.url.read().await.clone();

        let mut conn = RelayConnection::connect(&url, self.max_file_size()).await?;
        conn.join_room(transfer_id.as_str()).await?;

        let bytes = conn.next_data().await?;
        let envelope = Envelope::from_bytes(&bytes)?;
        if &envelope.metadata.transfer_id != transfer_id {
            return Err(TransportError::InvalidData("Envelope for another transfer".to_string()));
        }

        conn.forward(ACK.as_bytes()).await?;
        conn.close().await;
        Ok(envelope)
    }
}

impl Default for RelayTransport {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_URL, 10)
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn setup(&self, config: &Config) -> TransportResult<()> {
        if relay_endpoint(&config.relay_url).is_none() {
            return Err(TransportError::Unavailable(format!(
                "invalid relay URL: {}",
                config.relay_url
            )));
        }
        *self.url.write().await = config.relay_url.clone();
        self.max_file_size.store(config.max_file_size(), Ordering::Relaxed);
        Ok(())
    }

    async fn send(&self, envelope: &Envelope, cancel: &CancellationToken) -> TransportResult<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.deliver(envelope) => result,
        }
    }

    async fn receive(
        &self,
        transfer_id: &TransferId,
        cancel: &CancellationToken,
    ) -> TransportResult<Envelope> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.collect(transfer_id) => result,
        }
    }

    async fn is_available(&self, cancel: &CancellationToken) -> bool {
        let url = self.url.read().await.clone();
        let Some((host, port)) = relay_endpoint(&url) else {
            return false;
        };

        let probe = tokio::time::timeout(self.probe_timeout, TcpStream::connect((host.as_str(), port)));
        let reachable = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            result = probe => matches!(result, Ok(Ok(_))),
        };
        debug!("Relay {} reachable: {}", url, reachable);
        reachable
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        "relay"
    }

    async fn close(&self) -> TransportResult<()> {
        // Connections live for one attempt; nothing is held between calls
        Ok(())
    }
}
