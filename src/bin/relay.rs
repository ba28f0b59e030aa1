//! Passage Relay Server
//!
//! A WebSocket relay that pairs the two peers of a transfer.
//! The server provides:
//! - Rooms named after the transfer ID, opened by whichever peer arrives first
//! - Opaque forwarding (only ever sees ciphertext)
//! - At most two peers per room
//!
//! Usage:
//!   passage-relay [--port 8765] [--host 0.0.0.0] [--max-file-size-mb 512]

use clap::Parser;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use passage::transport::relay::{relay_ws_config, RelayMessage};
use passage::Config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::{accept_async_with_config, tungstenite::Message, WebSocketStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Peers allowed in one room
const ROOM_CAPACITY: usize = 2;

/// Room events buffered per room; a transfer needs a handful
const ROOM_BACKLOG: usize = 4;

/// Passage Relay Server
#[derive(Parser)]
#[command(name = "passage-relay")]
#[command(about = "WebSocket relay server for Passage file transfers")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8765")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Largest file relayed, in MiB; bigger messages are refused
    #[arg(long, default_value_t = Config::default().max_file_size_mb)]
    max_file_size_mb: u64,
}

type ClientId = u64;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// What happens inside a room, seen by every member
#[derive(Clone, Debug)]
enum RoomEvent {
    Joined(ClientId),
    Left(ClientId),
    Data(ClientId, String),
}

/// A room for the two peers of one transfer
struct Room {
    tx: broadcast::Sender<RoomEvent>,
    members: usize,
}

impl Room {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(ROOM_BACKLOG);
        Room { tx, members: 0 }
    }
}

/// Server state
#[derive(Default)]
struct RelayState {
    rooms: Mutex<HashMap<String, Room>>,
}

impl RelayState {
    /// Join a room, opening it if needed. Returns the room channel and the
    /// member count including the caller.
    async fn join(
        &self,
        name: &str,
        client: ClientId,
    ) -> Result<(broadcast::Sender<RoomEvent>, broadcast::Receiver<RoomEvent>, usize), String> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(name.to_string()).or_insert_with(Room::new);
        if room.members >= ROOM_CAPACITY {
            return Err("Room is full".to_string());
        }

        room.members += 1;
        let rx = room.tx.subscribe();
        let _ = room.tx.send(RoomEvent::Joined(client));
        Ok((room.tx.clone(), rx, room.members))
    }

    /// Leave a room, removing it once empty
    async fn leave(&self, name: &str, client: ClientId) {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get_mut(name) else {
            return;
        };

        room.members = room.members.saturating_sub(1);
        if room.members == 0 {
            rooms.remove(name);
            info!("Room removed: {}", name);
        } else {
            let _ = room.tx.send(RoomEvent::Left(client));
        }
    }
}

struct Membership {
    room: String,
    tx: broadcast::Sender<RoomEvent>,
    rx: broadcast::Receiver<RoomEvent>,
}

async fn reply(write: &mut WsSink, msg: &RelayMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => write.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            error!("Could not encode {:?}: {}", msg, e);
            true
        }
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RelayState>,
    ws_config: WebSocketConfig,
) {
    info!("New connection from: {}", addr);

    let ws_stream = match accept_async_with_config(stream, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let client_id: ClientId = rand::random();
    let mut membership: Option<Membership> = None;

    loop {
        tokio::select! {
            msg = read.next() => {
                let relay_msg = match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayMessage>(&text) {
                        Ok(relay_msg) => relay_msg,
                        Err(e) => {
                            warn!("Invalid message from {}: {}", addr, e);
                            continue;
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client {} disconnected", addr);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    Some(Ok(_)) => continue,
                };

                let response = match relay_msg {
                    RelayMessage::JoinRoom { room } => {
                        if membership.is_some() {
                            Some(RelayMessage::Error { message: "Already in a room".to_string() })
                        } else {
                            match state.join(&room, client_id).await {
                                Ok((tx, rx, peer_count)) => {
                                    info!("Client {} joined room {}, {} peers", addr, room, peer_count);
                                    membership = Some(Membership { room: room.clone(), tx, rx });
                                    Some(RelayMessage::Joined { room, peer_count })
                                }
                                Err(message) => Some(RelayMessage::Error { message }),
                            }
                        }
                    }

                    RelayMessage::Forward { data } => match &membership {
                        Some(m) => {
                            let _ = m.tx.send(RoomEvent::Data(client_id, data));
                            None
                        }
                        None => Some(RelayMessage::Error { message: "Not in a room".to_string() }),
                    },

                    RelayMessage::Ping => Some(RelayMessage::Pong),

                    _ => None,
                };

                if let Some(response) = response {
                    if !reply(&mut write, &response).await {
                        break;
                    }
                }
            }

            event = async {
                match &mut membership {
                    Some(m) => m.rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                let response = match event {
                    Ok(RoomEvent::Joined(id)) if id != client_id => RelayMessage::PeerJoined,
                    Ok(RoomEvent::Left(id)) if id != client_id => RelayMessage::PeerLeft,
                    Ok(RoomEvent::Data(id, data)) if id != client_id => RelayMessage::Message { data },
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} lagged {} room events", addr, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                if !reply(&mut write, &response).await {
                    break;
                }
            }
        }
    }

    if let Some(m) = membership {
        state.leave(&m.room, client_id).await;
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("passage_relay=info")),
        )
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("Passage Relay Server listening on ws://{}", addr);
    info!(
        "Rooms are limited to {} peers each, files to {} MiB",
        ROOM_CAPACITY, args.max_file_size_mb
    );

    let ws_config = relay_ws_config(args.max_file_size_mb.saturating_mul(1024 * 1024));
    let state = Arc::new(RelayState::default());

    while let Ok((stream, addr)) = listener.accept().await {
        let state = state.clone();
        tokio::spawn(handle_connection(stream, addr, state, ws_config));
    }
}
