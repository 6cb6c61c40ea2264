//! Development relay server speaking the case collaboration protocol.
//!
//! ```text
//! ws://host/ws/case/<case_id>/?token=..&user_id=..&username=..
//!
//! Client A ──┐                       ┌──► Client B
//!            ├── Room (case_id) ─────┤
//! Client C ──┘    BroadcastGroup     └──► Client C
//! ```
//!
//! Behaviour per room:
//! - every non-ping message is relayed to the other peers, stamped with
//!   the sender's `userId` when it carries none;
//! - `ping` is answered to the sender only;
//! - a `presence_update` listing `current_connections` goes to everyone
//!   after each join and leave;
//! - a peer beyond `max_peers_per_room` is closed with code 1013.
//!
//! The token is accepted as-is. Case state is not stored.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use url::form_urlencoded;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Frame, RoomManager, RoomPeer};
use crate::presence::Collaborator;
use crate::protocol::{Message, MessageType};

/// Close code sent to a peer that does not fit in its room.
pub const TRY_AGAIN_LATER: u16 = 1013;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum sockets per case room
    pub max_peers_per_room: usize,
    /// Frames buffered per peer before it lags
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub relayed_messages: u64,
    pub active_rooms: usize,
}

/// Where a socket asked to go, parsed from the handshake request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseRoute {
    pub case_id: u64,
    pub token: Option<String>,
    pub user: Collaborator,
}

impl CaseRoute {
    /// Parse `/ws/case/<case_id>/[?query]`.
    ///
    /// A missing `user_id` gets a random one; a missing `username` becomes
    /// `anonymous`.
    pub fn parse(path_and_query: &str) -> Option<Self> {
        let (path, query) = path_and_query
            .split_once('?')
            .unwrap_or((path_and_query, ""));

        let mut segments = path.trim_matches('/').split('/');
        let case_id = match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some("ws"), Some("case"), Some(id), None) => id.parse().ok()?,
            _ => return None,
        };

        let mut token = None;
        let mut user_id = None;
        let mut username = None;
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "token" => token = Some(value.into_owned()),
                "user_id" if !value.is_empty() => user_id = Some(value.into_owned()),
                "username" if !value.is_empty() => username = Some(value.into_owned()),
                _ => {}
            }
        }

        Some(Self {
            case_id,
            token,
            user: Collaborator::new(
                user_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                username.unwrap_or_else(|| "anonymous".to_string()),
            ),
        })
    }
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind `bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, rooms, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("expected /ws/case/<case_id>/".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
) -> Result<(), BoxError> {
    let mut route = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        let target = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        match CaseRoute::parse(target) {
            Some(parsed) => {
                route = Some(parsed);
                Ok(resp)
            }
            None => Err(not_found()),
        }
    })
    .await?;
    let Some(route) = route else {
        return Ok(());
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    stats.write().await.total_connections += 1;

    let peer = RoomPeer::new(route.user.clone());
    let peer_id = peer.peer_id;

    let Some((room, mut broadcast_rx)) = rooms.join(route.case_id, peer).await else {
        log::warn!(
            "Case {} is full, rejecting {} from {addr}",
            route.case_id,
            route.user.username
        );
        stats.write().await.rejected_connections += 1;
        let frame = CloseFrame {
            code: CloseCode::from(TRY_AGAIN_LATER),
            reason: "room full".into(),
        };
        ws_sender.send(WsMessage::Close(Some(frame))).await?;
        return Ok(());
    };

    stats.write().await.active_connections += 1;
    log::info!(
        "{} ({}) joined case {} from {addr}",
        route.user.username,
        route.user.id,
        route.case_id
    );
    announce_presence(&room).await;

    let result = relay(
        &mut ws_sender,
        &mut ws_receiver,
        &mut broadcast_rx,
        &room,
        peer_id,
        &route,
        &stats,
    )
    .await;

    if let Some(room) = rooms.leave(route.case_id, &peer_id).await {
        announce_presence(&room).await;
    }
    stats.write().await.active_connections -= 1;
    log::info!("{} left case {}", route.user.username, route.case_id);

    result
}

async fn relay(
    ws_sender: &mut SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
    broadcast_rx: &mut broadcast::Receiver<Frame>,
    room: &BroadcastGroup,
    peer_id: Uuid,
    route: &CaseRoute,
    stats: &RwLock<ServerStats>,
) -> Result<(), BoxError> {
    loop {
        tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let inspection = Message::inspect(text.as_str());
                    let Some(mut message) = inspection.message else {
                        log::warn!(
                            "Dropping malformed frame from {} in case {}: {:?}",
                            route.user.id,
                            route.case_id,
                            inspection.issues
                        );
                        continue;
                    };

                    if message.msg_type == MessageType::Ping {
                        let pong = Message::ping().with_user(route.user.id.clone());
                        ws_sender.send(WsMessage::text(pong.encode()?)).await?;
                        continue;
                    }

                    if message.user_id.is_none() {
                        message.user_id = Some(route.user.id.clone());
                    }
                    room.broadcast_from(peer_id, message.encode()?);
                    stats.write().await.relayed_messages += 1;
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("WebSocket error from {}: {e}", route.user.id);
                    return Ok(());
                }
            },

            outgoing = broadcast_rx.recv() => match outgoing {
                Ok(frame) => {
                    if frame.is_for(peer_id) {
                        ws_sender.send(WsMessage::text(frame.text.to_string())).await?;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Peer {} lagged by {skipped} frames", route.user.id);
                    room.record_dropped(skipped);
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn announce_presence(room: &BroadcastGroup) {
    let snapshot = room.presence_snapshot().await;
    match Message::presence_update(snapshot).encode() {
        Ok(text) => {
            room.broadcast_all(text);
        }
        Err(e) => log::error!("Failed to encode presence update: {e}"),
    }
}
