//! Stateless WebSocket relay for party rooms.
//!
//! Architecture:
//! ```text
//! Peer A ──┐                              ┌──► Peer B
//!          ├── Room (appId:CODE) ─ BroadcastGroup
//! Peer C ──┘                              └──► Peer C (filtered)
//! ```
//!
//! The relay only forwards frames. It holds no party state, so any peer
//! can be the first or last in a room and snapshots always come from
//! peers. Rooms exist while at least one peer is joined.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

pub mod broadcast;
pub mod frame;

pub use broadcast::{BroadcastGroup, BroadcastStats, Membership, Outbound, RoomRegistry};
pub use frame::{FrameKind, RelayFrame};

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::transport::PeerId;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Ephemeral port, small buffers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 16,
            broadcast_capacity: 64,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// Room currently joined by one connection.
struct Joined {
    room: String,
    peer: PeerId,
    group: Arc<BroadcastGroup>,
}

/// The relay server. Cheap to clone; clones share rooms and stats.
#[derive(Clone)]
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomRegistry>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomRegistry::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut joined: Option<Joined> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Outbound>>> = None;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                let frame = match RelayFrame::decode(&bytes) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        continue;
                                    }
                                };
                                {
                                    let mut s = self.stats.write().await;
                                    s.total_frames += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }

                                match frame.kind {
                                    FrameKind::Join => {
                                        if let Some(prev) = joined.take() {
                                            broadcast_rx = None;
                                            self.leave(&prev).await;
                                        }

                                        let Some(membership) = self.rooms.join(&frame.room, frame.from).await else {
                                            log::warn!("Room {} is full, refusing {}", frame.room, frame.from);
                                            break;
                                        };

                                        let ack = RelayFrame::joined(frame.room.as_str(), frame.from);
                                        ws_sender.send(Message::Binary(ack.encode()?.into())).await?;
                                        for other in &membership.existing {
                                            let hello = RelayFrame::peer_joined(frame.room.as_str(), *other);
                                            ws_sender.send(Message::Binary(hello.encode()?.into())).await?;
                                        }
                                        membership
                                            .group
                                            .broadcast(&RelayFrame::peer_joined(frame.room.as_str(), frame.from))?;

                                        log::info!(
                                            "Peer {} joined room {} ({} already present)",
                                            frame.from,
                                            frame.room,
                                            membership.existing.len()
                                        );
                                        broadcast_rx = Some(membership.receiver);
                                        joined = Some(Joined {
                                            room: frame.room,
                                            peer: frame.from,
                                            group: membership.group,
                                        });
                                        self.refresh_room_count().await;
                                    }

                                    FrameKind::Data => match &joined {
                                        Some(j) if j.room == frame.room && j.peer == frame.from => {
                                            j.group.broadcast(&frame)?;
                                        }
                                        _ => log::debug!("Dropping data frame for unjoined room {}", frame.room),
                                    },

                                    FrameKind::Leave => {
                                        if let Some(prev) = joined.take() {
                                            broadcast_rx = None;
                                            self.leave(&prev).await;
                                        }
                                    }

                                    FrameKind::Ping => {
                                        let pong = RelayFrame::pong(frame.from);
                                        ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                    }

                                    other => log::debug!("Unhandled frame kind from {addr}: {other:?}"),
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    out = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        let Some(j) = &joined else { continue };
                        match out {
                            Ok(out) => {
                                if out.is_for(&j.peer) {
                                    ws_sender.send(Message::Binary(out.bytes.clone().into())).await?;
                                }
                            }
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Peer {} lagged by {n} frames", j.peer);
                                j.group.record_dropped(n);
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        if let Some(prev) = joined.take() {
            self.leave(&prev).await;
        }
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    async fn leave(&self, joined: &Joined) {
        self.rooms.leave(&joined.room, &joined.peer).await;
        log::info!("Peer {} left room {}", joined.peer, joined.room);
        self.refresh_room_count().await;
    }

    async fn refresh_room_count(&self) {
        let count = self.rooms.room_count().await;
        self.stats.write().await.active_rooms = count;
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_relay_creation() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let server = RelayServer::new(RelayConfig::for_testing());
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_frames, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(server.rooms().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = RelayServer::new(RelayConfig::for_testing());
        let listener = server.bind().await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
