//! WebSocket transport to a [`RelayServer`](crate::relay::RelayServer).
//!
//! Each joined room owns one connection driven by a background task:
//! - outgoing commands are queued on an unbounded channel, so sends never
//!   block and frames issued before the connection is up go out once it is
//! - incoming relay frames are turned into [`RoomEvent`]s
//!
//! The room is `Joining` until the relay acknowledges with a `Joined`
//! frame. A dropped connection ends with [`RoomEvent::Closed`]; there is
//! no reconnect.
//!
//! Reference: Kleppmann, Chapter 5: Replication

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{room_key, PeerId, RoomEvent, RoomHandle, RoomLink, Transport, TransportError};
use crate::model::PartyCode;
use crate::protocol::Channel;
use crate::relay::{FrameKind, RelayFrame};

enum Command {
    Send(RelayFrame),
    Close,
}

/// WebSocket client transport.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    /// `url` is the relay endpoint, e.g. `ws://127.0.0.1:9090`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    fn join(&self, app_id: &str, code: &PartyCode) -> Result<RoomLink, TransportError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let room = room_key(app_id, code);
        let peer = Uuid::new_v4();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        runtime.spawn(run_connection(
            self.url.clone(),
            room.clone(),
            peer,
            cmd_rx,
            event_tx,
        ));

        Ok(RoomLink {
            handle: Arc::new(WsRoom {
                room,
                peer,
                commands: cmd_tx,
            }),
            events: event_rx,
        })
    }
}

async fn run_connection(
    url: String,
    room: String,
    peer: PeerId,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<RoomEvent>,
) {
    if let Err(e) = drive(&url, &room, peer, &mut commands, &events).await {
        log::warn!("Relay connection for {room} ended: {e}");
    }
    let _ = events.send(RoomEvent::Closed);
}

async fn drive(
    url: &str,
    room: &str,
    peer: PeerId,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::UnboundedSender<RoomEvent>,
) -> Result<(), TransportError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("Connected to relay {url} as {peer}");

    let join = RelayFrame::join(room, peer).encode()?;
    ws_sender
        .send(Message::Binary(join.into()))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(Command::Send(frame)) => {
                        let bytes = frame.encode()?;
                        ws_sender
                            .send(Message::Binary(bytes.into()))
                            .await
                            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                    }
                    Some(Command::Close) | None => {
                        if let Ok(bytes) = RelayFrame::leave(room, peer).encode() {
                            let _ = ws_sender.send(Message::Binary(bytes.into())).await;
                        }
                        let _ = ws_sender.close().await;
                        log::debug!("Left relay room {room}");
                        return Ok(());
                    }
                }
            }

            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match RelayFrame::decode(&bytes) {
                            Ok(frame) => {
                                if let Some(event) = to_event(frame, peer) {
                                    if events.send(event).is_err() {
                                        // Room was abandoned without leave()
                                        return Ok(());
                                    }
                                }
                            }
                            Err(e) => log::warn!("Undecodable frame from relay: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(TransportError::ConnectionClosed),
                    Some(Err(e)) => return Err(TransportError::ConnectionFailed(e.to_string())),
                    _ => {}
                }
            }
        }
    }
}

fn to_event(frame: RelayFrame, me: PeerId) -> Option<RoomEvent> {
    match frame.kind {
        FrameKind::Joined => Some(RoomEvent::Joined),
        FrameKind::PeerJoined if frame.from != me => Some(RoomEvent::PeerJoined(frame.from)),
        FrameKind::PeerLeft if frame.from != me => Some(RoomEvent::PeerLeft(frame.from)),
        FrameKind::Data if frame.is_for(&me) => match frame.data_channel() {
            Ok(channel) => Some(RoomEvent::Message {
                channel,
                from: frame.from,
                body: frame.body,
            }),
            Err(e) => {
                log::debug!("Ignoring data frame: {e}");
                None
            }
        },
        _ => None,
    }
}

struct WsRoom {
    room: String,
    peer: PeerId,
    commands: mpsc::UnboundedSender<Command>,
}

impl RoomHandle for WsRoom {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    fn send(&self, channel: Channel, body: Vec<u8>, to: Option<PeerId>) -> Result<(), TransportError> {
        let frame = RelayFrame::data(self.room.as_str(), self.peer, to, channel, body);
        self.commands
            .send(Command::Send(frame))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn leave(&self) -> Result<(), TransportError> {
        self.commands
            .send(Command::Close)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}
