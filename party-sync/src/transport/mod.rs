//! Peer-to-peer transport capability consumed by the room manager.
//!
//! A transport joins a room by `(app id, party code)` and hands back a
//! [`RoomLink`]: a handle for sending on named channels and a stream of
//! [`RoomEvent`]s. Delivery is unordered and unacknowledged; messages to
//! peers that have gone away are dropped.
//!
//! - [`memory`]: in-process hub, used by tests and single-process demos
//! - [`ws`]: WebSocket client to a [`RelayServer`](crate::relay::RelayServer)

pub mod memory;
pub mod ws;

pub use memory::{MemoryHub, MemoryTransport};
pub use ws::WsTransport;

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::PartyCode;
use crate::protocol::{Channel, ProtocolError};

/// Transport-assigned address of a peer within a room.
pub type PeerId = Uuid;

/// Something that happened in a joined room.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// The room is established and channels are open
    Joined,
    /// A peer became reachable
    PeerJoined(PeerId),
    /// A peer went away
    PeerLeft(PeerId),
    /// A message arrived on a channel
    Message {
        channel: Channel,
        from: PeerId,
        body: Vec<u8>,
    },
    /// The transport lost the room; no further events follow
    Closed,
}

/// Sending side of a joined room.
pub trait RoomHandle: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Send `body` on `channel` to one peer, or to every peer if `to` is `None`.
    fn send(&self, channel: Channel, body: Vec<u8>, to: Option<PeerId>) -> Result<(), TransportError>;

    /// Leave the room. Best effort.
    fn leave(&self) -> Result<(), TransportError>;
}

/// A joined (or joining) room.
pub struct RoomLink {
    pub handle: Arc<dyn RoomHandle>,
    pub events: mpsc::UnboundedReceiver<RoomEvent>,
}

/// Room-join capability.
pub trait Transport: Send + Sync {
    /// Request a room for `code`. The room is usable once
    /// [`RoomEvent::Joined`] arrives on the returned link.
    fn join(&self, app_id: &str, code: &PartyCode) -> Result<RoomLink, TransportError>;
}

/// Rooms of different applications never meet.
pub fn room_key(app_id: &str, code: &PartyCode) -> String {
    format!("{app_id}:{code}")
}

/// Transport errors.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Transport needs a tokio runtime and none is running
    NoRuntime,
    ConnectionFailed(String),
    ConnectionClosed,
    SendFailed(String),
    Protocol(ProtocolError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRuntime => write!(f, "No async runtime available"),
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::SendFailed(e) => write!(f, "Send failed: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        TransportError::Protocol(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_key() {
        assert_eq!(room_key("dice-party-v1", &PartyCode::new("abcd")), "dice-party-v1:ABCD");
    }

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::ConnectionClosed.to_string(), "Connection closed");
        let e: TransportError = ProtocolError::UnknownChannel("x".into()).into();
        assert_eq!(e.to_string(), "Protocol error: Unknown channel: x");
    }
}
