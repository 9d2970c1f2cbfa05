//! Binary frames exchanged between peers and the relay.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────┬──────────┬──────────┬───────────┬──────────┬──────────┐
//! │ kind │ room     │ from     │ to        │ channel  │ body     │
//! │ 1 B  │ string   │ 16 bytes │ 0/16 B    │ string   │ variable │
//! └──────┴──────────┴──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! `body` is the JSON-encoded replication message; the relay never looks
//! inside it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{Channel, ProtocolError};
use crate::transport::PeerId;

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Peer asks to enter `room`
    Join = 1,
    /// Relay confirms the join
    Joined = 2,
    /// Another peer is in the room
    PeerJoined = 3,
    /// Another peer left the room
    PeerLeft = 4,
    /// Channel message, broadcast or directed
    Data = 5,
    /// Peer leaves the room
    Leave = 6,
    Ping = 7,
    Pong = 8,
}

/// One relay frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub kind: FrameKind,
    pub room: String,
    /// Peer the frame is about (sender for `Data`)
    pub from: PeerId,
    /// Recipient; `None` means every other peer in the room
    pub to: Option<PeerId>,
    pub channel: String,
    pub body: Vec<u8>,
}

impl RelayFrame {
    fn control(kind: FrameKind, room: impl Into<String>, from: PeerId) -> Self {
        Self {
            kind,
            room: room.into(),
            from,
            to: None,
            channel: String::new(),
            body: Vec::new(),
        }
    }

    pub fn join(room: impl Into<String>, peer: PeerId) -> Self {
        Self::control(FrameKind::Join, room, peer)
    }

    pub fn joined(room: impl Into<String>, peer: PeerId) -> Self {
        Self::control(FrameKind::Joined, room, peer)
    }

    pub fn peer_joined(room: impl Into<String>, peer: PeerId) -> Self {
        Self::control(FrameKind::PeerJoined, room, peer)
    }

    pub fn peer_left(room: impl Into<String>, peer: PeerId) -> Self {
        Self::control(FrameKind::PeerLeft, room, peer)
    }

    pub fn leave(room: impl Into<String>, peer: PeerId) -> Self {
        Self::control(FrameKind::Leave, room, peer)
    }

    pub fn ping(peer: PeerId) -> Self {
        Self::control(FrameKind::Ping, String::new(), peer)
    }

    pub fn pong(peer: PeerId) -> Self {
        Self::control(FrameKind::Pong, String::new(), peer)
    }

    /// Channel message from `from`, to one peer or the whole room.
    pub fn data(
        room: impl Into<String>,
        from: PeerId,
        to: Option<PeerId>,
        channel: Channel,
        body: Vec<u8>,
    ) -> Self {
        Self {
            kind: FrameKind::Data,
            room: room.into(),
            from,
            to,
            channel: channel.name().to_string(),
            body,
        }
    }

    /// Whether `peer` should see this frame. Peers never see their own
    /// frames; directed frames reach only their recipient.
    pub fn is_for(&self, peer: &Uuid) -> bool {
        self.from != *peer && self.to.map_or(true, |to| to == *peer)
    }

    /// Parsed channel of a `Data` frame.
    pub fn data_channel(&self) -> Result<Channel, ProtocolError> {
        if self.kind != FrameKind::Data {
            return Err(ProtocolError::InvalidFrame(format!(
                "{:?} frame has no channel",
                self.kind
            )));
        }
        Channel::from_name(&self.channel)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_roundtrip() {
        let from = Uuid::new_v4();
        let to = Uuid::new_v4();
        let frame = RelayFrame::data("app:ABCD", from, Some(to), Channel::Sync, b"{}".to_vec());
        let decoded = RelayFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.data_channel().unwrap(), Channel::Sync);
    }

    #[test]
    fn test_is_for_filters_sender_and_recipient() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        let broadcast = RelayFrame::data("r", a, None, Channel::Update, Vec::new());
        assert!(!broadcast.is_for(&a));
        assert!(broadcast.is_for(&b));
        assert!(broadcast.is_for(&c));

        let directed = RelayFrame::data("r", a, Some(b), Channel::Sync, Vec::new());
        assert!(directed.is_for(&b));
        assert!(!directed.is_for(&c));
    }

    #[test]
    fn test_control_frame_has_no_channel() {
        let frame = RelayFrame::join("r", Uuid::new_v4());
        assert!(matches!(frame.data_channel(), Err(ProtocolError::InvalidFrame(_))));
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let mut frame = RelayFrame::data("r", Uuid::new_v4(), None, Channel::Sync, Vec::new());
        frame.channel = "presence".into();
        assert!(matches!(frame.data_channel(), Err(ProtocolError::UnknownChannel(_))));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(RelayFrame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_frame_kind_values() {
        assert_eq!(FrameKind::Join as u8, 1);
        assert_eq!(FrameKind::Data as u8, 5);
        assert_eq!(FrameKind::Pong as u8, 8);
    }
}
