//! In-process transport.
//!
//! A [`MemoryHub`] stands in for the network: every [`MemoryTransport`]
//! created from the same hub can meet the others in rooms. Events are
//! delivered synchronously into each peer's unbounded queue, so tests can
//! drive replication deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{room_key, PeerId, RoomEvent, RoomHandle, RoomLink, Transport, TransportError};
use crate::model::PartyCode;
use crate::protocol::Channel;

struct Member {
    peer: PeerId,
    events: mpsc::UnboundedSender<RoomEvent>,
}

type Rooms = HashMap<String, Vec<Member>>;

/// Shared in-process "network".
#[derive(Clone, Default)]
pub struct MemoryHub {
    rooms: Arc<Mutex<Rooms>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport attached to this hub.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport { hub: self.clone() }
    }

    /// Number of peers in `room`.
    pub fn peer_count(&self, room: &str) -> usize {
        self.lock().get(room).map_or(0, Vec::len)
    }

    pub fn room_count(&self) -> usize {
        self.lock().len()
    }

    /// Cut `peer` off from every room, as if its network went away.
    ///
    /// The peer receives [`RoomEvent::Closed`]; the others see it leave.
    /// Returns whether the peer was connected.
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        let mut rooms = self.lock();
        let mut found = false;
        for members in rooms.values_mut() {
            if let Some(pos) = members.iter().position(|m| m.peer == *peer) {
                let gone = members.remove(pos);
                let _ = gone.events.send(RoomEvent::Closed);
                for other in members.iter() {
                    let _ = other.events.send(RoomEvent::PeerLeft(*peer));
                }
                found = true;
            }
        }
        rooms.retain(|_, members| !members.is_empty());
        found
    }

    fn lock(&self) -> MutexGuard<'_, Rooms> {
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Transport endpoint on a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
}

impl MemoryTransport {
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

impl Transport for MemoryTransport {
    fn join(&self, app_id: &str, code: &PartyCode) -> Result<RoomLink, TransportError> {
        let room = room_key(app_id, code);
        let peer = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut rooms = self.hub.lock();
            let members = rooms.entry(room.clone()).or_default();
            let _ = tx.send(RoomEvent::Joined);
            for other in members.iter() {
                let _ = tx.send(RoomEvent::PeerJoined(other.peer));
                let _ = other.events.send(RoomEvent::PeerJoined(peer));
            }
            members.push(Member { peer, events: tx });
        }
        log::debug!("Memory peer {peer} joined {room}");

        Ok(RoomLink {
            handle: Arc::new(MemoryRoom {
                hub: self.hub.clone(),
                room,
                peer,
            }),
            events: rx,
        })
    }
}

struct MemoryRoom {
    hub: MemoryHub,
    room: String,
    peer: PeerId,
}

impl RoomHandle for MemoryRoom {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    fn send(&self, channel: Channel, body: Vec<u8>, to: Option<PeerId>) -> Result<(), TransportError> {
        let rooms = self.hub.lock();
        let members = rooms.get(&self.room).ok_or(TransportError::ConnectionClosed)?;
        if !members.iter().any(|m| m.peer == self.peer) {
            return Err(TransportError::ConnectionClosed);
        }

        for member in members {
            if member.peer == self.peer || to.is_some_and(|to| to != member.peer) {
                continue;
            }
            let _ = member.events.send(RoomEvent::Message {
                channel,
                from: self.peer,
                body: body.clone(),
            });
        }
        Ok(())
    }

    fn leave(&self) -> Result<(), TransportError> {
        let mut rooms = self.hub.lock();
        let Some(members) = rooms.get_mut(&self.room) else {
            return Ok(());
        };
        members.retain(|m| m.peer != self.peer);
        for other in members.iter() {
            let _ = other.events.send(RoomEvent::PeerLeft(self.peer));
        }
        if members.is_empty() {
            rooms.remove(&self.room);
        }
        Ok(())
    }
}
