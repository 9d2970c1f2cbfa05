//! Per-room fan-out for the relay.
//!
//! Every room shares one tokio broadcast channel. Frames are encoded once
//! and each connection filters out what is not addressed to it.
//!
//! Reference: Patterson & Hennessy, Section 6.4 (Interconnection Networks)

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use super::frame::RelayFrame;
use crate::protocol::ProtocolError;
use crate::transport::PeerId;

/// Pre-encoded frame with its routing header.
#[derive(Debug)]
pub struct Outbound {
    pub from: PeerId,
    pub to: Option<PeerId>,
    pub bytes: Vec<u8>,
}

impl Outbound {
    /// Peers never receive their own frames.
    pub fn is_for(&self, peer: &PeerId) -> bool {
        self.from != *peer && self.to.map_or(true, |to| to == *peer)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_peers: usize,
}

/// Fan-out group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Outbound>>,
    peers: RwLock<HashSet<PeerId>>,
    capacity: usize,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames a slow peer may fall behind
    /// before it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// Add a peer and return its receiver.
    pub async fn add_peer(&self, peer: PeerId) -> broadcast::Receiver<Arc<Outbound>> {
        self.peers.write().await.insert(peer);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer: &PeerId) -> bool {
        self.peers.write().await.remove(peer)
    }

    /// Encode and fan out a frame. Returns the number of receivers.
    pub fn broadcast(&self, frame: &RelayFrame) -> Result<usize, ProtocolError> {
        let outbound = Arc::new(Outbound {
            from: frame.from,
            to: frame.to,
            bytes: frame.encode()?,
        });
        let count = self.sender.send(outbound).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    pub fn record_dropped(&self, n: u64) {
        self.frames_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.peers.read().await.iter().copied().collect()
    }

    pub async fn has_peer(&self, peer: &PeerId) -> bool {
        self.peers.read().await.contains(peer)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A successful room join.
pub struct Membership {
    pub group: Arc<BroadcastGroup>,
    pub receiver: broadcast::Receiver<Arc<Outbound>>,
    /// Peers already in the room when this one joined
    pub existing: Vec<PeerId>,
}

/// Maps room keys to broadcast groups.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    capacity: usize,
    max_peers: usize,
}

impl RoomRegistry {
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            max_peers,
        }
    }

    /// Add `peer` to `room`, creating the room if needed.
    ///
    /// Returns `None` when the room is full. Creation and membership happen
    /// under one lock so a concurrent cleanup cannot orphan the peer.
    pub async fn join(&self, room: &str, peer: PeerId) -> Option<Membership> {
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .entry(room.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.capacity)))
            .clone();

        let existing = group.peers().await;
        if existing.len() >= self.max_peers {
            return None;
        }
        let receiver = group.add_peer(peer).await;
        Some(Membership {
            group,
            receiver,
            existing,
        })
    }

    /// Remove `peer` from `room`, announce its departure and drop the room
    /// once empty. Returns whether the room was removed.
    pub async fn leave(&self, room: &str, peer: &PeerId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(group) = rooms.get(room).cloned() else {
            return false;
        };

        if group.remove_peer(peer).await {
            if let Err(e) = group.broadcast(&RelayFrame::peer_left(room, *peer)) {
                log::warn!("Could not announce departure of {peer}: {e}");
            }
        }

        if group.peer_count().await == 0 {
            rooms.remove(room);
            log::info!("Room {room} removed (empty)");
            return true;
        }
        false
    }

    pub async fn get(&self, room: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Channel;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let peer = Uuid::new_v4();
        let _rx = group.add_peer(peer).await;
        assert!(group.has_peer(&peer).await);
        assert!(group.remove_peer(&peer).await);
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_with_filtering() {
        let group = BroadcastGroup::new(16);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut rx_a = group.add_peer(a).await;
        let mut rx_b = group.add_peer(b).await;
        let mut rx_c = group.add_peer(c).await;

        let frame = RelayFrame::data("r", a, Some(b), Channel::Sync, b"{}".to_vec());
        assert_eq!(group.broadcast(&frame).unwrap(), 3);

        // Every receiver sees the frame; only the addressee keeps it.
        assert!(!rx_a.recv().await.unwrap().is_for(&a));
        assert!(rx_b.recv().await.unwrap().is_for(&b));
        let out = rx_c.recv().await.unwrap();
        assert!(!out.is_for(&c));
        assert_eq!(RelayFrame::decode(&out.bytes).unwrap(), frame);
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(16);
        let peer = Uuid::new_v4();
        let _rx = group.add_peer(peer).await;
        group.broadcast(&RelayFrame::ping(peer)).unwrap();
        group.broadcast(&RelayFrame::ping(peer)).unwrap();
        group.record_dropped(3);

        let stats = group.stats().await;
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.frames_dropped, 3);
        assert_eq!(stats.active_peers, 1);
        assert_eq!(group.capacity(), 16);
    }

    #[tokio::test]
    async fn test_registry_join_reports_existing() {
        let registry = RoomRegistry::new(16, 10);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let first = registry.join("app:ABCD", a).await.unwrap();
        assert!(first.existing.is_empty());
        let second = registry.join("app:ABCD", b).await.unwrap();
        assert_eq!(second.existing, vec![a]);
        assert!(Arc::ptr_eq(&first.group, &second.group));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_registry_rooms_are_isolated() {
        let registry = RoomRegistry::new(16, 10);
        let _a = registry.join("app:ABCD", Uuid::new_v4()).await.unwrap();
        let _b = registry.join("app:WXYZ", Uuid::new_v4()).await.unwrap();
        assert_eq!(registry.room_count().await, 2);
        let rooms = registry.active_rooms().await;
        assert!(rooms.contains(&"app:ABCD".to_string()));
        assert!(rooms.contains(&"app:WXYZ".to_string()));
    }

    #[tokio::test]
    async fn test_registry_leave_announces_and_cleans_up() {
        let registry = RoomRegistry::new(16, 10);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let _ma = registry.join("r", a).await.unwrap();
        let mut mb = registry.join("r", b).await.unwrap();

        assert!(!registry.leave("r", &a).await);
        let out = mb.receiver.recv().await.unwrap();
        let frame = RelayFrame::decode(&out.bytes).unwrap();
        assert_eq!(frame, RelayFrame::peer_left("r", a));
        assert!(out.is_for(&b));

        assert!(registry.leave("r", &b).await);
        assert_eq!(registry.room_count().await, 0);
        assert!(!registry.leave("r", &b).await);
    }

    #[tokio::test]
    async fn test_registry_room_full() {
        let registry = RoomRegistry::new(16, 1);
        let _a = registry.join("r", Uuid::new_v4()).await.unwrap();
        assert!(registry.join("r", Uuid::new_v4()).await.is_none());
    }
}
