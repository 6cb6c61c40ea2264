//! Per-case fan-out for the relay server.
//!
//! Every peer of a case room holds a receiver on one tokio broadcast
//! channel. Frames carry the id of the peer that produced them so each
//! receiver can skip its own traffic; server-originated frames have no
//! origin and reach everyone.
//!
//! A receiver that falls more than `capacity` frames behind lags and
//! loses the oldest frames instead of stalling the room.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::presence::{Collaborator, PresenceEntry};

/// One encoded text frame travelling through a room.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Producing peer, `None` for frames generated by the server.
    pub origin: Option<Uuid>,
    pub text: Arc<str>,
}

impl Frame {
    /// Whether `peer_id` should receive this frame.
    pub fn is_for(&self, peer_id: Uuid) -> bool {
        self.origin != Some(peer_id)
    }
}

/// A connected socket in a room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomPeer {
    pub peer_id: Uuid,
    pub user: Collaborator,
    pub joined_at: DateTime<Utc>,
}

impl RoomPeer {
    pub fn new(user: Collaborator) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            user,
            joined_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_peers: usize,
}

/// Atomic counters, read via [`BroadcastGroup::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// The broadcast group of one case.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: RwLock<HashMap<Uuid, RoomPeer>>,
    capacity: usize,
    max_peers: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            max_peers,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Admit a peer, returning its receiver, or `None` if the room is full.
    pub async fn try_add_peer(&self, peer: RoomPeer) -> Option<broadcast::Receiver<Frame>> {
        let mut peers = self.peers.write().await;
        if peers.len() >= self.max_peers {
            return None;
        }
        peers.insert(peer.peer_id, peer);
        Some(self.sender.subscribe())
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<RoomPeer> {
        self.peers.write().await.remove(peer_id)
    }

    /// Send `text` to every peer but `origin`. Returns the receiver count.
    pub fn broadcast_from(&self, origin: Uuid, text: impl Into<Arc<str>>) -> usize {
        self.send(Frame {
            origin: Some(origin),
            text: text.into(),
        })
    }

    /// Send `text` to every peer.
    pub fn broadcast_all(&self, text: impl Into<Arc<str>>) -> usize {
        self.send(Frame {
            origin: None,
            text: text.into(),
        })
    }

    fn send(&self, frame: Frame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, skipped: u64) {
        self.stats.frames_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    /// Peers ordered by join time.
    pub async fn peers(&self) -> Vec<RoomPeer> {
        let mut peers: Vec<RoomPeer> = self.peers.read().await.values().cloned().collect();
        peers.sort_by_key(|p| p.joined_at);
        peers
    }

    /// One presence entry per collaborator, however many sockets they hold.
    pub async fn presence_snapshot(&self) -> Vec<PresenceEntry> {
        let mut seen = HashMap::new();
        for peer in self.peers().await {
            seen.entry(peer.user.id.clone())
                .or_insert_with(|| PresenceEntry::joined(peer.user, peer.joined_at));
        }
        let mut entries: Vec<PresenceEntry> = seen.into_values().collect();
        entries.sort_by(|a, b| a.last_activity.cmp(&b.last_activity).then(a.id.cmp(&b.id)));
        entries
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }
}

/// Maps case ids to their broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<u64, Arc<BroadcastGroup>>>,
    capacity: usize,
    max_peers: usize,
}

impl RoomManager {
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            max_peers,
        }
    }

    /// Admit `peer` to the room of `case_id`, creating the room if needed.
    ///
    /// Runs under the room map lock, so a concurrent [`RoomManager::leave`]
    /// cannot drop the room between lookup and admission. Returns `None`
    /// when the room is full.
    pub async fn join(
        &self,
        case_id: u64,
        peer: RoomPeer,
    ) -> Option<(Arc<BroadcastGroup>, broadcast::Receiver<Frame>)> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(case_id)
            .or_insert_with(|| {
                log::info!("Opening room for case {case_id}");
                Arc::new(BroadcastGroup::new(self.capacity, self.max_peers))
            })
            .clone();
        let rx = room.try_add_peer(peer).await?;
        Some((room, rx))
    }

    /// Remove a peer, closing the room once it is empty.
    ///
    /// Returns the room if it still has peers.
    pub async fn leave(&self, case_id: u64, peer_id: &Uuid) -> Option<Arc<BroadcastGroup>> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get(&case_id)?.clone();
        room.remove_peer(peer_id).await;
        if room.peer_count().await == 0 {
            rooms.remove(&case_id);
            log::info!("Closed empty room for case {case_id}");
            return None;
        }
        Some(room)
    }

    pub async fn get(&self, case_id: u64) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(&case_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_cases(&self) -> Vec<u64> {
        let mut cases: Vec<u64> = self.rooms.read().await.keys().copied().collect();
        cases.sort_unstable();
        cases
    }
}
