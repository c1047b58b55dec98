//! Combined peer registry and room directory.
//!
//! Both maps live in one structure so a single lock can guard every
//! mutation, keeping the two sides of membership consistent at all times:
//! a peer id appears in a room's member list iff that room id is in the
//! peer's own room set. [`crate::relay::RelayState`] owns the lock; the
//! methods here are synchronous and never touch the network.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use axum::extract::ws::Message;
use muster_proto::peer::PeerId;
use muster_proto::room::RoomId;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A connected peer as tracked by the directory.
struct Peer {
    /// Sender half of the connection's outbound channel. Owned here
    /// exclusively; routing hands out clones.
    channel: mpsc::UnboundedSender<Message>,
    /// Rooms this peer currently belongs to.
    rooms: HashSet<RoomId>,
    /// Instant of the most recent decodable inbound message.
    last_seen: Instant,
}

/// Snapshot taken when a peer joins a room, used for the `joined`
/// broadcast. Member list and channels are captured in one critical
/// section so they can never disagree mid-broadcast.
pub struct JoinSnapshot {
    /// Member ids in join order, including the joining peer.
    pub members: Vec<PeerId>,
    /// Outbound channels of those members.
    pub channels: Vec<mpsc::UnboundedSender<Message>>,
}

/// The relay's entire mutable state: who is connected and which rooms
/// they are in.
#[derive(Default)]
pub struct Directory {
    peers: HashMap<PeerId, Peer>,
    /// Member lists in join order. A room exists here iff it has at least
    /// one member.
    rooms: HashMap<RoomId, Vec<PeerId>>,
}

impl Directory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a peer: allocates a fresh id and stores the peer with no
    /// rooms and a current `last_seen`.
    ///
    /// Id generation retries until the id is unused; an existing peer is
    /// never overwritten.
    pub fn register(&mut self, channel: mpsc::UnboundedSender<Message>) -> PeerId {
        let mut id = PeerId::generate();
        while self.peers.contains_key(&id) {
            id = PeerId::generate();
        }
        self.peers.insert(
            id.clone(),
            Peer {
                channel,
                rooms: HashSet::new(),
                last_seen: Instant::now(),
            },
        );
        id
    }

    /// Refreshes a peer's liveness timestamp. No-op when the peer is
    /// already gone; racing teardown is expected, not an error.
    pub fn touch(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.last_seen = Instant::now();
        }
    }

    /// Returns a clone of the peer's outbound channel, if registered.
    #[must_use]
    pub fn channel_of(&self, peer_id: &PeerId) -> Option<mpsc::UnboundedSender<Message>> {
        self.peers.get(peer_id).map(|peer| peer.channel.clone())
    }

    /// Adds a peer to a room (creating the room on first join) and
    /// returns the broadcast snapshot. Rejoining an already-joined room
    /// leaves the membership untouched but still returns the snapshot.
    ///
    /// Returns `None` when the peer is no longer registered (the join
    /// raced teardown).
    pub fn join(&mut self, peer_id: &PeerId, room_id: RoomId) -> Option<JoinSnapshot> {
        if !self.peers.contains_key(peer_id) {
            return None;
        }
        let members = self.rooms.entry(room_id.clone()).or_default();
        if !members.contains(peer_id) {
            members.push(peer_id.clone());
        }
        let members = members.clone();
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.rooms.insert(room_id);
        }
        let channels = members
            .iter()
            .filter_map(|member| self.peers.get(member))
            .map(|peer| peer.channel.clone())
            .collect();
        Some(JoinSnapshot { members, channels })
    }

    /// Removes a peer from every room it belongs to; rooms left empty are
    /// deleted immediately. Idempotent.
    pub fn leave_all(&mut self, peer_id: &PeerId) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        let rooms = std::mem::take(&mut peer.rooms);
        for room_id in &rooms {
            let emptied = match self.rooms.get_mut(room_id) {
                Some(members) => {
                    members.retain(|member| member != peer_id);
                    members.is_empty()
                }
                None => false,
            };
            if emptied {
                self.rooms.remove(room_id);
            }
        }
    }

    /// Drops the peer's registry entry. Idempotent; returns whether the
    /// peer was present.
    pub fn unregister(&mut self, peer_id: &PeerId) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    /// Member ids of a room in join order; empty when the room is absent.
    #[must_use]
    pub fn members(&self, room_id: &RoomId) -> Vec<PeerId> {
        self.rooms.get(room_id).cloned().unwrap_or_default()
    }

    /// Rooms the given peer belongs to; empty when the peer is absent.
    #[must_use]
    pub fn rooms_of(&self, peer_id: &PeerId) -> Vec<RoomId> {
        self.peers
            .get(peer_id)
            .map(|peer| peer.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of peers whose last activity lies further back than `window`.
    #[must_use]
    pub fn idle_peers(&self, window: Duration) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.last_seen.elapsed() > window)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether a peer id is currently registered.
    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// All currently registered peer ids.
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    /// All room ids with at least one member.
    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.keys().cloned().collect()
    }

    /// Number of registered peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of live rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
