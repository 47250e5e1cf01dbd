//! Resource registry.
//!
//! In-memory indices of every live room, peer, transport, producer and
//! consumer. Each media resource is indexed three ways: globally by id, in
//! its room, and in its owning peer. All removals go through one private
//! `deregister` step so the three indices cannot drift.
//!
//! The registry performs no media-engine calls. Removal methods hand back a
//! [`Detached`] bundle of engine handles that the caller closes (in cascade
//! order) after releasing the registry lock.

use crate::errors::SfuError;
use crate::media::{MediaConsumer, MediaKind, MediaProducer, MediaRouter, MediaTransport};
use crate::types::{ConsumerId, PeerId, ProducerId, RoomKey, TransportId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Memoized (possibly in-flight) router of a room.
pub type RouterCell = Arc<OnceCell<Arc<dyn MediaRouter>>>;

/// Direction of a transport from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// Participant media toggles shown to other participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: false,
        }
    }
}

/// One participant toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStateChange {
    Audio(bool),
    Video(bool),
    ScreenShare(bool),
}

impl MediaState {
    pub fn apply(&mut self, change: MediaStateChange) {
        match change {
            MediaStateChange::Audio(enabled) => self.audio_enabled = enabled,
            MediaStateChange::Video(enabled) => self.video_enabled = enabled,
            MediaStateChange::ScreenShare(enabled) => self.screen_sharing = enabled,
        }
    }
}

/// Peer listing entry returned to joining participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub display_name: String,
    pub media_state: MediaState,
    pub joined_at: DateTime<Utc>,
}

/// Producer listing entry returned to joining participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
}

/// Resource counts, globally or for one room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub rooms: usize,
    pub peers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

/// What a peer removal took down, for broadcasting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerClosed {
    pub peer_id: PeerId,
    pub room_key: RoomKey,
    pub producer_ids: Vec<ProducerId>,
    /// Consumers of other peers closed because they referenced this peer's
    /// producers.
    pub remote_consumers: Vec<(PeerId, ConsumerId)>,
    /// The peer was the last one; room and router are gone.
    pub room_closed: bool,
}

/// What a producer removal took down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerClosed {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub room_key: RoomKey,
    pub consumers: Vec<(PeerId, ConsumerId)>,
}

/// Identifies one media resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Transport(TransportId),
    Producer(ProducerId),
    Consumer(ConsumerId),
}

/// Engine handles removed from the registry, closed by the caller in cascade
/// order once the registry lock is released.
#[derive(Default)]
pub struct Detached {
    consumers: Vec<Arc<dyn MediaConsumer>>,
    producers: Vec<Arc<dyn MediaProducer>>,
    transports: Vec<Arc<dyn MediaTransport>>,
    routers: Vec<RouterCell>,
}

impl Detached {
    fn push(&mut self, removed: Deregistered) {
        match removed {
            Deregistered::Transport(handle) => self.transports.push(handle),
            Deregistered::Producer(handle) => self.producers.push(handle),
            Deregistered::Consumer(handle) => self.consumers.push(handle),
        }
    }

    fn merge(&mut self, other: Detached) {
        self.consumers.extend(other.consumers);
        self.producers.extend(other.producers);
        self.transports.extend(other.transports);
        self.routers.extend(other.routers);
    }

    /// Close consumers, then producers, then transports, then routers.
    ///
    /// A router still being created is skipped; its creator notices the room
    /// is gone and closes it.
    pub async fn close(self) {
        for consumer in self.consumers {
            consumer.close().await;
        }
        for producer in self.producers {
            producer.close().await;
        }
        for transport in self.transports {
            transport.close().await;
        }
        for cell in self.routers {
            if let Some(router) = cell.get() {
                router.close().await;
            }
        }
    }
}

enum Deregistered {
    Transport(Arc<dyn MediaTransport>),
    Producer(Arc<dyn MediaProducer>),
    Consumer(Arc<dyn MediaConsumer>),
}

struct RoomEntry {
    router: RouterCell,
    max_participants: u32,
    /// Join order.
    peers: Vec<PeerId>,
    transports: HashSet<TransportId>,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

struct PeerEntry {
    room_key: RoomKey,
    display_name: String,
    media_state: MediaState,
    joined_at: DateTime<Utc>,
    transports: Vec<TransportId>,
    producers: Vec<ProducerId>,
    consumers: Vec<ConsumerId>,
}

/// A registered transport.
pub struct TransportEntry {
    pub handle: Arc<dyn MediaTransport>,
    pub peer_id: PeerId,
    pub room_key: RoomKey,
    pub direction: TransportDirection,
}

/// A registered producer.
pub struct ProducerEntry {
    pub handle: Arc<dyn MediaProducer>,
    pub peer_id: PeerId,
    pub room_key: RoomKey,
    pub transport_id: TransportId,
    pub kind: MediaKind,
}

/// A registered consumer.
pub struct ConsumerEntry {
    pub handle: Arc<dyn MediaConsumer>,
    pub peer_id: PeerId,
    pub room_key: RoomKey,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub paused: bool,
}

/// Result of [`ResourceRegistry::add_peer`].
pub struct PeerAdded {
    pub router: RouterCell,
    pub room_created: bool,
}

/// Authoritative indices of rooms, peers and media resources.
#[derive(Default)]
pub struct ResourceRegistry {
    rooms: HashMap<RoomKey, RoomEntry>,
    peers: HashMap<PeerId, PeerEntry>,
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
}

impl ResourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Register a peer in a room, creating the room entry if needed.
    ///
    /// Capacity is checked before anything is registered. An existing room
    /// keeps the participant limit it was created with.
    ///
    /// # Errors
    ///
    /// - `SfuError::AlreadyJoined` if the peer is registered anywhere
    /// - `SfuError::RoomFull` if the room is at its limit
    pub fn add_peer(
        &mut self,
        room_key: &RoomKey,
        peer_id: PeerId,
        display_name: String,
        max_participants: u32,
    ) -> Result<PeerAdded, SfuError> {
        if let Some(existing) = self.peers.get(&peer_id) {
            return Err(SfuError::AlreadyJoined(existing.room_key.to_string()));
        }

        let (limit, occupancy) = self
            .rooms
            .get(room_key)
            .map_or((max_participants, 0), |room| {
                (room.max_participants, room.peers.len())
            });
        if occupancy >= usize::try_from(limit).unwrap_or(usize::MAX) {
            return Err(SfuError::RoomFull {
                room_key: room_key.to_string(),
                max_participants: limit,
            });
        }

        let room_created = !self.rooms.contains_key(room_key);
        let room = self
            .rooms
            .entry(room_key.clone())
            .or_insert_with(|| RoomEntry {
                router: Arc::new(OnceCell::new()),
                max_participants,
                peers: Vec::new(),
                transports: HashSet::new(),
                producers: HashSet::new(),
                consumers: HashSet::new(),
            });
        room.peers.push(peer_id);
        let router = Arc::clone(&room.router);

        self.peers.insert(
            peer_id,
            PeerEntry {
                room_key: room_key.clone(),
                display_name,
                media_state: MediaState::default(),
                joined_at: Utc::now(),
                transports: Vec::new(),
                producers: Vec::new(),
                consumers: Vec::new(),
            },
        );

        Ok(PeerAdded {
            router,
            room_created,
        })
    }

    /// Router cell of a registered room.
    pub fn router_cell(&self, room_key: &RoomKey) -> Option<RouterCell> {
        self.rooms.get(room_key).map(|room| Arc::clone(&room.router))
    }

    /// Whether the room is still registered with this exact router cell.
    pub fn holds_router_cell(&self, room_key: &RoomKey, cell: &RouterCell) -> bool {
        self.rooms
            .get(room_key)
            .is_some_and(|room| Arc::ptr_eq(&room.router, cell))
    }

    pub fn peer_room(&self, peer_id: PeerId) -> Option<&RoomKey> {
        self.peers.get(&peer_id).map(|peer| &peer.room_key)
    }

    pub fn transport(&self, id: TransportId) -> Option<&TransportEntry> {
        self.transports.get(&id)
    }

    pub fn producer(&self, id: ProducerId) -> Option<&ProducerEntry> {
        self.producers.get(&id)
    }

    pub fn consumer(&self, id: ConsumerId) -> Option<&ConsumerEntry> {
        self.consumers.get(&id)
    }

    /// Owning peer of a resource.
    pub fn owner(&self, id: ResourceId) -> Option<PeerId> {
        match id {
            ResourceId::Transport(id) => self.transports.get(&id).map(|e| e.peer_id),
            ResourceId::Producer(id) => self.producers.get(&id).map(|e| e.peer_id),
            ResourceId::Consumer(id) => self.consumers.get(&id).map(|e| e.peer_id),
        }
    }

    /// # Errors
    ///
    /// `SfuError::PeerNotFound` if the peer is gone or moved to another room.
    pub fn register_transport(
        &mut self,
        peer_id: PeerId,
        room_key: &RoomKey,
        direction: TransportDirection,
        handle: Arc<dyn MediaTransport>,
    ) -> Result<(), SfuError> {
        let id = handle.id();
        let peer = self
            .peers
            .get_mut(&peer_id)
            .filter(|peer| &peer.room_key == room_key)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?;
        let room = self
            .rooms
            .get_mut(room_key)
            .ok_or_else(|| SfuError::RoomNotFound(room_key.to_string()))?;

        peer.transports.push(id);
        room.transports.insert(id);
        self.transports.insert(
            id,
            TransportEntry {
                handle,
                peer_id,
                room_key: room_key.clone(),
                direction,
            },
        );
        Ok(())
    }

    /// # Errors
    ///
    /// `SfuError::TransportNotFound` if the transport is gone or no longer
    /// owned by the peer.
    pub fn register_producer(
        &mut self,
        peer_id: PeerId,
        transport_id: TransportId,
        handle: Arc<dyn MediaProducer>,
    ) -> Result<(), SfuError> {
        let room_key = self
            .transports
            .get(&transport_id)
            .filter(|t| t.peer_id == peer_id)
            .map(|t| t.room_key.clone())
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;
        let (peer, room) = self.peer_and_room_mut(peer_id, &room_key)?;

        let id = handle.id();
        peer.producers.push(id);
        room.producers.insert(id);
        self.producers.insert(
            id,
            ProducerEntry {
                kind: handle.kind(),
                handle,
                peer_id,
                room_key,
                transport_id,
            },
        );
        Ok(())
    }

    /// # Errors
    ///
    /// - `SfuError::TransportNotFound` if the transport is gone or not the peer's
    /// - `SfuError::ProducerNotFound` if the producer closed meanwhile
    pub fn register_consumer(
        &mut self,
        peer_id: PeerId,
        transport_id: TransportId,
        handle: Arc<dyn MediaConsumer>,
    ) -> Result<(), SfuError> {
        let room_key = self
            .transports
            .get(&transport_id)
            .filter(|t| t.peer_id == peer_id)
            .map(|t| t.room_key.clone())
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;
        let producer_id = handle.producer_id();
        if !self
            .producers
            .get(&producer_id)
            .is_some_and(|p| p.room_key == room_key)
        {
            return Err(SfuError::ProducerNotFound(producer_id.to_string()));
        }
        let (peer, room) = self.peer_and_room_mut(peer_id, &room_key)?;

        let id = handle.id();
        peer.consumers.push(id);
        room.consumers.insert(id);
        self.consumers.insert(
            id,
            ConsumerEntry {
                handle,
                peer_id,
                room_key,
                transport_id,
                producer_id,
                paused: false,
            },
        );
        Ok(())
    }

    fn peer_and_room_mut(
        &mut self,
        peer_id: PeerId,
        room_key: &RoomKey,
    ) -> Result<(&mut PeerEntry, &mut RoomEntry), SfuError> {
        let peer = self
            .peers
            .get_mut(&peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?;
        let room = self
            .rooms
            .get_mut(room_key)
            .ok_or_else(|| SfuError::RoomNotFound(room_key.to_string()))?;
        Ok((peer, room))
    }

    /// # Errors
    ///
    /// `SfuError::ConsumerNotFound` if the consumer is gone.
    pub fn set_consumer_paused(&mut self, id: ConsumerId, paused: bool) -> Result<(), SfuError> {
        let entry = self
            .consumers
            .get_mut(&id)
            .ok_or_else(|| SfuError::ConsumerNotFound(id.to_string()))?;
        entry.paused = paused;
        Ok(())
    }

    /// # Errors
    ///
    /// `SfuError::PeerNotFound` if the peer is not registered.
    pub fn update_media_state(
        &mut self,
        peer_id: PeerId,
        change: MediaStateChange,
    ) -> Result<(RoomKey, MediaState), SfuError> {
        let peer = self
            .peers
            .get_mut(&peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?;
        peer.media_state.apply(change);
        Ok((peer.room_key.clone(), peer.media_state))
    }

    /// The single removal path for media resources.
    ///
    /// Removes the resource from the global, room-side and peer-side indices
    /// together. Returns `None` if it was not registered.
    fn deregister(&mut self, id: ResourceId) -> Option<Deregistered> {
        match id {
            ResourceId::Transport(id) => {
                let entry = self.transports.remove(&id)?;
                if let Some(room) = self.rooms.get_mut(&entry.room_key) {
                    room.transports.remove(&id);
                }
                if let Some(peer) = self.peers.get_mut(&entry.peer_id) {
                    peer.transports.retain(|t| *t != id);
                }
                Some(Deregistered::Transport(entry.handle))
            }
            ResourceId::Producer(id) => {
                let entry = self.producers.remove(&id)?;
                if let Some(room) = self.rooms.get_mut(&entry.room_key) {
                    room.producers.remove(&id);
                }
                if let Some(peer) = self.peers.get_mut(&entry.peer_id) {
                    peer.producers.retain(|p| *p != id);
                }
                Some(Deregistered::Producer(entry.handle))
            }
            ResourceId::Consumer(id) => {
                let entry = self.consumers.remove(&id)?;
                if let Some(room) = self.rooms.get_mut(&entry.room_key) {
                    room.consumers.remove(&id);
                }
                if let Some(peer) = self.peers.get_mut(&entry.peer_id) {
                    peer.consumers.retain(|c| *c != id);
                }
                Some(Deregistered::Consumer(entry.handle))
            }
        }
    }

    fn consumers_of(&self, producer_id: ProducerId) -> Vec<(PeerId, ConsumerId)> {
        self.consumers
            .iter()
            .filter(|(_, c)| c.producer_id == producer_id)
            .map(|(id, c)| (c.peer_id, *id))
            .collect()
    }

    /// Remove a producer together with every consumer referencing it.
    ///
    /// # Errors
    ///
    /// `SfuError::ProducerNotFound` if the producer is not registered.
    pub fn remove_producer(
        &mut self,
        id: ProducerId,
    ) -> Result<(ProducerClosed, Detached), SfuError> {
        let (peer_id, room_key) = self
            .producers
            .get(&id)
            .map(|p| (p.peer_id, p.room_key.clone()))
            .ok_or_else(|| SfuError::ProducerNotFound(id.to_string()))?;

        let consumers = self.consumers_of(id);
        let mut detached = Detached::default();
        for (_, consumer_id) in &consumers {
            if let Some(removed) = self.deregister(ResourceId::Consumer(*consumer_id)) {
                detached.push(removed);
            }
        }
        if let Some(removed) = self.deregister(ResourceId::Producer(id)) {
            detached.push(removed);
        }

        Ok((
            ProducerClosed {
                producer_id: id,
                peer_id,
                room_key,
                consumers,
            },
            detached,
        ))
    }

    /// # Errors
    ///
    /// `SfuError::ConsumerNotFound` if the consumer is not registered.
    pub fn remove_consumer(&mut self, id: ConsumerId) -> Result<Detached, SfuError> {
        let removed = self
            .deregister(ResourceId::Consumer(id))
            .ok_or_else(|| SfuError::ConsumerNotFound(id.to_string()))?;
        let mut detached = Detached::default();
        detached.push(removed);
        Ok(detached)
    }

    /// Remove a peer and everything it owns; drop the room if it empties.
    ///
    /// Returns `None` if the peer is not registered, so repeated calls are
    /// no-ops.
    pub fn detach_peer(&mut self, peer_id: PeerId) -> Option<(PeerClosed, Detached)> {
        let (room_key, own_consumers, producer_ids, transport_ids) = {
            let peer = self.peers.get(&peer_id)?;
            (
                peer.room_key.clone(),
                peer.consumers.clone(),
                peer.producers.clone(),
                peer.transports.clone(),
            )
        };

        let remote_consumers: Vec<(PeerId, ConsumerId)> = producer_ids
            .iter()
            .flat_map(|producer_id| self.consumers_of(*producer_id))
            .filter(|(owner, _)| *owner != peer_id)
            .collect();

        let mut detached = Detached::default();
        let removals = own_consumers
            .iter()
            .map(|id| ResourceId::Consumer(*id))
            .chain(remote_consumers.iter().map(|(_, id)| ResourceId::Consumer(*id)))
            .chain(producer_ids.iter().map(|id| ResourceId::Producer(*id)))
            .chain(transport_ids.iter().map(|id| ResourceId::Transport(*id)))
            .collect::<Vec<_>>();
        for id in removals {
            if let Some(removed) = self.deregister(id) {
                detached.push(removed);
            }
        }

        self.peers.remove(&peer_id);
        let room_closed = match self.rooms.get_mut(&room_key) {
            Some(room) => {
                room.peers.retain(|p| *p != peer_id);
                room.peers.is_empty()
            }
            None => false,
        };
        if room_closed {
            if let Some(room) = self.rooms.remove(&room_key) {
                detached.routers.push(room.router);
            }
        }

        Some((
            PeerClosed {
                peer_id,
                room_key,
                producer_ids,
                remote_consumers,
                room_closed,
            },
            detached,
        ))
    }

    /// Remove every peer of a room and the room itself.
    ///
    /// Returns `None` if the room is not registered.
    pub fn detach_room(&mut self, room_key: &RoomKey) -> Option<(Vec<PeerClosed>, Detached)> {
        let peer_ids = self.rooms.get(room_key)?.peers.clone();

        let mut closed = Vec::with_capacity(peer_ids.len());
        let mut detached = Detached::default();
        for peer_id in peer_ids {
            if let Some((summary, peer_detached)) = self.detach_peer(peer_id) {
                closed.push(summary);
                detached.merge(peer_detached);
            }
        }

        // Only reachable if the room somehow had no peers.
        if let Some(room) = self.rooms.remove(room_key) {
            detached.routers.push(room.router);
        }

        Some((closed, detached))
    }

    /// Every registered room key.
    pub fn room_keys(&self) -> Vec<RoomKey> {
        self.rooms.keys().cloned().collect()
    }

    /// Producers in a room, optionally excluding one peer's own.
    pub fn producers_in_room(
        &self,
        room_key: &RoomKey,
        excluding: Option<PeerId>,
    ) -> Vec<ProducerInfo> {
        let Some(room) = self.rooms.get(room_key) else {
            return Vec::new();
        };
        // Walk peers in join order so listings are stable.
        room.peers
            .iter()
            .filter(|peer_id| Some(**peer_id) != excluding)
            .filter_map(|peer_id| self.peers.get(peer_id).map(|peer| (peer_id, peer)))
            .flat_map(|(peer_id, peer)| {
                peer.producers.iter().filter_map(move |producer_id| {
                    self.producers.get(producer_id).map(|p| ProducerInfo {
                        producer_id: *producer_id,
                        peer_id: *peer_id,
                        kind: p.kind,
                    })
                })
            })
            .collect()
    }

    /// Peers in a room in join order, optionally excluding one.
    pub fn peers_in_room(&self, room_key: &RoomKey, excluding: Option<PeerId>) -> Vec<PeerInfo> {
        let Some(room) = self.rooms.get(room_key) else {
            return Vec::new();
        };
        room.peers
            .iter()
            .filter(|peer_id| Some(**peer_id) != excluding)
            .filter_map(|peer_id| {
                self.peers.get(peer_id).map(|peer| PeerInfo {
                    peer_id: *peer_id,
                    display_name: peer.display_name.clone(),
                    media_state: peer.media_state,
                    joined_at: peer.joined_at,
                })
            })
            .collect()
    }

    /// Counts globally, or for one room (`None` if that room is absent).
    pub fn stats(&self, room_key: Option<&RoomKey>) -> Option<SessionStats> {
        match room_key {
            None => Some(SessionStats {
                rooms: self.rooms.len(),
                peers: self.peers.len(),
                transports: self.transports.len(),
                producers: self.producers.len(),
                consumers: self.consumers.len(),
            }),
            Some(key) => self.rooms.get(key).map(|room| SessionStats {
                rooms: 1,
                peers: room.peers.len(),
                transports: room.transports.len(),
                producers: room.producers.len(),
                consumers: room.consumers.len(),
            }),
        }
    }

    /// Cross-check every index against the others.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub fn check_consistency(&self) -> Result<(), String> {
        for (key, room) in &self.rooms {
            if room.peers.is_empty() {
                return Err(format!("room {key} has no peers"));
            }
            for peer_id in &room.peers {
                if self.peers.get(peer_id).map(|p| &p.room_key) != Some(key) {
                    return Err(format!("room {key} lists peer {peer_id} it does not own"));
                }
            }
        }

        for (peer_id, peer) in &self.peers {
            let room = self
                .rooms
                .get(&peer.room_key)
                .ok_or_else(|| format!("peer {peer_id} points at missing room {}", peer.room_key))?;
            if !room.peers.contains(peer_id) {
                return Err(format!("room {} does not list peer {peer_id}", peer.room_key));
            }
        }

        macro_rules! check_index {
            ($global:expr, $room_field:ident, $peer_field:ident, $label:literal) => {
                for (id, entry) in &$global {
                    let peer = self
                        .peers
                        .get(&entry.peer_id)
                        .ok_or_else(|| format!("{} {id} has no live peer", $label))?;
                    if peer.room_key != entry.room_key {
                        return Err(format!("{} {id} room disagrees with its peer", $label));
                    }
                    if !peer.$peer_field.contains(id) {
                        return Err(format!("{} {id} missing from peer index", $label));
                    }
                    let room = self
                        .rooms
                        .get(&entry.room_key)
                        .ok_or_else(|| format!("{} {id} has no live room", $label))?;
                    if !room.$room_field.contains(id) {
                        return Err(format!("{} {id} missing from room index", $label));
                    }
                }
                for room in self.rooms.values() {
                    if let Some(id) = room.$room_field.iter().find(|id| !$global.contains_key(*id)) {
                        return Err(format!("room lists unknown {} {id}", $label));
                    }
                }
                for peer in self.peers.values() {
                    if let Some(id) = peer.$peer_field.iter().find(|id| !$global.contains_key(*id)) {
                        return Err(format!("peer lists unknown {} {id}", $label));
                    }
                }
            };
        }

        check_index!(self.transports, transports, transports, "transport");
        check_index!(self.producers, producers, producers, "producer");
        check_index!(self.consumers, consumers, consumers, "consumer");

        for (id, consumer) in &self.consumers {
            if !self.producers.contains_key(&consumer.producer_id) {
                return Err(format!("consumer {id} references closed producer"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::codecs::default_media_codecs;
    use crate::media::loopback::LoopbackWorker;
    use crate::media::rtp::RtpCodecParameters;
    use crate::media::{MediaWorker, RtpParameters, WebRtcTransportOptions, WorkerSettings};
    use serde_json::Map;
    use std::net::{IpAddr, Ipv4Addr};

    fn options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: false,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
            min_outgoing_bitrate: 600_000,
            max_incoming_bitrate: 1_500_000,
        }
    }

    fn opus() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 100,
                clock_rate: 48000,
                channels: Some(2),
                parameters: Map::new(),
                rtcp_feedback: vec![],
            }],
            ..RtpParameters::default()
        }
    }

    async fn router() -> Arc<dyn MediaRouter> {
        let worker = LoopbackWorker::new(&WorkerSettings {
            rtc_min_port: 40000,
            rtc_max_port: 40010,
        })
        .unwrap();
        worker.create_router(&default_media_codecs()).await.unwrap()
    }

    #[test]
    fn test_add_peer_enforces_capacity_before_registering() {
        let mut registry = ResourceRegistry::new();
        let room = RoomKey::from("r");

        let first = registry.add_peer(&room, PeerId::new(), "a".into(), 2).unwrap();
        assert!(first.room_created);
        let second = registry.add_peer(&room, PeerId::new(), "b".into(), 2).unwrap();
        assert!(!second.room_created);
        assert!(Arc::ptr_eq(&first.router, &second.router));

        let rejected = PeerId::new();
        let result = registry.add_peer(&room, rejected, "c".into(), 2);
        assert!(matches!(result, Err(SfuError::RoomFull { max_participants: 2, .. })));
        assert!(registry.peer_room(rejected).is_none());
        assert_eq!(registry.peer_count(), 2);
        registry.check_consistency().unwrap();
    }

    #[test]
    fn test_add_peer_twice_is_conflict() {
        let mut registry = ResourceRegistry::new();
        let peer = PeerId::new();
        registry.add_peer(&RoomKey::from("a"), peer, "p".into(), 5).unwrap();

        let result = registry.add_peer(&RoomKey::from("b"), peer, "p".into(), 5);
        assert!(matches!(result, Err(SfuError::AlreadyJoined(_))));
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_detach_peer_removes_everything_and_empty_room() {
        let mut registry = ResourceRegistry::new();
        let room = RoomKey::from("r");
        let router = router().await;
        let p1 = PeerId::new();
        let p2 = PeerId::new();
        registry.add_peer(&room, p1, "one".into(), 10).unwrap();
        registry.add_peer(&room, p2, "two".into(), 10).unwrap();

        let send = router.create_webrtc_transport(&options()).await.unwrap();
        let recv = router.create_webrtc_transport(&options()).await.unwrap();
        registry
            .register_transport(p1, &room, TransportDirection::Send, Arc::clone(&send))
            .unwrap();
        registry
            .register_transport(p2, &room, TransportDirection::Recv, Arc::clone(&recv))
            .unwrap();

        let producer = send.produce(MediaKind::Audio, opus()).await.unwrap();
        registry.register_producer(p1, send.id(), Arc::clone(&producer)).unwrap();
        let consumer = recv
            .consume(producer.id(), &router.rtp_capabilities(), false)
            .await
            .unwrap();
        registry.register_consumer(p2, recv.id(), Arc::clone(&consumer)).unwrap();
        registry.check_consistency().unwrap();

        let (closed, _detached) = registry.detach_peer(p1).unwrap();
        assert_eq!(closed.producer_ids, vec![producer.id()]);
        assert_eq!(closed.remote_consumers, vec![(p2, consumer.id())]);
        assert!(!closed.room_closed);
        assert!(registry.consumer(consumer.id()).is_none());
        assert!(registry.producer(producer.id()).is_none());
        assert!(registry.transport(send.id()).is_none());
        registry.check_consistency().unwrap();

        assert!(registry.detach_peer(p1).is_none(), "second detach is a no-op");

        let (closed, _detached) = registry.detach_peer(p2).unwrap();
        assert!(closed.room_closed);
        assert_eq!(registry.stats(None).unwrap(), SessionStats::default());
        registry.check_consistency().unwrap();
    }

    #[tokio::test]
    async fn test_register_rejects_resources_of_departed_owner() {
        let mut registry = ResourceRegistry::new();
        let room = RoomKey::from("r");
        let router = router().await;
        let peer = PeerId::new();
        registry.add_peer(&room, peer, "p".into(), 10).unwrap();

        let transport = router.create_webrtc_transport(&options()).await.unwrap();
        registry.detach_peer(peer);

        let result =
            registry.register_transport(peer, &room, TransportDirection::Send, transport);
        assert!(matches!(result, Err(SfuError::PeerNotFound(_))));
        assert_eq!(registry.stats(None).unwrap().transports, 0);
    }

    #[tokio::test]
    async fn test_remove_producer_takes_its_consumers() {
        let mut registry = ResourceRegistry::new();
        let room = RoomKey::from("r");
        let router = router().await;
        let p1 = PeerId::new();
        let p2 = PeerId::new();
        registry.add_peer(&room, p1, "one".into(), 10).unwrap();
        registry.add_peer(&room, p2, "two".into(), 10).unwrap();
        let send = router.create_webrtc_transport(&options()).await.unwrap();
        let recv = router.create_webrtc_transport(&options()).await.unwrap();
        registry
            .register_transport(p1, &room, TransportDirection::Send, Arc::clone(&send))
            .unwrap();
        registry
            .register_transport(p2, &room, TransportDirection::Recv, Arc::clone(&recv))
            .unwrap();
        let producer = send.produce(MediaKind::Audio, opus()).await.unwrap();
        registry.register_producer(p1, send.id(), Arc::clone(&producer)).unwrap();
        let consumer = recv
            .consume(producer.id(), &router.rtp_capabilities(), false)
            .await
            .unwrap();
        registry.register_consumer(p2, recv.id(), Arc::clone(&consumer)).unwrap();

        let (closed, detached) = registry.remove_producer(producer.id()).unwrap();
        assert_eq!(closed.consumers, vec![(p2, consumer.id())]);
        detached.close().await;

        assert!(registry.consumer(consumer.id()).is_none());
        assert!(matches!(
            registry.remove_producer(producer.id()),
            Err(SfuError::ProducerNotFound(_))
        ));
        assert_eq!(registry.stats(Some(&room)).unwrap().producers, 0);
        assert!(registry.producers_in_room(&room, None).is_empty());
        registry.check_consistency().unwrap();
    }

    #[test]
    fn test_listings_follow_join_order_and_exclude() {
        let mut registry = ResourceRegistry::new();
        let room = RoomKey::from("r");
        let (first, second, third) = (PeerId::new(), PeerId::new(), PeerId::new());
        registry.add_peer(&room, first, "peer-0".into(), 10).unwrap();
        registry.add_peer(&room, second, "peer-1".into(), 10).unwrap();
        registry.add_peer(&room, third, "peer-2".into(), 10).unwrap();
        registry
            .update_media_state(second, MediaStateChange::Video(false))
            .unwrap();

        let listed = registry.peers_in_room(&room, Some(first));
        let names: Vec<_> = listed.iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, vec!["peer-1", "peer-2"]);

        let state = listed.first().unwrap().media_state;
        assert!(!state.video_enabled);
        assert!(state.audio_enabled);
        assert!(!state.screen_sharing);
    }
}
