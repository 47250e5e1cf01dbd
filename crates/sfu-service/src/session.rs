//! Session manager.
//!
//! The API the signaling layer drives: rooms, peers, transports, producers and
//! consumers. Coordinates the [`WorkerPool`] and the [`ResourceRegistry`].
//!
//! # Concurrency
//!
//! The registry lives behind a `tokio::sync::Mutex` that is never held across
//! a media-engine await. Every operation that creates an engine object
//! follows the same shape:
//!
//! 1. Validate and copy what is needed under the lock.
//! 2. Release the lock and await the engine.
//! 3. Re-take the lock and register the new object. If its owner vanished in
//!    the meantime (peer left, transport closed), close the object and fail
//!    with not-found so nothing is orphaned.
//!
//! Router creation is memoized per room through a `OnceCell` stored in the
//! room entry, so concurrent first joiners share one in-flight creation.

use crate::errors::SfuError;
use crate::media::{
    DtlsParameters, MediaKind, MediaRouter, RtpCapabilities, RtpCodecCapability, RtpParameters,
    TransportParameters, WebRtcTransportOptions,
};
use crate::observability::{record_router_created, set_peers_active, set_rooms_active};
use crate::registry::{
    MediaState, MediaStateChange, PeerClosed, PeerInfo, ProducerClosed, ProducerInfo,
    ResourceId, ResourceRegistry, RouterCell, SessionStats, TransportDirection,
};
use crate::types::{ConsumerId, PeerId, ProducerId, RoomKey, TransportId};
use crate::workers::WorkerPool;

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Result of [`SessionManager::join_room`].
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// This join created the room.
    pub room_created: bool,
    pub rtp_capabilities: RtpCapabilities,
}

/// Parameters of a new consumer, returned to the consuming client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

/// Room/peer/media-resource lifecycle manager.
pub struct SessionManager {
    workers: Arc<WorkerPool>,
    registry: Mutex<ResourceRegistry>,
    media_codecs: Vec<RtpCodecCapability>,
    transport_options: WebRtcTransportOptions,
}

fn publish_gauges(registry: &ResourceRegistry) {
    set_rooms_active(registry.room_count());
    set_peers_active(registry.peer_count());
}

impl SessionManager {
    #[must_use]
    pub fn new(
        workers: Arc<WorkerPool>,
        media_codecs: Vec<RtpCodecCapability>,
        transport_options: WebRtcTransportOptions,
    ) -> Self {
        Self {
            workers,
            registry: Mutex::new(ResourceRegistry::new()),
            media_codecs,
            transport_options,
        }
    }

    #[must_use]
    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    /// Register a peer in a room (capacity checked first) and make sure the
    /// room has a router.
    ///
    /// If router creation fails the peer registration is rolled back, which
    /// also drops a room this join created.
    ///
    /// # Errors
    ///
    /// - `SfuError::AlreadyJoined` if the peer is in a room
    /// - `SfuError::RoomFull` if the room is at capacity
    /// - `SfuError::MediaEngine` / `SfuError::Internal` if no router could be created
    #[instrument(skip_all, name = "sfu.session.join_room", fields(room_key = %room_key, peer_id = %peer_id))]
    pub async fn join_room(
        &self,
        room_key: &RoomKey,
        peer_id: PeerId,
        display_name: String,
        max_participants: u32,
    ) -> Result<JoinOutcome, SfuError> {
        let added = {
            let mut registry = self.registry.lock().await;
            let added = registry.add_peer(room_key, peer_id, display_name, max_participants)?;
            publish_gauges(&registry);
            added
        };

        match self.router_from_cell(room_key, &added.router).await {
            Ok(router) => {
                info!(
                    target: "sfu.session",
                    room_key = %room_key,
                    peer_id = %peer_id,
                    room_created = added.room_created,
                    "Peer joined room"
                );
                Ok(JoinOutcome {
                    room_created: added.room_created,
                    rtp_capabilities: router.rtp_capabilities(),
                })
            }
            Err(e) => {
                warn!(
                    target: "sfu.session",
                    room_key = %room_key,
                    peer_id = %peer_id,
                    error = %e,
                    "Router unavailable, rolling back join"
                );
                self.close_peer(peer_id).await;
                Err(e)
            }
        }
    }

    /// The room's router, created on first use.
    ///
    /// Concurrent first callers share one in-flight creation. A failed
    /// creation leaves the room without a router so a later call retries.
    ///
    /// # Errors
    ///
    /// - `SfuError::RoomNotFound` if no peer has joined the room, or the room
    ///   closed while the router was being created
    /// - `SfuError::MediaEngine` / `SfuError::Internal` on creation failure
    pub async fn get_or_create_router(
        &self,
        room_key: &RoomKey,
    ) -> Result<Arc<dyn MediaRouter>, SfuError> {
        let cell = self
            .registry
            .lock()
            .await
            .router_cell(room_key)
            .ok_or_else(|| SfuError::RoomNotFound(room_key.to_string()))?;
        self.router_from_cell(room_key, &cell).await
    }

    async fn router_from_cell(
        &self,
        room_key: &RoomKey,
        cell: &RouterCell,
    ) -> Result<Arc<dyn MediaRouter>, SfuError> {
        let created = AtomicBool::new(false);
        let router = {
            let created = &created;
            let workers = &self.workers;
            let media_codecs = &self.media_codecs;
            cell.get_or_try_init(|| async move {
                let worker = workers.next_worker().await?;
                let router = worker.create_router(media_codecs).await?;
                created.store(true, Ordering::SeqCst);
                info!(
                    target: "sfu.session",
                    room_key = %room_key,
                    worker_id = %worker.id(),
                    router_id = %router.id(),
                    "Router created"
                );
                Ok::<_, SfuError>(router)
            })
            .await
            .map(Arc::clone)?
        };
        let created = created.load(Ordering::SeqCst);
        if created {
            record_router_created();
        }

        if !self.registry.lock().await.holds_router_cell(room_key, cell) {
            // The room emptied while the router was being created. Only the
            // creator closes it; later waiters just fail.
            if created {
                router.close().await;
                debug!(target: "sfu.session", room_key = %room_key, "Closed router of vanished room");
            }
            return Err(SfuError::RoomNotFound(room_key.to_string()));
        }

        Ok(router)
    }

    /// Create a WebRTC transport for a peer and register it.
    ///
    /// # Errors
    ///
    /// - `SfuError::PeerNotFound` if the peer is not in the room (or leaves
    ///   while the transport is being created)
    /// - `SfuError::MediaEngine` on engine failure
    #[instrument(skip_all, name = "sfu.session.create_transport", fields(room_key = %room_key, peer_id = %peer_id, direction = ?direction))]
    pub async fn create_transport(
        &self,
        room_key: &RoomKey,
        peer_id: PeerId,
        direction: TransportDirection,
    ) -> Result<TransportParameters, SfuError> {
        if self.registry.lock().await.peer_room(peer_id) != Some(room_key) {
            return Err(SfuError::PeerNotFound(peer_id.to_string()));
        }

        let router = self.get_or_create_router(room_key).await?;
        let transport = router
            .create_webrtc_transport(&self.transport_options)
            .await?;

        let registered = self.registry.lock().await.register_transport(
            peer_id,
            room_key,
            direction,
            Arc::clone(&transport),
        );
        if let Err(e) = registered {
            transport.close().await;
            return Err(e);
        }

        debug!(
            target: "sfu.session",
            transport_id = %transport.id(),
            "Transport created"
        );
        Ok(transport.parameters())
    }

    /// Complete the DTLS handshake setup of a transport.
    ///
    /// # Errors
    ///
    /// - `SfuError::TransportNotFound` if the transport is absent
    /// - `SfuError::MediaEngine` if the engine rejects the parameters
    #[instrument(skip_all, name = "sfu.session.connect_transport", fields(transport_id = %transport_id))]
    pub async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SfuError> {
        let transport = self
            .registry
            .lock()
            .await
            .transport(transport_id)
            .map(|t| Arc::clone(&t.handle))
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;

        transport.connect(dtls_parameters).await?;
        debug!(target: "sfu.session", transport_id = %transport_id, "Transport connected");
        Ok(())
    }

    /// Create a producer on a peer's send transport.
    ///
    /// Emits no broadcast; the caller announces the producer once this
    /// returns, so the producer is registered before anyone hears of it.
    ///
    /// # Errors
    ///
    /// - `SfuError::TransportNotFound` if the transport is absent or closes meanwhile
    /// - `SfuError::NotOwner` if the transport belongs to another peer
    /// - `SfuError::InvalidRequest` if the transport is a receive transport
    /// - `SfuError::MediaEngine` on engine failure
    #[instrument(skip_all, name = "sfu.session.produce", fields(transport_id = %transport_id, peer_id = %peer_id, kind = kind.as_str()))]
    pub async fn produce(
        &self,
        transport_id: TransportId,
        peer_id: PeerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, SfuError> {
        let transport = {
            let registry = self.registry.lock().await;
            let entry = registry
                .transport(transport_id)
                .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;
            if entry.peer_id != peer_id {
                return Err(SfuError::NotOwner(format!("transport {transport_id}")));
            }
            if entry.direction != TransportDirection::Send {
                return Err(SfuError::InvalidRequest(
                    "cannot produce on a receive transport".to_string(),
                ));
            }
            Arc::clone(&entry.handle)
        };

        let producer = transport.produce(kind, rtp_parameters).await?;

        let registered =
            self.registry
                .lock()
                .await
                .register_producer(peer_id, transport_id, Arc::clone(&producer));
        if let Err(e) = registered {
            producer.close().await;
            return Err(e);
        }

        info!(
            target: "sfu.session",
            producer_id = %producer.id(),
            kind = kind.as_str(),
            "Producer created"
        );
        Ok(producer.id())
    }

    /// Create a consumer of a producer in the caller's room.
    ///
    /// The consumer starts unpaused and a keyframe is requested right away so
    /// the viewer does not wait for the next natural keyframe.
    ///
    /// # Errors
    ///
    /// - `SfuError::TransportNotFound` / `SfuError::ProducerNotFound` if either is absent
    /// - `SfuError::NotOwner` if the transport belongs to another peer
    /// - `SfuError::InvalidRequest` if the transport is a send transport
    /// - `SfuError::CrossRoomConsume` if the producer is in another room
    /// - `SfuError::IncompatibleCodecs` if the capabilities cannot receive it
    /// - `SfuError::MediaEngine` on engine failure
    #[instrument(skip_all, name = "sfu.session.consume", fields(transport_id = %transport_id, producer_id = %producer_id, peer_id = %peer_id))]
    pub async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        peer_id: PeerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo, SfuError> {
        let (transport, router) = {
            let registry = self.registry.lock().await;
            let transport = registry
                .transport(transport_id)
                .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;
            if transport.peer_id != peer_id {
                return Err(SfuError::NotOwner(format!("transport {transport_id}")));
            }
            if transport.direction != TransportDirection::Recv {
                return Err(SfuError::InvalidRequest(
                    "cannot consume on a send transport".to_string(),
                ));
            }
            let producer = registry
                .producer(producer_id)
                .ok_or_else(|| SfuError::ProducerNotFound(producer_id.to_string()))?;
            if producer.room_key != transport.room_key {
                return Err(SfuError::CrossRoomConsume {
                    producer_id: producer_id.to_string(),
                    room_key: transport.room_key.to_string(),
                });
            }
            let router = registry
                .router_cell(&transport.room_key)
                .and_then(|cell| cell.get().cloned())
                .ok_or_else(|| SfuError::RoomNotFound(transport.room_key.to_string()))?;
            (Arc::clone(&transport.handle), router)
        };

        if !router.can_consume(producer_id, &rtp_capabilities).await {
            return Err(SfuError::IncompatibleCodecs(producer_id.to_string()));
        }

        let consumer = transport
            .consume(producer_id, &rtp_capabilities, false)
            .await?;

        let registered =
            self.registry
                .lock()
                .await
                .register_consumer(peer_id, transport_id, Arc::clone(&consumer));
        if let Err(e) = registered {
            consumer.close().await;
            return Err(e);
        }

        if let Err(e) = consumer.request_key_frame().await {
            warn!(
                target: "sfu.session",
                consumer_id = %consumer.id(),
                error = %e,
                "Keyframe request failed"
            );
        }

        debug!(target: "sfu.session", consumer_id = %consumer.id(), "Consumer created");
        Ok(ConsumerInfo {
            id: consumer.id(),
            producer_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            paused: false,
        })
    }

    /// Pause a consumer. No-op if already paused.
    ///
    /// # Errors
    ///
    /// `SfuError::ConsumerNotFound` if the consumer is absent.
    pub async fn pause_consumer(&self, id: ConsumerId) -> Result<(), SfuError> {
        self.set_consumer_paused(id, true).await
    }

    /// Resume a consumer. No-op if not paused.
    ///
    /// # Errors
    ///
    /// `SfuError::ConsumerNotFound` if the consumer is absent.
    pub async fn resume_consumer(&self, id: ConsumerId) -> Result<(), SfuError> {
        self.set_consumer_paused(id, false).await
    }

    #[instrument(skip_all, name = "sfu.session.set_consumer_paused", fields(consumer_id = %id, paused = paused))]
    async fn set_consumer_paused(&self, id: ConsumerId, paused: bool) -> Result<(), SfuError> {
        let consumer = {
            let registry = self.registry.lock().await;
            let entry = registry
                .consumer(id)
                .ok_or_else(|| SfuError::ConsumerNotFound(id.to_string()))?;
            if entry.paused == paused {
                return Ok(());
            }
            Arc::clone(&entry.handle)
        };

        if paused {
            consumer.pause().await?;
        } else {
            consumer.resume().await?;
        }

        self.registry
            .lock()
            .await
            .set_consumer_paused(id, paused)
    }

    /// Close a producer and every consumer of it.
    ///
    /// # Errors
    ///
    /// `SfuError::ProducerNotFound` if the producer is absent.
    #[instrument(skip_all, name = "sfu.session.close_producer", fields(producer_id = %id))]
    pub async fn close_producer(&self, id: ProducerId) -> Result<ProducerClosed, SfuError> {
        let (closed, detached) = self.registry.lock().await.remove_producer(id)?;
        detached.close().await;
        debug!(
            target: "sfu.session",
            producer_id = %id,
            consumers_closed = closed.consumers.len(),
            "Producer closed"
        );
        Ok(closed)
    }

    /// # Errors
    ///
    /// `SfuError::ConsumerNotFound` if the consumer is absent.
    #[instrument(skip_all, name = "sfu.session.close_consumer", fields(consumer_id = %id))]
    pub async fn close_consumer(&self, id: ConsumerId) -> Result<(), SfuError> {
        let detached = self.registry.lock().await.remove_consumer(id)?;
        detached.close().await;
        Ok(())
    }

    /// Close a peer and everything it owns; close the room if it empties.
    ///
    /// Consumers close first, then producers, then transports, then the
    /// router. Returns `None` if the peer is not registered, so leave and
    /// disconnect can both call this.
    #[instrument(skip_all, name = "sfu.session.close_peer", fields(peer_id = %peer_id))]
    pub async fn close_peer(&self, peer_id: PeerId) -> Option<PeerClosed> {
        let detached = {
            let mut registry = self.registry.lock().await;
            let detached = registry.detach_peer(peer_id);
            publish_gauges(&registry);
            detached
        };
        let Some((closed, detached)) = detached else {
            debug!(target: "sfu.session", peer_id = %peer_id, "Peer already closed");
            return None;
        };

        detached.close().await;

        info!(
            target: "sfu.session",
            peer_id = %peer_id,
            room_key = %closed.room_key,
            producers_closed = closed.producer_ids.len(),
            room_closed = closed.room_closed,
            "Peer closed"
        );
        Some(closed)
    }

    /// Close every peer of a room, its router, and the room entry.
    ///
    /// # Errors
    ///
    /// `SfuError::RoomNotFound` if the room is not registered.
    #[instrument(skip_all, name = "sfu.session.close_room", fields(room_key = %room_key))]
    pub async fn close_room(&self, room_key: &RoomKey) -> Result<Vec<PeerClosed>, SfuError> {
        let detached = {
            let mut registry = self.registry.lock().await;
            let detached = registry.detach_room(room_key);
            publish_gauges(&registry);
            detached
        };
        let (closed, detached) =
            detached.ok_or_else(|| SfuError::RoomNotFound(room_key.to_string()))?;

        detached.close().await;
        info!(
            target: "sfu.session",
            room_key = %room_key,
            peers_closed = closed.len(),
            "Room closed"
        );
        Ok(closed)
    }

    /// Close every room (shutdown).
    pub async fn close_all(&self) -> Vec<PeerClosed> {
        let room_keys = self.registry.lock().await.room_keys();
        let mut closed = Vec::new();
        for room_key in room_keys {
            if let Ok(peers) = self.close_room(&room_key).await {
                closed.extend(peers);
            }
        }
        closed
    }

    pub async fn producers_in_room(
        &self,
        room_key: &RoomKey,
        excluding: Option<PeerId>,
    ) -> Vec<ProducerInfo> {
        self.registry
            .lock()
            .await
            .producers_in_room(room_key, excluding)
    }

    pub async fn peers_in_room(
        &self,
        room_key: &RoomKey,
        excluding: Option<PeerId>,
    ) -> Vec<PeerInfo> {
        self.registry.lock().await.peers_in_room(room_key, excluding)
    }

    /// Record an audio/video/screenshare toggle.
    ///
    /// # Errors
    ///
    /// `SfuError::PeerNotFound` if the peer is not registered.
    pub async fn update_media_state(
        &self,
        peer_id: PeerId,
        change: MediaStateChange,
    ) -> Result<(RoomKey, MediaState), SfuError> {
        self.registry
            .lock()
            .await
            .update_media_state(peer_id, change)
    }

    /// RTP capabilities of the room's router.
    ///
    /// # Errors
    ///
    /// `SfuError::RoomNotFound` if the room is absent.
    pub async fn router_capabilities(
        &self,
        room_key: &RoomKey,
    ) -> Result<RtpCapabilities, SfuError> {
        Ok(self.get_or_create_router(room_key).await?.rtp_capabilities())
    }

    /// Peer owning a media resource.
    ///
    /// # Errors
    ///
    /// The matching not-found error if the resource is absent.
    pub async fn resource_owner(&self, id: ResourceId) -> Result<PeerId, SfuError> {
        self.registry.lock().await.owner(id).ok_or_else(|| match id {
            ResourceId::Transport(id) => SfuError::TransportNotFound(id.to_string()),
            ResourceId::Producer(id) => SfuError::ProducerNotFound(id.to_string()),
            ResourceId::Consumer(id) => SfuError::ConsumerNotFound(id.to_string()),
        })
    }

    /// Counts globally, or for one room.
    ///
    /// # Errors
    ///
    /// `SfuError::RoomNotFound` if a room key is given and absent.
    pub async fn stats(&self, room_key: Option<&RoomKey>) -> Result<SessionStats, SfuError> {
        self.registry
            .lock()
            .await
            .stats(room_key)
            .ok_or_else(|| {
                SfuError::RoomNotFound(room_key.map(ToString::to_string).unwrap_or_default())
            })
    }

    /// Cross-check the registry indices.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub async fn check_invariants(&self) -> Result<(), String> {
        self.registry.lock().await.check_consistency()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::codecs::default_media_codecs;
    use crate::media::loopback::LoopbackWorkerFactory;
    use crate::media::rtp::RtpCodecParameters;
    use crate::media::WorkerSettings;
    use crate::workers::WorkerPoolConfig;
    use serde_json::Map;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    async fn manager(num_workers: usize) -> SessionManager {
        let pool = WorkerPool::initialize(
            &LoopbackWorkerFactory,
            WorkerPoolConfig {
                num_workers,
                worker_settings: WorkerSettings {
                    rtc_min_port: 40000,
                    rtc_max_port: 40999,
                },
                death_grace: Duration::from_millis(2000),
                cpu_cores: num_workers,
            },
        )
        .await
        .unwrap();

        SessionManager::new(
            Arc::new(pool),
            default_media_codecs(),
            WebRtcTransportOptions {
                listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                announced_ip: None,
                enable_udp: true,
                enable_tcp: true,
                prefer_udp: true,
                initial_available_outgoing_bitrate: 1_000_000,
                min_outgoing_bitrate: 600_000,
                max_incoming_bitrate: 1_500_000,
            },
        )
    }

    fn vp8() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 101,
                clock_rate: 90000,
                channels: None,
                parameters: Map::new(),
                rtcp_feedback: vec![],
            }],
            ..RtpParameters::default()
        }
    }

    #[tokio::test]
    async fn test_router_requires_joined_room() {
        let sessions = manager(1).await;
        let result = sessions.get_or_create_router(&RoomKey::from("nobody")).await;
        assert!(matches!(result, Err(SfuError::RoomNotFound(_))));
        assert_eq!(sessions.stats(None).await.unwrap().rooms, 0);
    }

    #[tokio::test]
    async fn test_join_produce_consume_leave() {
        let sessions = manager(2).await;
        let room = RoomKey::from("demo");
        let (alice, bob) = (PeerId::new(), PeerId::new());

        let joined = sessions.join_room(&room, alice, "alice".into(), 10).await.unwrap();
        assert!(joined.room_created);
        assert!(!joined.rtp_capabilities.codecs.is_empty());
        let joined = sessions.join_room(&room, bob, "bob".into(), 10).await.unwrap();
        assert!(!joined.room_created);

        let send = sessions
            .create_transport(&room, alice, TransportDirection::Send)
            .await
            .unwrap();
        let recv = sessions
            .create_transport(&room, bob, TransportDirection::Recv)
            .await
            .unwrap();
        sessions
            .connect_transport(send.id, send.dtls_parameters.clone())
            .await
            .unwrap();

        let producer_id = sessions
            .produce(send.id, alice, MediaKind::Video, vp8())
            .await
            .unwrap();
        let caps = sessions.router_capabilities(&room).await.unwrap();
        let consumer = sessions
            .consume(recv.id, producer_id, bob, caps)
            .await
            .unwrap();
        assert!(!consumer.paused);
        assert_eq!(consumer.kind, MediaKind::Video);

        sessions.pause_consumer(consumer.id).await.unwrap();
        sessions.pause_consumer(consumer.id).await.unwrap();
        sessions.resume_consumer(consumer.id).await.unwrap();
        sessions.check_invariants().await.unwrap();

        let closed = sessions.close_peer(alice).await.unwrap();
        assert_eq!(closed.producer_ids, vec![producer_id]);
        assert!(!closed.room_closed);
        assert!(matches!(
            sessions.pause_consumer(consumer.id).await,
            Err(SfuError::ConsumerNotFound(_))
        ));
        assert!(sessions.close_peer(alice).await.is_none());

        let closed = sessions.close_peer(bob).await.unwrap();
        assert!(closed.room_closed);
        assert_eq!(sessions.stats(None).await.unwrap(), SessionStats::default());
        sessions.check_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn test_produce_checks_ownership_and_direction() {
        let sessions = manager(1).await;
        let room = RoomKey::from("demo");
        let (alice, mallory) = (PeerId::new(), PeerId::new());
        sessions.join_room(&room, alice, "alice".into(), 10).await.unwrap();
        sessions.join_room(&room, mallory, "mallory".into(), 10).await.unwrap();

        let recv = sessions
            .create_transport(&room, alice, TransportDirection::Recv)
            .await
            .unwrap();

        let foreign = sessions.produce(recv.id, mallory, MediaKind::Video, vp8()).await;
        assert!(matches!(foreign, Err(SfuError::NotOwner(_))));

        let wrong_direction = sessions.produce(recv.id, alice, MediaKind::Video, vp8()).await;
        assert!(matches!(wrong_direction, Err(SfuError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_consume_across_rooms_is_rejected() {
        let sessions = manager(1).await;
        let (room_a, room_b) = (RoomKey::from("a"), RoomKey::from("b"));
        let (alice, bob) = (PeerId::new(), PeerId::new());
        sessions.join_room(&room_a, alice, "alice".into(), 10).await.unwrap();
        sessions.join_room(&room_b, bob, "bob".into(), 10).await.unwrap();

        let send = sessions
            .create_transport(&room_a, alice, TransportDirection::Send)
            .await
            .unwrap();
        let recv = sessions
            .create_transport(&room_b, bob, TransportDirection::Recv)
            .await
            .unwrap();
        let producer_id = sessions
            .produce(send.id, alice, MediaKind::Video, vp8())
            .await
            .unwrap();

        let caps = sessions.router_capabilities(&room_b).await.unwrap();
        let result = sessions.consume(recv.id, producer_id, bob, caps).await;
        assert!(matches!(result, Err(SfuError::CrossRoomConsume { .. })));
    }

    #[tokio::test]
    async fn test_consume_with_incompatible_capabilities() {
        let sessions = manager(1).await;
        let room = RoomKey::from("demo");
        let (alice, bob) = (PeerId::new(), PeerId::new());
        sessions.join_room(&room, alice, "alice".into(), 10).await.unwrap();
        sessions.join_room(&room, bob, "bob".into(), 10).await.unwrap();
        let send = sessions
            .create_transport(&room, alice, TransportDirection::Send)
            .await
            .unwrap();
        let recv = sessions
            .create_transport(&room, bob, TransportDirection::Recv)
            .await
            .unwrap();
        let producer_id = sessions
            .produce(send.id, alice, MediaKind::Video, vp8())
            .await
            .unwrap();

        let result = sessions
            .consume(recv.id, producer_id, bob, RtpCapabilities::default())
            .await;
        assert!(matches!(result, Err(SfuError::IncompatibleCodecs(_))));
        assert_eq!(sessions.stats(Some(&room)).await.unwrap().consumers, 0);
    }

    #[tokio::test]
    async fn test_close_room_closes_all_peers() {
        let sessions = manager(1).await;
        let room = RoomKey::from("demo");
        for name in ["a", "b", "c"] {
            sessions
                .join_room(&room, PeerId::new(), name.into(), 10)
                .await
                .unwrap();
        }

        let closed = sessions.close_room(&room).await.unwrap();
        assert_eq!(closed.len(), 3);
        assert!(matches!(
            sessions.stats(Some(&room)).await,
            Err(SfuError::RoomNotFound(_))
        ));
        assert!(matches!(
            sessions.close_room(&room).await,
            Err(SfuError::RoomNotFound(_))
        ));
    }
}
