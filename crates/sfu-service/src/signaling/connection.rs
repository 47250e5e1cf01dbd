//! Per-connection signaling state machine.
//!
//! A connection handles its own requests one at a time; its state (peer id,
//! joined room, display name) is only touched by its own task. Every request
//! gets exactly one response frame. Room events go to other participants
//! through the [`RoomHub`].

use super::hub::{Outbound, RoomHub};
use super::messages::{
    ClientRequest, Event, JoinResponse, Request, ServerMessage, UNPARSEABLE_REQUEST_ID,
};
use super::room_locks::RoomLocks;
use crate::errors::SfuError;
use crate::media::{MediaKind, RtpParameters};
use crate::meetings::MeetingStore;
use crate::observability::{record_signaling_latency, record_signaling_request};
use crate::registry::{MediaStateChange, ResourceId};
use crate::session::SessionManager;
use crate::types::{PeerId, ProducerId, RoomKey, TransportId};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Display name used when a client joins without one.
pub const DEFAULT_DISPLAY_NAME: &str = "Guest";

/// Longest accepted display name, in characters.
pub const MAX_DISPLAY_NAME_CHARS: usize = 64;

/// Longest accepted chat message, in characters.
pub const MAX_CHAT_MESSAGE_CHARS: usize = 2000;

/// Shared services every connection talks to.
pub struct SignalingContext {
    pub sessions: Arc<SessionManager>,
    pub meetings: Arc<dyn MeetingStore>,
    pub hub: Arc<RoomHub>,
    /// Orders room creation and removal with their meeting status updates.
    pub room_locks: RoomLocks,
    /// Limit used when a meeting record carries `max_participants == 0`.
    pub default_max_participants: u32,
}

struct Joined {
    room_key: RoomKey,
    display_name: String,
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, SfuError> {
    serde_json::to_value(value).map_err(|e| SfuError::Internal(format!("encode response: {e}")))
}

/// Signaling state of one client connection.
pub struct SignalingConnection {
    ctx: Arc<SignalingContext>,
    peer_id: PeerId,
    outbound: Outbound,
    joined: Option<Joined>,
}

impl SignalingConnection {
    /// New connection with a fresh peer id. Room events for this peer are
    /// queued on `outbound`.
    #[must_use]
    pub fn new(ctx: Arc<SignalingContext>, outbound: Outbound) -> Self {
        Self {
            ctx,
            peer_id: PeerId::new(),
            outbound,
            joined: None,
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Room this connection has joined, if any.
    #[must_use]
    pub fn room_key(&self) -> Option<&RoomKey> {
        self.joined.as_ref().map(|joined| &joined.room_key)
    }

    /// Handle one text frame. Unparseable frames are answered with an
    /// invalid-request error carrying id 0.
    pub async fn handle_text(&mut self, text: &str) -> ServerMessage {
        match ClientRequest::parse(text) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => {
                debug!(
                    target: "sfu.signaling",
                    peer_id = %self.peer_id,
                    error = %e,
                    "Rejected unparseable frame"
                );
                record_signaling_request("unknown", e.error_type_label());
                ServerMessage::from_error(UNPARSEABLE_REQUEST_ID, &e)
            }
        }
    }

    #[instrument(
        skip_all,
        name = "sfu.signaling.request",
        fields(peer_id = %self.peer_id, id = request.id, method = request.request.method())
    )]
    pub async fn handle_request(&mut self, request: ClientRequest) -> ServerMessage {
        let ClientRequest { id, request } = request;
        let method = request.method();
        let start = Instant::now();

        let result = self.dispatch(request).await;
        record_signaling_latency(method, start.elapsed());

        match result {
            Ok(data) => {
                record_signaling_request(method, "success");
                ServerMessage::Response { id, data }
            }
            Err(e) => {
                record_signaling_request(method, e.error_type_label());
                if e.error_code() == 6 {
                    error!(
                        target: "sfu.signaling",
                        peer_id = %self.peer_id,
                        method = method,
                        error = %e,
                        "Request failed"
                    );
                } else {
                    debug!(
                        target: "sfu.signaling",
                        peer_id = %self.peer_id,
                        method = method,
                        error = %e,
                        "Request rejected"
                    );
                }
                ServerMessage::from_error(id, &e)
            }
        }
    }

    /// Run leave cleanup for a dropped connection. No-op if not joined.
    pub async fn handle_disconnect(&mut self) {
        if let Some(joined) = self.joined.take() {
            info!(
                target: "sfu.signaling",
                peer_id = %self.peer_id,
                room_key = %joined.room_key,
                "Connection dropped, cleaning up peer"
            );
            self.teardown(&joined.room_key).await;
        }
    }

    async fn dispatch(&mut self, request: Request) -> Result<Value, SfuError> {
        let sessions = Arc::clone(&self.ctx.sessions);
        match request {
            Request::Join {
                room_key,
                display_name,
            } => self.join(room_key, display_name).await,
            Request::GetCapabilities => {
                let room_key = self.room()?;
                to_data(&sessions.router_capabilities(&room_key).await?)
            }
            Request::CreateTransport { direction } => {
                let room_key = self.room()?;
                to_data(
                    &sessions
                        .create_transport(&room_key, self.peer_id, direction)
                        .await?,
                )
            }
            Request::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.ensure_owner(ResourceId::Transport(transport_id))
                    .await?;
                sessions
                    .connect_transport(transport_id, dtls_parameters)
                    .await?;
                Ok(Value::Null)
            }
            Request::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => self.produce(transport_id, kind, rtp_parameters).await,
            Request::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                self.room()?;
                to_data(
                    &sessions
                        .consume(transport_id, producer_id, self.peer_id, rtp_capabilities)
                        .await?,
                )
            }
            Request::PauseConsumer { consumer_id } => {
                self.ensure_owner(ResourceId::Consumer(consumer_id)).await?;
                sessions.pause_consumer(consumer_id).await?;
                Ok(Value::Null)
            }
            Request::ResumeConsumer { consumer_id } => {
                self.ensure_owner(ResourceId::Consumer(consumer_id)).await?;
                sessions.resume_consumer(consumer_id).await?;
                Ok(Value::Null)
            }
            Request::CloseProducer { producer_id } => self.close_producer(producer_id).await,
            Request::ToggleAudio { enabled } => {
                self.toggle(MediaStateChange::Audio(enabled)).await
            }
            Request::ToggleVideo { enabled } => {
                self.toggle(MediaStateChange::Video(enabled)).await
            }
            Request::ToggleScreenshare { enabled } => {
                self.toggle(MediaStateChange::ScreenShare(enabled)).await
            }
            Request::ChatMessage { text } => self.chat(&text).await,
            Request::Leave => {
                let joined = self.joined.take().ok_or(SfuError::NotJoined)?;
                self.teardown(&joined.room_key).await;
                Ok(Value::Null)
            }
        }
    }

    fn room(&self) -> Result<RoomKey, SfuError> {
        self.room_key().cloned().ok_or(SfuError::NotJoined)
    }

    async fn ensure_owner(&self, id: ResourceId) -> Result<(), SfuError> {
        let owner = self.ctx.sessions.resource_owner(id).await?;
        if owner != self.peer_id {
            warn!(
                target: "sfu.signaling",
                peer_id = %self.peer_id,
                owner = %owner,
                resource = ?id,
                "Peer tried to act on another participant's resource"
            );
            return Err(SfuError::NotOwner(format!("{id:?}")));
        }
        Ok(())
    }

    async fn join(
        &mut self,
        room_key: RoomKey,
        display_name: Option<String>,
    ) -> Result<Value, SfuError> {
        if let Some(joined) = &self.joined {
            return Err(SfuError::AlreadyJoined(joined.room_key.to_string()));
        }
        if room_key.as_str().trim().is_empty() {
            return Err(SfuError::InvalidRequest(
                "roomKey must not be empty".to_string(),
            ));
        }
        let display_name = display_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string());
        if display_name.chars().count() > MAX_DISPLAY_NAME_CHARS {
            return Err(SfuError::InvalidRequest(format!(
                "displayName exceeds {MAX_DISPLAY_NAME_CHARS} characters"
            )));
        }

        let meeting = self
            .ctx
            .meetings
            .find_active_meeting(&room_key)
            .await?
            .ok_or_else(|| SfuError::MeetingNotFound(room_key.to_string()))?;
        let max_participants = if meeting.max_participants == 0 {
            self.ctx.default_max_participants
        } else {
            meeting.max_participants
        };

        let peer_id = self.peer_id;
        let outcome = self
            .ctx
            .room_locks
            .run(&room_key, async {
                let outcome = self
                    .ctx
                    .sessions
                    .join_room(&room_key, peer_id, display_name.clone(), max_participants)
                    .await?;
                if outcome.room_created {
                    if let Err(e) = self.ctx.meetings.mark_active(&room_key).await {
                        warn!(
                            target: "sfu.signaling",
                            room_key = %room_key,
                            error = %e,
                            "Failed to mark meeting active"
                        );
                    }
                }
                Ok::<_, SfuError>(outcome)
            })
            .await?;
        self.joined = Some(Joined {
            room_key: room_key.clone(),
            display_name,
        });

        // Subscribe before taking the listings so nothing falls in between.
        self.ctx
            .hub
            .subscribe(&room_key, peer_id, self.outbound.clone())
            .await;

        let (own, peers): (Vec<_>, Vec<_>) = self
            .ctx
            .sessions
            .peers_in_room(&room_key, None)
            .await
            .into_iter()
            .partition(|peer| peer.peer_id == peer_id);
        let producers = self
            .ctx
            .sessions
            .producers_in_room(&room_key, Some(peer_id))
            .await;

        if let Some(me) = own.into_iter().next() {
            self.ctx
                .hub
                .broadcast(&room_key, Event::PeerJoined(me), Some(peer_id))
                .await;
        }

        info!(
            target: "sfu.signaling",
            peer_id = %peer_id,
            room_key = %room_key,
            room_created = outcome.room_created,
            existing_peers = peers.len(),
            existing_producers = producers.len(),
            "Peer joined"
        );

        to_data(&JoinResponse {
            room_key,
            peer_id,
            host_id: meeting.host_id,
            max_participants,
            settings: meeting.settings,
            rtp_capabilities: outcome.rtp_capabilities,
            peers,
            producers,
        })
    }

    async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Value, SfuError> {
        let room_key = self.room()?;
        let producer_id = self
            .ctx
            .sessions
            .produce(transport_id, self.peer_id, kind, rtp_parameters)
            .await?;

        self.ctx
            .hub
            .broadcast(
                &room_key,
                Event::NewProducer {
                    producer_id,
                    peer_id: self.peer_id,
                    kind,
                },
                Some(self.peer_id),
            )
            .await;

        Ok(json!({ "id": producer_id }))
    }

    async fn close_producer(&self, producer_id: ProducerId) -> Result<Value, SfuError> {
        self.ensure_owner(ResourceId::Producer(producer_id)).await?;
        let closed = self.ctx.sessions.close_producer(producer_id).await?;

        self.ctx
            .hub
            .broadcast(
                &closed.room_key,
                Event::ProducerClosed {
                    producer_id,
                    peer_id: closed.peer_id,
                },
                Some(self.peer_id),
            )
            .await;
        Ok(Value::Null)
    }

    async fn toggle(&self, change: MediaStateChange) -> Result<Value, SfuError> {
        self.room()?;
        let (room_key, media_state) = self
            .ctx
            .sessions
            .update_media_state(self.peer_id, change)
            .await?;

        self.ctx
            .hub
            .broadcast(
                &room_key,
                Event::MediaStateChanged {
                    peer_id: self.peer_id,
                    media_state,
                },
                Some(self.peer_id),
            )
            .await;
        Ok(Value::Null)
    }

    async fn chat(&self, text: &str) -> Result<Value, SfuError> {
        let joined = self.joined.as_ref().ok_or(SfuError::NotJoined)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(SfuError::InvalidRequest(
                "chat message must not be empty".to_string(),
            ));
        }
        if text.chars().count() > MAX_CHAT_MESSAGE_CHARS {
            return Err(SfuError::InvalidRequest(format!(
                "chat message exceeds {MAX_CHAT_MESSAGE_CHARS} characters"
            )));
        }

        // Message text is not logged.
        self.ctx
            .hub
            .broadcast(
                &joined.room_key,
                Event::ChatMessage {
                    peer_id: self.peer_id,
                    display_name: joined.display_name.clone(),
                    text: text.to_string(),
                    timestamp: Utc::now(),
                },
                None,
            )
            .await;
        Ok(Value::Null)
    }

    /// Leave cleanup shared by `leave` and disconnect.
    async fn teardown(&self, room_key: &RoomKey) {
        let peer_id = self.peer_id;
        self.ctx.hub.unsubscribe(room_key, peer_id).await;

        let closed = self
            .ctx
            .room_locks
            .run(room_key, async {
                let closed = self.ctx.sessions.close_peer(peer_id).await?;
                if closed.room_closed {
                    if let Err(e) = self.ctx.meetings.mark_ended(room_key).await {
                        warn!(
                            target: "sfu.signaling",
                            room_key = %room_key,
                            error = %e,
                            "Failed to mark meeting ended"
                        );
                    }
                }
                Some(closed)
            })
            .await;
        let Some(closed) = closed else {
            return;
        };

        for producer_id in &closed.producer_ids {
            self.ctx
                .hub
                .broadcast(
                    room_key,
                    Event::ProducerClosed {
                        producer_id: *producer_id,
                        peer_id,
                    },
                    None,
                )
                .await;
        }
        self.ctx
            .hub
            .broadcast(room_key, Event::PeerLeft { peer_id }, None)
            .await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::codecs::default_media_codecs;
    use crate::media::loopback::LoopbackWorkerFactory;
    use crate::media::{WebRtcTransportOptions, WorkerSettings};
    use crate::meetings::StaticMeetingStore;
    use crate::workers::{WorkerPool, WorkerPoolConfig};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn context(max_participants: u32) -> Arc<SignalingContext> {
        let pool = WorkerPool::initialize(
            &LoopbackWorkerFactory,
            WorkerPoolConfig {
                num_workers: 1,
                worker_settings: WorkerSettings {
                    rtc_min_port: 40000,
                    rtc_max_port: 40999,
                },
                death_grace: Duration::from_millis(2000),
                cpu_cores: 1,
            },
        )
        .await
        .unwrap();
        let sessions = SessionManager::new(
            Arc::new(pool),
            default_media_codecs(),
            WebRtcTransportOptions {
                listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                announced_ip: None,
                enable_udp: true,
                enable_tcp: false,
                prefer_udp: true,
                initial_available_outgoing_bitrate: 1_000_000,
                min_outgoing_bitrate: 600_000,
                max_incoming_bitrate: 1_500_000,
            },
        );
        Arc::new(SignalingContext {
            sessions: Arc::new(sessions),
            meetings: Arc::new(StaticMeetingStore::new(max_participants)),
            hub: Arc::new(RoomHub::new()),
            room_locks: RoomLocks::new(),
            default_max_participants: 50,
        })
    }

    fn connection(
        ctx: &Arc<SignalingContext>,
    ) -> (SignalingConnection, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(32);
        (SignalingConnection::new(Arc::clone(ctx), tx), rx)
    }

    fn error_code(message: &ServerMessage) -> Option<i32> {
        match message {
            ServerMessage::Error { code, .. } => Some(*code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_unparseable_frame_gets_id_zero_invalid_request() {
        let ctx = context(10).await;
        let (mut conn, _rx) = connection(&ctx);

        let reply = conn.handle_text("{not json").await;
        assert!(matches!(reply, ServerMessage::Error { id: 0, code: 1, .. }));
    }

    #[tokio::test]
    async fn test_requests_before_join_are_forbidden() {
        let ctx = context(10).await;
        let (mut conn, _rx) = connection(&ctx);

        for frame in [
            r#"{"id":1,"method":"get-capabilities"}"#,
            r#"{"id":2,"method":"create-transport","direction":"send"}"#,
            r#"{"id":3,"method":"toggle-audio","enabled":false}"#,
            r#"{"id":4,"method":"chat-message","text":"hi"}"#,
            r#"{"id":5,"method":"leave"}"#,
        ] {
            let reply = conn.handle_text(frame).await;
            assert_eq!(error_code(&reply), Some(3), "frame {frame}");
        }
    }

    #[tokio::test]
    async fn test_second_join_is_conflict() {
        let ctx = context(10).await;
        let (mut conn, _rx) = connection(&ctx);

        let reply = conn
            .handle_text(r#"{"id":1,"method":"join","roomKey":"room"}"#)
            .await;
        assert!(matches!(reply, ServerMessage::Response { id: 1, .. }));
        assert_eq!(conn.room_key(), Some(&RoomKey::from("room")));

        let reply = conn
            .handle_text(r#"{"id":2,"method":"join","roomKey":"other"}"#)
            .await;
        assert_eq!(error_code(&reply), Some(5));
    }

    #[tokio::test]
    async fn test_chat_reaches_whole_room_including_sender() {
        let ctx = context(10).await;
        let (mut alice, mut alice_rx) = connection(&ctx);
        let (mut bob, mut bob_rx) = connection(&ctx);

        alice
            .handle_text(r#"{"id":1,"method":"join","roomKey":"room","displayName":"Alice"}"#)
            .await;
        bob.handle_text(r#"{"id":1,"method":"join","roomKey":"room","displayName":"Bob"}"#)
            .await;
        // Alice hears about Bob.
        assert!(matches!(
            alice_rx.recv().await.unwrap(),
            ServerMessage::Notification(Event::PeerJoined(_))
        ));

        let reply = alice
            .handle_text(r#"{"id":2,"method":"chat-message","text":"  hello  "}"#)
            .await;
        assert!(matches!(reply, ServerMessage::Response { id: 2, .. }));

        for rx in [&mut alice_rx, &mut bob_rx] {
            let message = rx.recv().await.unwrap();
            assert!(matches!(
                message,
                ServerMessage::Notification(Event::ChatMessage { ref display_name, ref text, .. })
                    if display_name == "Alice" && text == "hello"
            ));
        }
    }

    #[tokio::test]
    async fn test_empty_display_name_defaults_and_oversized_chat_is_rejected() {
        let ctx = context(10).await;
        let (mut conn, _rx) = connection(&ctx);
        conn.handle_text(r#"{"id":1,"method":"join","roomKey":"room","displayName":"   "}"#)
            .await;

        let peers = ctx
            .sessions
            .peers_in_room(&RoomKey::from("room"), None)
            .await;
        assert_eq!(
            peers.first().map(|p| p.display_name.as_str()),
            Some(DEFAULT_DISPLAY_NAME)
        );

        let long = "x".repeat(MAX_CHAT_MESSAGE_CHARS + 1);
        let frame = json!({"id": 2, "method": "chat-message", "text": long}).to_string();
        assert_eq!(error_code(&conn.handle_text(&frame).await), Some(1));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_leaves_room() {
        let ctx = context(10).await;
        let (mut conn, _rx) = connection(&ctx);
        conn.handle_text(r#"{"id":1,"method":"join","roomKey":"room"}"#)
            .await;

        conn.handle_disconnect().await;
        conn.handle_disconnect().await;

        assert!(conn.room_key().is_none());
        assert_eq!(ctx.sessions.stats(None).await.unwrap().rooms, 0);
        assert_eq!(ctx.hub.member_count(&RoomKey::from("room")).await, 0);
    }
}
