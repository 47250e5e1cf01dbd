//! Signaling protocol flows driven through `SignalingConnection`.
//!
//! Each test plays one or more clients against the mock media engine and the
//! mock meeting store, checking responses, room events and store calls.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sfu_service::media::TransportParameters;
use sfu_service::signaling::{Event, ServerMessage, SignalingConnection};
use sfu_service::types::{PeerId, ProducerId, RoomKey};
use sfu_test_utils::{
    client_dtls_parameters, full_capabilities, opus_parameters, vp8_parameters, ClosedObject,
    MockMediaEngine, MockMeetingStore, SignalingHarness, StoreCall,
};
use tokio::sync::mpsc;

// ============================================================================
// Helpers
// ============================================================================

struct Client {
    conn: SignalingConnection,
    events: mpsc::Receiver<ServerMessage>,
    next_id: u64,
}

impl Client {
    fn new(harness: &SignalingHarness) -> Self {
        let (conn, events) = harness.connect();
        Self {
            conn,
            events,
            next_id: 1,
        }
    }

    /// Send a request; `Ok(data)` for a response, `Err((code, message))` for
    /// an error.
    async fn call(&mut self, method: &str, params: Value) -> Result<Value, (i32, String)> {
        let id = self.next_id;
        self.next_id += 1;

        let mut frame = params.as_object().cloned().unwrap_or_default();
        frame.insert("id".to_string(), json!(id));
        frame.insert("method".to_string(), json!(method));

        match self.conn.handle_text(&Value::Object(frame).to_string()).await {
            ServerMessage::Response { id: reply_id, data } => {
                assert_eq!(reply_id, id);
                Ok(data)
            }
            ServerMessage::Error {
                id: reply_id,
                code,
                message,
            } => {
                assert_eq!(reply_id, id);
                Err((code, message))
            }
            ServerMessage::Notification(event) => {
                Err((-1, format!("notification instead of reply: {event:?}")))
            }
        }
    }

    async fn ok(&mut self, method: &str, params: Value) -> Value {
        self.call(method, params).await.expect("request should succeed")
    }

    async fn code(&mut self, method: &str, params: Value) -> i32 {
        self.call(method, params)
            .await
            .expect_err("request should fail")
            .0
    }

    async fn join(&mut self, room: &str, name: &str) -> Value {
        self.ok("join", json!({"roomKey": room, "displayName": name}))
            .await
    }

    async fn transport(&mut self, direction: &str) -> TransportParameters {
        let data = self
            .ok("create-transport", json!({"direction": direction}))
            .await;
        serde_json::from_value(data).unwrap()
    }

    /// Events queued so far.
    fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(message) = self.events.try_recv() {
            if let ServerMessage::Notification(event) = message {
                events.push(event);
            }
        }
        events
    }
}

fn field<'a>(value: &'a Value, name: &str) -> &'a Value {
    value.get(name).unwrap_or(&Value::Null)
}

fn peer_id_of(join_response: &Value) -> PeerId {
    serde_json::from_value(field(join_response, "peerId").clone()).unwrap()
}

async fn harness_with(
    store: MockMeetingStore,
) -> (MockMediaEngine, Arc<MockMeetingStore>, SignalingHarness) {
    let engine = MockMediaEngine::new();
    let store = Arc::new(store);
    let harness = SignalingHarness::new(&engine, 2, Arc::clone(&store) as _).await;
    (engine, store, harness)
}

fn room_m1(max_participants: u32) -> MockMeetingStore {
    MockMeetingStore::new().with_meeting("m1", max_participants)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_first_join_creates_room_and_marks_meeting_active() {
    let (engine, store, harness) = harness_with(room_m1(10)).await;
    let mut alice = Client::new(&harness);

    let joined = alice.join("m1", "Alice").await;

    assert_eq!(*field(&joined, "roomKey"), "m1");
    assert_eq!(*field(&joined, "maxParticipants"), 10);
    assert_eq!(*field(&joined, "hostId"), "host-user");
    assert_eq!(field(&joined, "peers"), &json!([]));
    assert_eq!(field(&joined, "producers"), &json!([]));
    let codecs = field(field(&joined, "rtpCapabilities"), "codecs");
    assert!(codecs.as_array().is_some_and(|c| !c.is_empty()));

    assert_eq!(engine.routers_created(), 1);
    assert_eq!(store.calls(), vec![StoreCall::MarkActive(RoomKey::from("m1"))]);
}

#[tokio::test]
async fn test_second_join_sees_existing_peers_and_producers() {
    let (engine, store, harness) = harness_with(room_m1(10)).await;
    let mut alice = Client::new(&harness);
    let mut bob = Client::new(&harness);

    let alice_joined = alice.join("m1", "Alice").await;
    let alice_id = peer_id_of(&alice_joined);
    let send = alice.transport("send").await;
    alice
        .ok(
            "connect-transport",
            json!({"transportId": send.id, "dtlsParameters": client_dtls_parameters()}),
        )
        .await;
    let produced = alice
        .ok(
            "produce",
            json!({"transportId": send.id, "kind": "audio", "rtpParameters": opus_parameters()}),
        )
        .await;

    let bob_joined = bob.join("m1", "Bob").await;
    let bob_id = peer_id_of(&bob_joined);

    let peers = field(&bob_joined, "peers").as_array().cloned().unwrap();
    assert_eq!(peers.len(), 1);
    let alice_listed = peers.first().unwrap();
    assert_eq!(*field(alice_listed, "displayName"), "Alice");
    assert_eq!(field(alice_listed, "peerId"), &json!(alice_id));
    assert_eq!(
        field(alice_listed, "mediaState"),
        &json!({"audioEnabled": true, "videoEnabled": true, "screenSharing": false})
    );

    let producers = field(&bob_joined, "producers").as_array().cloned().unwrap();
    assert_eq!(producers.len(), 1);
    let listed = producers.first().unwrap();
    assert_eq!(field(listed, "producerId"), field(&produced, "id"));
    assert_eq!(*field(listed, "kind"), "audio");

    // Alice hears about Bob; no second router; room was already active.
    assert!(matches!(
        alice.drain().as_slice(),
        [Event::PeerJoined(peer)] if peer.peer_id == bob_id && peer.display_name == "Bob"
    ));
    assert_eq!(engine.routers_created(), 1);
    assert_eq!(store.calls().len(), 1);
}

#[tokio::test]
async fn test_consume_flow_announces_producer_and_returns_unpaused_consumer() {
    let (engine, _store, harness) = harness_with(room_m1(10)).await;
    let mut alice = Client::new(&harness);
    let mut bob = Client::new(&harness);

    let alice_id = peer_id_of(&alice.join("m1", "Alice").await);
    bob.join("m1", "Bob").await;
    let recv = bob.transport("recv").await;
    alice.drain();

    let send = alice.transport("send").await;
    let produced = alice
        .ok(
            "produce",
            json!({"transportId": send.id, "kind": "video", "rtpParameters": vp8_parameters()}),
        )
        .await;
    let producer_id: ProducerId = serde_json::from_value(field(&produced, "id").clone()).unwrap();

    assert!(matches!(
        bob.drain().as_slice(),
        [Event::NewProducer { producer_id: announced, peer_id, .. }]
            if *announced == producer_id && *peer_id == alice_id
    ));
    assert!(alice.drain().is_empty(), "producer is not announced to its owner");

    let consumer = bob
        .ok(
            "consume",
            json!({
                "transportId": recv.id,
                "producerId": producer_id,
                "rtpCapabilities": full_capabilities(),
            }),
        )
        .await;
    assert_eq!(*field(&consumer, "paused"), false);
    assert_eq!(*field(&consumer, "kind"), "video");
    assert_eq!(engine.key_frame_requests().len(), 1);

    let consumer_id = field(&consumer, "id").clone();
    bob.ok("pause-consumer", json!({"consumerId": consumer_id}))
        .await;
    bob.ok("resume-consumer", json!({"consumerId": consumer_id}))
        .await;
}

#[tokio::test]
async fn test_abrupt_disconnect_cleans_up_and_notifies_room() {
    let (engine, store, harness) = harness_with(room_m1(10)).await;
    let mut alice = Client::new(&harness);
    let mut bob = Client::new(&harness);

    alice.join("m1", "Alice").await;
    let bob_id = peer_id_of(&bob.join("m1", "Bob").await);
    let send = bob.transport("send").await;
    let produced = bob
        .ok(
            "produce",
            json!({"transportId": send.id, "kind": "audio", "rtpParameters": opus_parameters()}),
        )
        .await;
    alice.drain();

    bob.conn.handle_disconnect().await;

    let events = alice.drain();
    assert!(matches!(
        events.as_slice(),
        [
            Event::ProducerClosed { peer_id: closed_by, producer_id },
            Event::PeerLeft { peer_id: left },
        ] if *closed_by == bob_id && *left == bob_id && json!(producer_id) == *field(&produced, "id")
    ));

    let room = RoomKey::from("m1");
    let stats = harness.session.sessions.stats(Some(&room)).await.unwrap();
    assert_eq!(stats.peers, 1);
    assert_eq!(stats.transports, 0);
    assert_eq!(stats.producers, 0);
    assert!(engine
        .closed_objects()
        .contains(&ClosedObject::Transport(send.id)));
    assert_eq!(store.calls().len(), 1, "room is still active");
}

#[tokio::test]
async fn test_last_leave_removes_room_and_marks_meeting_ended() {
    let (engine, store, harness) = harness_with(room_m1(10)).await;
    let mut alice = Client::new(&harness);

    alice.join("m1", "Alice").await;
    assert_eq!(alice.ok("leave", json!({})).await, Value::Null);

    let stats = harness.session.sessions.stats(None).await.unwrap();
    assert_eq!(stats.rooms, 0);
    assert!(matches!(
        engine.closed_objects().last(),
        Some(ClosedObject::Router(_))
    ));
    assert_eq!(
        store.calls(),
        vec![
            StoreCall::MarkActive(RoomKey::from("m1")),
            StoreCall::MarkEnded(RoomKey::from("m1")),
        ]
    );

    // A later disconnect does nothing more.
    alice.conn.handle_disconnect().await;
    assert_eq!(store.calls().len(), 2);
}

#[tokio::test]
async fn test_join_at_capacity_fails_and_registers_nothing() {
    let (_engine, _store, harness) = harness_with(room_m1(1)).await;
    let mut alice = Client::new(&harness);
    let mut bob = Client::new(&harness);

    alice.join("m1", "Alice").await;
    let code = bob
        .code("join", json!({"roomKey": "m1", "displayName": "Bob"}))
        .await;

    assert_eq!(code, 7);
    assert!(bob.conn.room_key().is_none());
    assert_eq!(
        harness.session.sessions.stats(None).await.unwrap().peers,
        1
    );
    assert!(alice.drain().is_empty());

    // The failed join left no state behind.
    assert_eq!(
        bob.code("create-transport", json!({"direction": "recv"})).await,
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_while_room_is_ending_keeps_meeting_active() {
    let (_engine, store, harness) =
        harness_with(room_m1(10).mark_ended_delay(Duration::from_millis(50))).await;
    let mut alice = Client::new(&harness);
    let mut bob = Client::new(&harness);
    let mut carol = Client::new(&harness);

    alice.join("m1", "Alice").await;
    let leaving = tokio::spawn(async move { alice.ok("leave", json!({})).await });

    // Bob arrives while the empty room's end is still being written.
    tokio::time::sleep(Duration::from_millis(10)).await;
    bob.join("m1", "Bob").await;
    leaving.await.unwrap();

    let room = RoomKey::from("m1");
    assert_eq!(
        store.calls(),
        vec![
            StoreCall::MarkActive(room.clone()),
            StoreCall::MarkEnded(room.clone()),
            StoreCall::MarkActive(room.clone()),
        ]
    );
    assert!(store.is_active("m1"));

    carol.join("m1", "Carol").await;
    let stats = harness.session.sessions.stats(Some(&room)).await.unwrap();
    assert_eq!(stats.peers, 2);
}

// ============================================================================
// Policy
// ============================================================================

#[tokio::test]
async fn test_unknown_meeting_is_not_found() {
    let (engine, store, harness) = harness_with(MockMeetingStore::new()).await;
    let mut alice = Client::new(&harness);

    let code = alice.code("join", json!({"roomKey": "nope"})).await;

    assert_eq!(code, 4);
    assert_eq!(engine.routers_created(), 0);
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn test_meeting_store_failures() {
    // Lookup failure fails the join with an internal error.
    let (_engine, _store, harness) = harness_with(MockMeetingStore::new().failing_lookups()).await;
    let mut alice = Client::new(&harness);
    let (code, message) = alice
        .call("join", json!({"roomKey": "m1"}))
        .await
        .unwrap_err();
    assert_eq!(code, 6);
    assert_eq!(message, "An internal error occurred");

    // Mark failures are logged only.
    let (_engine, store, harness) =
        harness_with(MockMeetingStore::new().with_meeting("m1", 5).failing_marks()).await;
    let mut alice = Client::new(&harness);
    alice.join("m1", "Alice").await;
    alice.ok("leave", json!({})).await;
    assert_eq!(store.calls().len(), 2);
}

#[tokio::test]
async fn test_peers_cannot_touch_each_others_resources() {
    let (_engine, _store, harness) = harness_with(room_m1(10)).await;
    let mut alice = Client::new(&harness);
    let mut mallory = Client::new(&harness);

    alice.join("m1", "Alice").await;
    mallory.join("m1", "Mallory").await;
    let send = alice.transport("send").await;
    let produced = alice
        .ok(
            "produce",
            json!({"transportId": send.id, "kind": "audio", "rtpParameters": opus_parameters()}),
        )
        .await;

    let connect = mallory
        .code(
            "connect-transport",
            json!({"transportId": send.id, "dtlsParameters": client_dtls_parameters()}),
        )
        .await;
    let produce = mallory
        .code(
            "produce",
            json!({"transportId": send.id, "kind": "audio", "rtpParameters": opus_parameters()}),
        )
        .await;
    let close = mallory
        .code("close-producer", json!({"producerId": field(&produced, "id")}))
        .await;

    assert_eq!((connect, produce, close), (3, 3, 3));
    assert_eq!(
        harness.session.sessions.stats(None).await.unwrap().producers,
        1
    );
}

#[tokio::test]
async fn test_close_producer_notifies_others() {
    let (_engine, _store, harness) = harness_with(room_m1(10)).await;
    let mut alice = Client::new(&harness);
    let mut bob = Client::new(&harness);

    let alice_id = peer_id_of(&alice.join("m1", "Alice").await);
    bob.join("m1", "Bob").await;
    let send = alice.transport("send").await;
    let produced = alice
        .ok(
            "produce",
            json!({"transportId": send.id, "kind": "audio", "rtpParameters": opus_parameters()}),
        )
        .await;
    bob.drain();

    alice
        .ok("close-producer", json!({"producerId": field(&produced, "id")}))
        .await;

    assert!(matches!(
        bob.drain().as_slice(),
        [Event::ProducerClosed { peer_id, .. }] if *peer_id == alice_id
    ));
    assert!(alice.drain().is_empty());
}

#[tokio::test]
async fn test_media_toggles_are_broadcast_and_listed() {
    let (_engine, _store, harness) = harness_with(room_m1(10)).await;
    let mut alice = Client::new(&harness);
    let mut bob = Client::new(&harness);

    let alice_id = peer_id_of(&alice.join("m1", "Alice").await);
    alice.ok("toggle-audio", json!({"enabled": false})).await;
    alice.ok("toggle-screenshare", json!({"enabled": true})).await;

    let joined = bob.join("m1", "Bob").await;
    let peers = field(&joined, "peers").as_array().cloned().unwrap();
    assert_eq!(
        field(peers.first().unwrap(), "mediaState"),
        &json!({"audioEnabled": false, "videoEnabled": true, "screenSharing": true})
    );

    alice.drain();
    alice.ok("toggle-video", json!({"enabled": false})).await;
    assert!(matches!(
        bob.drain().as_slice(),
        [Event::MediaStateChanged { peer_id, media_state }]
            if *peer_id == alice_id && !media_state.video_enabled
    ));
    assert!(alice.drain().is_empty());
}

#[tokio::test]
async fn test_every_frame_gets_exactly_one_reply() {
    let (_engine, _store, harness) = harness_with(room_m1(10)).await;
    let (mut conn, _events) = harness.connect();

    let replies = [
        conn.handle_text("").await,
        conn.handle_text(r#"{"method":"join"}"#).await,
        conn.handle_text(r#"{"id":3,"method":"join"}"#).await,
        conn.handle_text(r#"{"id":4,"method":"join","roomKey":"m1"}"#).await,
    ];

    assert!(matches!(
        &replies,
        [
            ServerMessage::Error { id: 0, code: 1, .. },
            ServerMessage::Error { id: 0, code: 1, .. },
            ServerMessage::Error { id: 0, code: 1, .. },
            ServerMessage::Response { id: 4, .. },
        ]
    ));
}
