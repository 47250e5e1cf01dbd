//! Test fixtures: RTP/DTLS data and harnesses wiring the SFU together on top
//! of the mock media engine.

use crate::mock_media::MockMediaEngine;
use serde_json::Map;
use sfu_service::media::codecs::default_media_codecs;
use sfu_service::media::rtp::{DtlsFingerprint, RtpCodecParameters};
use sfu_service::media::{
    DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, WebRtcTransportOptions,
    WorkerSettings,
};
use sfu_service::meetings::MeetingStore;
use sfu_service::session::SessionManager;
use sfu_service::signaling::{
    RoomHub, RoomLocks, ServerMessage, SignalingConnection, SignalingContext,
};
use sfu_service::workers::{WorkerPool, WorkerPoolConfig};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Grace delay used by harness worker pools.
pub const TEST_DEATH_GRACE: Duration = Duration::from_millis(2000);

fn codec(mime_type: &str, payload_type: u8, clock_rate: u32, channels: Option<u8>) -> RtpCodecParameters {
    RtpCodecParameters {
        mime_type: mime_type.to_string(),
        payload_type,
        clock_rate,
        channels,
        parameters: Map::new(),
        rtcp_feedback: vec![],
    }
}

/// Opus send parameters.
#[must_use]
pub fn opus_parameters() -> RtpParameters {
    RtpParameters {
        codecs: vec![codec("audio/opus", 100, 48000, Some(2))],
        ..RtpParameters::default()
    }
}

/// VP8 send parameters.
#[must_use]
pub fn vp8_parameters() -> RtpParameters {
    RtpParameters {
        codecs: vec![codec("video/VP8", 101, 90000, None)],
        ..RtpParameters::default()
    }
}

/// Send parameters for the given kind.
#[must_use]
pub fn send_parameters(kind: MediaKind) -> RtpParameters {
    match kind {
        MediaKind::Audio => opus_parameters(),
        MediaKind::Video => vp8_parameters(),
    }
}

/// Receiver capabilities covering every codec the SFU offers.
#[must_use]
pub fn full_capabilities() -> RtpCapabilities {
    RtpCapabilities::from_media_codecs(&default_media_codecs())
}

/// Receiver capabilities that can only decode audio.
#[must_use]
pub fn audio_only_capabilities() -> RtpCapabilities {
    RtpCapabilities::from_media_codecs(
        &default_media_codecs()
            .into_iter()
            .filter(|codec| codec.kind == MediaKind::Audio)
            .collect::<Vec<_>>(),
    )
}

/// Client DTLS parameters with one SHA-256 fingerprint.
#[must_use]
pub fn client_dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: None,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AA:BB:CC:DD".to_string(),
        }],
    }
}

/// Transport options bound to localhost.
#[must_use]
pub fn test_transport_options() -> WebRtcTransportOptions {
    WebRtcTransportOptions {
        listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        announced_ip: None,
        enable_udp: true,
        enable_tcp: true,
        prefer_udp: true,
        initial_available_outgoing_bitrate: 1_000_000,
        min_outgoing_bitrate: 600_000,
        max_incoming_bitrate: 1_500_000,
    }
}

/// Worker pool config for `num_workers` mock workers.
#[must_use]
pub fn test_pool_config(num_workers: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        num_workers,
        worker_settings: WorkerSettings {
            rtc_min_port: 40000,
            rtc_max_port: 40999,
        },
        death_grace: TEST_DEATH_GRACE,
        cpu_cores: num_workers,
    }
}

/// Worker pool plus session manager on the mock engine.
pub struct SessionHarness {
    pub engine: MockMediaEngine,
    pub pool: Arc<WorkerPool>,
    pub sessions: Arc<SessionManager>,
}

impl SessionHarness {
    /// # Panics
    ///
    /// Panics if the worker pool fails to start.
    pub async fn new(engine: &MockMediaEngine, num_workers: usize) -> Self {
        let pool = WorkerPool::initialize(engine, test_pool_config(num_workers))
            .await
            .expect("worker pool should start");
        let pool = Arc::new(pool);
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&pool),
            default_media_codecs(),
            test_transport_options(),
        ));
        Self {
            engine: engine.clone(),
            pool,
            sessions,
        }
    }
}

/// Signaling context on top of a [`SessionHarness`].
pub struct SignalingHarness {
    pub session: SessionHarness,
    pub ctx: Arc<SignalingContext>,
}

impl SignalingHarness {
    pub async fn new(
        engine: &MockMediaEngine,
        num_workers: usize,
        meetings: Arc<dyn MeetingStore>,
    ) -> Self {
        let session = SessionHarness::new(engine, num_workers).await;
        let ctx = Arc::new(SignalingContext {
            sessions: Arc::clone(&session.sessions),
            meetings,
            hub: Arc::new(RoomHub::new()),
            room_locks: RoomLocks::new(),
            default_max_participants: 50,
        });
        Self { session, ctx }
    }

    /// A new client connection and the receiving end of its event queue.
    #[must_use]
    pub fn connect(&self) -> (SignalingConnection, mpsc::Receiver<ServerMessage>) {
        let (outbound, events) = mpsc::channel(64);
        (SignalingConnection::new(Arc::clone(&self.ctx), outbound), events)
    }
}
