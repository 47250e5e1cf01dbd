//! Media engine boundary.
//!
//! The SFU does not touch RTP itself. Media is relayed by an external engine
//! organised as workers hosting routers, routers hosting transports, and
//! transports hosting producers and consumers. This module defines that
//! boundary as traits so the orchestration core can be driven by any engine
//! binding (and by mocks in tests).
//!
//! ```text
//! WorkerFactory ──spawn──▶ MediaWorker ──create_router──▶ MediaRouter
//!                                                            │
//!                                          create_webrtc_transport
//!                                                            ▼
//!                          MediaProducer ◀──produce── MediaTransport ──consume──▶ MediaConsumer
//! ```
//!
//! # Modules
//!
//! - [`rtp`] - Parameter types shared with clients
//! - [`codecs`] - Codecs routers are created with
//! - [`loopback`] - In-process engine that negotiates but forwards no media

pub mod codecs;
pub mod loopback;
pub mod rtp;

use crate::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use rtp::{
    DtlsParameters, MediaKind, RtpCapabilities, RtpCodecCapability, RtpParameters,
    TransportParameters, WebRtcTransportOptions, WorkerResourceUsage, WorkerSettings,
};

/// Errors reported by the media engine.
#[derive(Debug, Error)]
pub enum MediaError {
    /// The object was already closed.
    #[error("{0} closed")]
    Closed(&'static str),

    /// The worker hosting the object died.
    #[error("worker died")]
    WorkerDied,

    /// A codec is not supported by the router or the receiving side.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Parameters were rejected by the engine.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Operation not valid in the object's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Any other engine failure.
    #[error("engine failure: {0}")]
    Engine(String),
}

/// Spawns media-engine workers.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Spawn one worker configured with the given port range.
    async fn spawn_worker(
        &self,
        settings: &WorkerSettings,
    ) -> Result<Arc<dyn MediaWorker>, MediaError>;
}

/// One media-processing worker.
#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> WorkerId;

    /// Create a router able to negotiate the given codecs.
    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn MediaRouter>, MediaError>;

    async fn resource_usage(&self) -> Result<WorkerResourceUsage, MediaError>;

    /// Resolves when the worker dies unexpectedly. Never resolves after a
    /// regular [`MediaWorker::close`].
    async fn died(&self);

    async fn close(&self);
}

/// Per-room codec negotiation context.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> RouterId;

    /// Codecs this router negotiates, with payload types assigned.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a receiver with `rtp_capabilities` can consume the producer.
    async fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities)
        -> bool;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, MediaError>;

    async fn close(&self);
}

/// A negotiated network conduit for one peer.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> TransportId;

    /// ICE/DTLS material the remote side needs to connect.
    fn parameters(&self) -> TransportParameters;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), MediaError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn MediaProducer>, MediaError>;

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError>;

    async fn close(&self);
}

/// A peer's outgoing media track.
#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    async fn close(&self);
}

/// A peer's view of a remote producer.
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn producer_id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    async fn pause(&self) -> Result<(), MediaError>;
    async fn resume(&self) -> Result<(), MediaError>;
    async fn request_key_frame(&self) -> Result<(), MediaError>;
    async fn close(&self);
}
