//! Mock media engine for SFU testing.
//!
//! Every object shares one [`EngineState`] so tests can inspect what the
//! session layer did:
//! - routers created, in total and per worker
//! - the order in which objects were closed
//! - keyframe requests
//!
//! Failures are injected through the builder or at runtime. Delays go
//! through the builder; object-creating calls sleep after the object exists,
//! so a test can tear its owner down while the call is still pending.
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::MockMediaEngine;
//!
//! let engine = MockMediaEngine::builder()
//!     .router_delay(Duration::from_millis(20))
//!     .build();
//!
//! let pool = WorkerPool::initialize(&engine, config).await?;
//! // ...
//! assert_eq!(engine.routers_created(), 1);
//! ```

use async_trait::async_trait;
use sfu_service::media::rtp::{
    DtlsFingerprint, IceCandidate, IceParameters, Protocol, RtpCodecParameters,
};
use sfu_service::media::{
    DtlsParameters, MediaConsumer, MediaError, MediaKind, MediaProducer, MediaRouter,
    MediaTransport, MediaWorker, RtpCapabilities, RtpCodecCapability, RtpParameters,
    TransportParameters, WebRtcTransportOptions, WorkerFactory, WorkerResourceUsage,
    WorkerSettings,
};
use sfu_service::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// An engine object that was closed, in close order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosedObject {
    Consumer(ConsumerId),
    Producer(ProducerId),
    Transport(TransportId),
    Router(RouterId),
}

struct ProducerRecord {
    router_id: RouterId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[derive(Default)]
struct EngineState {
    router_delay: Duration,
    transport_delay: Duration,
    produce_delay: Duration,
    consume_delay: Duration,
    fail_worker_spawn_after: Option<usize>,
    fail_router_creation: AtomicBool,
    fail_transport_creation: AtomicBool,
    fail_key_frame_requests: AtomicBool,

    workers: Mutex<Vec<Arc<MockWorker>>>,
    routers_by_worker: Mutex<HashMap<WorkerId, usize>>,
    producers: Mutex<HashMap<ProducerId, ProducerRecord>>,
    closed: Mutex<Vec<ClosedObject>>,
    key_frame_requests: Mutex<Vec<ConsumerId>>,
}

impl EngineState {
    fn record_close(&self, object: ClosedObject) {
        self.closed.lock().unwrap().push(object);
    }
}

async fn pause_for(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Scriptable media engine; also the [`WorkerFactory`] that spawns it.
#[derive(Clone, Default)]
pub struct MockMediaEngine {
    state: Arc<EngineState>,
}

/// Builder for [`MockMediaEngine`].
#[derive(Default)]
pub struct MockMediaEngineBuilder {
    router_delay: Duration,
    transport_delay: Duration,
    produce_delay: Duration,
    consume_delay: Duration,
    fail_worker_spawn_after: Option<usize>,
}

impl MockMediaEngineBuilder {
    /// Sleep inside every `create_router`, so concurrent callers overlap.
    #[must_use]
    pub fn router_delay(mut self, delay: Duration) -> Self {
        self.router_delay = delay;
        self
    }

    /// Sleep after a transport is built, before handing it back.
    #[must_use]
    pub fn transport_delay(mut self, delay: Duration) -> Self {
        self.transport_delay = delay;
        self
    }

    /// Sleep after a producer is built, before handing it back.
    #[must_use]
    pub fn produce_delay(mut self, delay: Duration) -> Self {
        self.produce_delay = delay;
        self
    }

    /// Sleep after a consumer is built, before handing it back.
    #[must_use]
    pub fn consume_delay(mut self, delay: Duration) -> Self {
        self.consume_delay = delay;
        self
    }

    /// Fail the spawn after `count` workers were spawned.
    #[must_use]
    pub fn fail_worker_spawn_after(mut self, count: usize) -> Self {
        self.fail_worker_spawn_after = Some(count);
        self
    }

    #[must_use]
    pub fn build(self) -> MockMediaEngine {
        MockMediaEngine {
            state: Arc::new(EngineState {
                router_delay: self.router_delay,
                transport_delay: self.transport_delay,
                produce_delay: self.produce_delay,
                consume_delay: self.consume_delay,
                fail_worker_spawn_after: self.fail_worker_spawn_after,
                ..EngineState::default()
            }),
        }
    }
}

impl MockMediaEngine {
    #[must_use]
    pub fn builder() -> MockMediaEngineBuilder {
        MockMediaEngineBuilder::default()
    }

    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Make subsequent `create_router` calls fail (or succeed again).
    pub fn set_fail_router_creation(&self, fail: bool) {
        self.state.fail_router_creation.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `create_webrtc_transport` calls fail (or succeed again).
    pub fn set_fail_transport_creation(&self, fail: bool) {
        self.state
            .fail_transport_creation
            .store(fail, Ordering::SeqCst);
    }

    /// Make subsequent keyframe requests fail (or succeed again).
    pub fn set_fail_key_frame_requests(&self, fail: bool) {
        self.state
            .fail_key_frame_requests
            .store(fail, Ordering::SeqCst);
    }

    /// Total routers ever created.
    #[must_use]
    pub fn routers_created(&self) -> usize {
        self.state.routers_by_worker.lock().unwrap().values().sum()
    }

    /// Routers ever created on each worker, in spawn order.
    #[must_use]
    pub fn routers_per_worker(&self) -> Vec<usize> {
        let by_worker = self.state.routers_by_worker.lock().unwrap();
        self.state
            .workers
            .lock()
            .unwrap()
            .iter()
            .map(|worker| by_worker.get(&worker.id).copied().unwrap_or(0))
            .collect()
    }

    /// Closed objects, in close order.
    #[must_use]
    pub fn closed_objects(&self) -> Vec<ClosedObject> {
        self.state.closed.lock().unwrap().clone()
    }

    /// Consumers a keyframe was requested for, in request order.
    #[must_use]
    pub fn key_frame_requests(&self) -> Vec<ConsumerId> {
        self.state.key_frame_requests.lock().unwrap().clone()
    }

    /// Spawned workers, in spawn order.
    #[must_use]
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.state
            .workers
            .lock()
            .unwrap()
            .iter()
            .map(|worker| worker.id)
            .collect()
    }

    /// Simulate the crash of the worker spawned at `index`.
    ///
    /// # Panics
    ///
    /// Panics if no worker was spawned at `index`.
    pub fn kill_worker(&self, index: usize) {
        let workers = self.state.workers.lock().unwrap();
        let worker = workers.get(index).expect("no worker at index");
        worker.closed.store(true, Ordering::SeqCst);
        worker.died.cancel();
    }
}

#[async_trait]
impl WorkerFactory for MockMediaEngine {
    async fn spawn_worker(
        &self,
        _settings: &WorkerSettings,
    ) -> Result<Arc<dyn MediaWorker>, MediaError> {
        let mut workers = self.state.workers.lock().unwrap();
        if self.state.fail_worker_spawn_after == Some(workers.len()) {
            return Err(MediaError::Engine("injected spawn failure".to_string()));
        }
        let worker = Arc::new(MockWorker {
            id: WorkerId::new(),
            state: Arc::clone(&self.state),
            died: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        workers.push(Arc::clone(&worker));
        Ok(worker)
    }
}

struct MockWorker {
    id: WorkerId,
    state: Arc<EngineState>,
    died: CancellationToken,
    closed: AtomicBool,
}

#[async_trait]
impl MediaWorker for MockWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn MediaRouter>, MediaError> {
        pause_for(self.state.router_delay).await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::WorkerDied);
        }
        if self.state.fail_router_creation.load(Ordering::SeqCst) {
            return Err(MediaError::Engine("injected router failure".to_string()));
        }

        *self
            .state
            .routers_by_worker
            .lock()
            .unwrap()
            .entry(self.id)
            .or_default() += 1;

        Ok(Arc::new(MockRouter {
            id: RouterId::new(),
            capabilities: RtpCapabilities::from_media_codecs(media_codecs),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    async fn resource_usage(&self) -> Result<WorkerResourceUsage, MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed("worker"));
        }
        Ok(WorkerResourceUsage {
            router_count: self
                .state
                .routers_by_worker
                .lock()
                .unwrap()
                .get(&self.id)
                .copied()
                .unwrap_or(0),
            ..WorkerResourceUsage::default()
        })
    }

    async fn died(&self) {
        self.died.cancelled().await;
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MockRouter {
    id: RouterId,
    capabilities: RtpCapabilities,
    state: Arc<EngineState>,
    closed: AtomicBool,
}

fn mock_transport_parameters(id: TransportId, options: &WebRtcTransportOptions) -> TransportParameters {
    TransportParameters {
        id,
        ice_parameters: IceParameters {
            username_fragment: "mockufrag".to_string(),
            password: "mockpassword".to_string(),
            ice_lite: true,
        },
        ice_candidates: vec![IceCandidate {
            foundation: "udpcandidate".to_string(),
            priority: 1,
            ip: options
                .announced_ip
                .clone()
                .unwrap_or_else(|| options.listen_ip.to_string()),
            protocol: Protocol::Udp,
            port: 40000,
            candidate_type: "host".to_string(),
            tcp_type: None,
        }],
        dtls_parameters: DtlsParameters {
            role: None,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "00:11:22:33".to_string(),
            }],
        },
    }
}

#[async_trait]
impl MediaRouter for MockRouter {
    fn id(&self) -> RouterId {
        self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn can_consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        let producers = self.state.producers.lock().unwrap();
        producers.get(&producer_id).is_some_and(|record| {
            record.router_id == self.id
                && record
                    .rtp_parameters
                    .codecs
                    .iter()
                    .any(|codec| rtp_capabilities.supports(codec))
        })
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed("router"));
        }
        if self.state.fail_transport_creation.load(Ordering::SeqCst) {
            return Err(MediaError::Engine("injected transport failure".to_string()));
        }
        let id = TransportId::new();
        let transport = Arc::new(MockTransport {
            parameters: mock_transport_parameters(id, options),
            id,
            router_id: self.id,
            capabilities: self.capabilities.clone(),
            state: Arc::clone(&self.state),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        pause_for(self.state.transport_delay).await;
        Ok(transport)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.record_close(ClosedObject::Router(self.id));
        }
    }
}

struct MockTransport {
    id: TransportId,
    router_id: RouterId,
    parameters: TransportParameters,
    capabilities: RtpCapabilities,
    state: Arc<EngineState>,
    connected: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl MediaTransport for MockTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn parameters(&self) -> TransportParameters {
        self.parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed("transport"));
        }
        if dtls_parameters.fingerprints.is_empty() {
            return Err(MediaError::InvalidParameters(
                "missing DTLS fingerprint".to_string(),
            ));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(MediaError::InvalidState("already connected".to_string()));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn MediaProducer>, MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed("transport"));
        }
        let Some(codec) = rtp_parameters.codecs.first() else {
            return Err(MediaError::InvalidParameters("no codecs".to_string()));
        };
        if !kind.matches_mime_type(&codec.mime_type) || !self.capabilities.supports(codec) {
            return Err(MediaError::UnsupportedCodec(codec.mime_type.clone()));
        }

        let id = ProducerId::new();
        self.state.producers.lock().unwrap().insert(
            id,
            ProducerRecord {
                router_id: self.router_id,
                kind,
                rtp_parameters: rtp_parameters.clone(),
            },
        );
        let producer = Arc::new(MockProducer {
            id,
            kind,
            rtp_parameters,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        });
        pause_for(self.state.produce_delay).await;
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed("transport"));
        }
        let (kind, codecs) = {
            let producers = self.state.producers.lock().unwrap();
            let record = producers
                .get(&producer_id)
                .filter(|record| record.router_id == self.router_id)
                .ok_or_else(|| MediaError::InvalidParameters("unknown producer".to_string()))?;
            let codecs: Vec<RtpCodecParameters> = record
                .rtp_parameters
                .codecs
                .iter()
                .filter(|codec| rtp_capabilities.supports(codec))
                .cloned()
                .collect();
            (record.kind, codecs)
        };
        if codecs.is_empty() {
            return Err(MediaError::UnsupportedCodec(
                "no common codec".to_string(),
            ));
        }

        let consumer = Arc::new(MockConsumer {
            id: ConsumerId::new(),
            producer_id,
            kind,
            rtp_parameters: RtpParameters {
                codecs,
                ..RtpParameters::default()
            },
            state: Arc::clone(&self.state),
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
        });
        pause_for(self.state.consume_delay).await;
        Ok(consumer)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.record_close(ClosedObject::Transport(self.id));
        }
    }
}

struct MockProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    state: Arc<EngineState>,
    closed: AtomicBool,
}

#[async_trait]
impl MediaProducer for MockProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.producers.lock().unwrap().remove(&self.id);
            self.state.record_close(ClosedObject::Producer(self.id));
        }
    }
}

struct MockConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    state: Arc<EngineState>,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl MediaConsumer for MockConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn pause(&self) -> Result<(), MediaError> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), MediaError> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn request_key_frame(&self) -> Result<(), MediaError> {
        if self.state.fail_key_frame_requests.load(Ordering::SeqCst) {
            return Err(MediaError::Engine("injected keyframe failure".to_string()));
        }
        self.state.key_frame_requests.lock().unwrap().push(self.id);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.record_close(ClosedObject::Consumer(self.id));
        }
    }
}
