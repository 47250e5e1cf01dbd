//! Loopback media engine.
//!
//! An in-process engine that performs the full negotiation bookkeeping
//! (routers, transports with ICE/DTLS material, producers, consumers, codec
//! matching) but relays no packets. Used for development deployments without
//! an engine binding and by unit tests.
//!
//! ICE credentials and DTLS fingerprints are generated from the system CSPRNG
//! so clients see realistic parameters; candidates advertise the configured
//! announced (or listen) address with ports taken round-robin from the
//! worker's RTC port range.

use super::rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind, Protocol,
    RtpCapabilities, RtpCodecCapability, RtpParameters, TransportParameters,
    WebRtcTransportOptions, WorkerResourceUsage, WorkerSettings,
};
use super::{
    MediaConsumer, MediaError, MediaProducer, MediaRouter, MediaTransport, MediaWorker,
    WorkerFactory,
};
use crate::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};

use async_trait::async_trait;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// ICE priority of the UDP host candidate.
const UDP_CANDIDATE_PRIORITY: u32 = 1_076_302_079;

/// ICE priority of the TCP host candidate.
const TCP_CANDIDATE_PRIORITY: u32 = 1_076_276_479;

type ProducerTable = Arc<Mutex<HashMap<ProducerId, RtpParameters>>>;

fn random_hex(rng: &SystemRandom, byte_len: usize) -> Result<String, MediaError> {
    let mut bytes = vec![0u8; byte_len];
    rng.fill(&mut bytes)
        .map_err(|_| MediaError::Engine("system random source unavailable".to_string()))?;
    Ok(hex::encode(bytes))
}

fn random_fingerprint(rng: &SystemRandom) -> Result<DtlsFingerprint, MediaError> {
    let mut seed = [0u8; 32];
    rng.fill(&mut seed)
        .map_err(|_| MediaError::Engine("system random source unavailable".to_string()))?;
    let value = digest::digest(&digest::SHA256, &seed)
        .as_ref()
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");

    Ok(DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    })
}

/// Hands out ports from a worker's RTC range in round-robin order.
#[derive(Debug)]
struct PortAllocator {
    min: u16,
    span: u32,
    next: AtomicU32,
}

impl PortAllocator {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            span: u32::from(max.saturating_sub(min)) + 1,
            next: AtomicU32::new(0),
        }
    }

    fn next_port(&self) -> u16 {
        let offset = self.next.fetch_add(1, Ordering::Relaxed) % self.span;
        u16::try_from(u32::from(self.min) + offset).unwrap_or(self.min)
    }
}

/// Spawns [`LoopbackWorker`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackWorkerFactory;

#[async_trait]
impl WorkerFactory for LoopbackWorkerFactory {
    async fn spawn_worker(
        &self,
        settings: &WorkerSettings,
    ) -> Result<Arc<dyn MediaWorker>, MediaError> {
        Ok(Arc::new(LoopbackWorker::new(settings)?))
    }
}

/// In-process worker.
#[derive(Debug)]
pub struct LoopbackWorker {
    id: WorkerId,
    ports: Arc<PortAllocator>,
    router_count: Arc<AtomicUsize>,
    died: CancellationToken,
    closed: AtomicBool,
}

impl LoopbackWorker {
    /// Create a worker for the given port range.
    ///
    /// # Errors
    ///
    /// Returns `MediaError::InvalidParameters` if the port range is empty.
    pub fn new(settings: &WorkerSettings) -> Result<Self, MediaError> {
        if settings.rtc_min_port > settings.rtc_max_port {
            return Err(MediaError::InvalidParameters(format!(
                "rtc port range {}-{} is empty",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }

        Ok(Self {
            id: WorkerId::new(),
            ports: Arc::new(PortAllocator::new(
                settings.rtc_min_port,
                settings.rtc_max_port,
            )),
            router_count: Arc::new(AtomicUsize::new(0)),
            died: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Simulate an unexpected worker death.
    pub fn kill(&self) {
        warn!(target: "sfu.media.loopback", worker_id = %self.id, "Loopback worker killed");
        self.closed.store(true, Ordering::SeqCst);
        self.died.cancel();
    }
}

#[async_trait]
impl MediaWorker for LoopbackWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn MediaRouter>, MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed("worker"));
        }
        if let Some(codec) = media_codecs
            .iter()
            .find(|codec| !codec.kind.matches_mime_type(&codec.mime_type))
        {
            return Err(MediaError::InvalidParameters(format!(
                "codec {} does not match kind {}",
                codec.mime_type,
                codec.kind.as_str()
            )));
        }

        let router = LoopbackRouter {
            id: RouterId::new(),
            capabilities: RtpCapabilities::from_media_codecs(media_codecs),
            ports: Arc::clone(&self.ports),
            producers: Arc::new(Mutex::new(HashMap::new())),
            router_count: Arc::clone(&self.router_count),
            closed: AtomicBool::new(false),
        };
        self.router_count.fetch_add(1, Ordering::SeqCst);

        debug!(
            target: "sfu.media.loopback",
            worker_id = %self.id,
            router_id = %router.id,
            "Router created"
        );

        Ok(Arc::new(router))
    }

    async fn resource_usage(&self) -> Result<WorkerResourceUsage, MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed("worker"));
        }
        Ok(WorkerResourceUsage {
            router_count: self.router_count.load(Ordering::SeqCst),
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

struct LoopbackRouter {
    id: RouterId,
    capabilities: RtpCapabilities,
    ports: Arc<PortAllocator>,
    producers: ProducerTable,
    router_count: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl LoopbackRouter {
    fn candidates(&self, options: &WebRtcTransportOptions, foundation: &str) -> Vec<IceCandidate> {
        let ip = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.to_string());
        let port = self.ports.next_port();

        let mut candidates = Vec::with_capacity(2);
        if options.enable_udp {
            candidates.push(IceCandidate {
                foundation: format!("udp{foundation}"),
                priority: UDP_CANDIDATE_PRIORITY,
                ip: ip.clone(),
                protocol: Protocol::Udp,
                port,
                candidate_type: "host".to_string(),
                tcp_type: None,
            });
        }
        if options.enable_tcp {
            let tcp = IceCandidate {
                foundation: format!("tcp{foundation}"),
                priority: TCP_CANDIDATE_PRIORITY,
                ip,
                protocol: Protocol::Tcp,
                port,
                candidate_type: "host".to_string(),
                tcp_type: Some("passive".to_string()),
            };
            if options.prefer_udp {
                candidates.push(tcp);
            } else {
                candidates.insert(0, tcp);
            }
        }
        candidates
    }
}

#[async_trait]
impl MediaRouter for LoopbackRouter {
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
        let producers = self.producers.lock().await;
        producers
            .get(&producer_id)
            .and_then(|params| params.codecs.first())
            .is_some_and(|codec| rtp_capabilities.supports(codec))
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed("router"));
        }
        if !options.enable_udp && !options.enable_tcp {
            return Err(MediaError::InvalidParameters(
                "transport needs UDP or TCP enabled".to_string(),
            ));
        }

        let rng = SystemRandom::new();
        let id = TransportId::new();
        let foundation = random_hex(&rng, 4)?;
        let parameters = TransportParameters {
            id,
            ice_parameters: IceParameters {
                username_fragment: random_hex(&rng, 8)?,
                password: random_hex(&rng, 16)?,
                ice_lite: true,
            },
            ice_candidates: self.candidates(options, &foundation),
            dtls_parameters: DtlsParameters {
                role: Some(DtlsRole::Auto),
                fingerprints: vec![random_fingerprint(&rng)?],
            },
        };

        Ok(Arc::new(LoopbackTransport {
            parameters,
            router_capabilities: self.capabilities.clone(),
            producers: Arc::clone(&self.producers),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_mid: AtomicU32::new(0),
        }))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.producers.lock().await.clear();
            self.router_count.fetch_sub(1, Ordering::SeqCst);
            debug!(target: "sfu.media.loopback", router_id = %self.id, "Router closed");
        }
    }
}

struct LoopbackTransport {
    parameters: TransportParameters,
    router_capabilities: RtpCapabilities,
    producers: ProducerTable,
    connected: AtomicBool,
    closed: AtomicBool,
    next_mid: AtomicU32,
}

impl LoopbackTransport {
    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MediaError::Closed("transport"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn id(&self) -> TransportId {
        self.parameters.id
    }

    fn parameters(&self) -> TransportParameters {
        self.parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), MediaError> {
        self.ensure_open()?;
        if dtls_parameters.fingerprints.is_empty() {
            return Err(MediaError::InvalidParameters(
                "DTLS parameters carry no fingerprint".to_string(),
            ));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(MediaError::InvalidState(
                "transport already connected".to_string(),
            ));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn MediaProducer>, MediaError> {
        self.ensure_open()?;
        let codec = rtp_parameters
            .codecs
            .first()
            .ok_or_else(|| MediaError::InvalidParameters("no codecs given".to_string()))?;
        if !kind.matches_mime_type(&codec.mime_type) {
            return Err(MediaError::InvalidParameters(format!(
                "codec {} does not match kind {}",
                codec.mime_type,
                kind.as_str()
            )));
        }
        if !self.router_capabilities.supports(codec) {
            return Err(MediaError::UnsupportedCodec(codec.mime_type.clone()));
        }

        let id = ProducerId::new();
        self.producers
            .lock()
            .await
            .insert(id, rtp_parameters.clone());

        Ok(Arc::new(LoopbackProducer {
            id,
            kind,
            rtp_parameters,
            producers: Arc::clone(&self.producers),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError> {
        self.ensure_open()?;
        let producer_parameters = self
            .producers
            .lock()
            .await
            .get(&producer_id)
            .cloned()
            .ok_or_else(|| MediaError::Engine(format!("producer {producer_id} not found")))?;

        let codecs: Vec<_> = producer_parameters
            .codecs
            .iter()
            .filter(|codec| rtp_capabilities.supports(codec))
            .cloned()
            .collect();
        let kind = match codecs.first() {
            Some(codec) if MediaKind::Audio.matches_mime_type(&codec.mime_type) => {
                MediaKind::Audio
            }
            Some(_) => MediaKind::Video,
            None => {
                return Err(MediaError::UnsupportedCodec(
                    "no common codec with producer".to_string(),
                ))
            }
        };

        let mid = self.next_mid.fetch_add(1, Ordering::SeqCst);
        let rtp_parameters = RtpParameters {
            mid: Some(mid.to_string()),
            codecs,
            header_extensions: producer_parameters.header_extensions,
            encodings: producer_parameters.encodings.into_iter().take(1).collect(),
            rtcp: producer_parameters.rtcp,
        };

        Ok(Arc::new(LoopbackConsumer {
            id: ConsumerId::new(),
            producer_id,
            kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            key_frame_requests: AtomicU64::new(0),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    producers: ProducerTable,
    closed: AtomicBool,
}

#[async_trait]
impl MediaProducer for LoopbackProducer {
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
            self.producers.lock().await.remove(&self.id);
        }
    }
}

struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    key_frame_requests: AtomicU64,
}

impl LoopbackConsumer {
    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MediaError::Closed("consumer"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaConsumer for LoopbackConsumer {
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
        self.ensure_open()?;
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn request_key_frame(&self) -> Result<(), MediaError> {
        self.ensure_open()?;
        // Audio has no keyframes.
        if self.kind == MediaKind::Video {
            self.key_frame_requests.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::codecs::default_media_codecs;
    use crate::media::rtp::RtpCodecParameters;
    use serde_json::Map;
    use std::net::{IpAddr, Ipv4Addr};

    fn settings() -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: 40000,
            rtc_max_port: 40001,
        }
    }

    fn transport_options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: Some("203.0.113.7".to_string()),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
            min_outgoing_bitrate: 600_000,
            max_incoming_bitrate: 1_500_000,
        }
    }

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
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
    async fn test_spawn_rejects_empty_port_range() {
        let result = LoopbackWorkerFactory
            .spawn_worker(&WorkerSettings {
                rtc_min_port: 50000,
                rtc_max_port: 40000,
            })
            .await;
        assert!(matches!(result, Err(MediaError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_transport_parameters_use_announced_ip_and_port_range() {
        let worker = LoopbackWorker::new(&settings()).unwrap();
        let router = worker.create_router(&default_media_codecs()).await.unwrap();

        let t1 = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();
        let t2 = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();
        let t3 = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();

        let p1 = t1.parameters();
        assert_eq!(p1.ice_candidates.len(), 2);
        assert_eq!(
            p1.ice_candidates.first().unwrap().protocol,
            Protocol::Udp,
            "UDP candidate comes first when UDP is preferred"
        );
        assert!(p1.ice_candidates.iter().all(|c| c.ip == "203.0.113.7"));
        assert_eq!(p1.ice_parameters.username_fragment.len(), 16);
        assert_eq!(p1.dtls_parameters.fingerprints.len(), 1);

        let ports: Vec<u16> = [&t1, &t2, &t3]
            .iter()
            .map(|t| t.parameters().ice_candidates.first().unwrap().port)
            .collect();
        assert_eq!(ports, vec![40000, 40001, 40000]);
        assert_ne!(
            p1.ice_parameters.password,
            t2.parameters().ice_parameters.password
        );
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let worker = LoopbackWorker::new(&settings()).unwrap();
        let router = worker.create_router(&default_media_codecs()).await.unwrap();
        let transport = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();
        let dtls = transport.parameters().dtls_parameters;

        transport.connect(dtls.clone()).await.unwrap();
        let second = transport.connect(dtls).await;
        assert!(matches!(second, Err(MediaError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_produce_and_consume_negotiate_common_codec() {
        let worker = LoopbackWorker::new(&settings()).unwrap();
        let router = worker.create_router(&default_media_codecs()).await.unwrap();
        let send = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();
        let recv = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();

        let producer = send
            .produce(MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        let caps = router.rtp_capabilities();
        assert!(router.can_consume(producer.id(), &caps).await);

        let consumer = recv.consume(producer.id(), &caps, false).await.unwrap();
        assert_eq!(consumer.kind(), MediaKind::Video);
        assert_eq!(consumer.producer_id(), producer.id());
        assert_eq!(consumer.rtp_parameters().mid.as_deref(), Some("0"));

        let audio_only = RtpCapabilities {
            codecs: caps
                .codecs
                .iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .cloned()
                .collect(),
            header_extensions: vec![],
        };
        assert!(!router.can_consume(producer.id(), &audio_only).await);

        producer.close().await;
        assert!(!router.can_consume(producer.id(), &caps).await);
    }

    #[tokio::test]
    async fn test_produce_rejects_codec_outside_router_capabilities() {
        let worker = LoopbackWorker::new(&settings()).unwrap();
        let router = worker.create_router(&default_media_codecs()).await.unwrap();
        let send = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();

        let mut params = vp8_parameters();
        if let Some(codec) = params.codecs.first_mut() {
            codec.mime_type = "video/AV1".to_string();
        }
        let result = send.produce(MediaKind::Video, params).await;
        assert!(matches!(result, Err(MediaError::UnsupportedCodec(_))));

        let wrong_kind = send.produce(MediaKind::Audio, vp8_parameters()).await;
        assert!(matches!(wrong_kind, Err(MediaError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_router_count_tracks_close_and_kill_resolves_died() {
        let worker = Arc::new(LoopbackWorker::new(&settings()).unwrap());
        let router = worker.create_router(&default_media_codecs()).await.unwrap();
        assert_eq!(worker.resource_usage().await.unwrap().router_count, 1);

        router.close().await;
        router.close().await;
        assert_eq!(worker.resource_usage().await.unwrap().router_count, 0);

        let watcher = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.died().await })
        };
        worker.kill();
        watcher.await.unwrap();

        let result = worker.create_router(&default_media_codecs()).await;
        assert!(matches!(result, Err(MediaError::Closed("worker"))));
    }
}
