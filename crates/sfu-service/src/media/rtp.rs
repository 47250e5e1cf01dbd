//! RTP, ICE and DTLS parameter types exchanged with clients and the media engine.
//!
//! Field names follow the camelCase JSON shape WebRTC client libraries send, so
//! the signaling layer can pass them through without translation. Parts the
//! orchestration core never inspects (header extensions, encodings, RTCP) are
//! kept as opaque JSON values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::IpAddr;

use crate::types::TransportId;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// Whether a MIME type such as `video/VP8` belongs to this kind.
    #[must_use]
    pub fn matches_mime_type(&self, mime_type: &str) -> bool {
        mime_type
            .split_once('/')
            .is_some_and(|(prefix, _)| prefix.eq_ignore_ascii_case(self.as_str()))
    }
}

/// RTCP feedback mechanism supported by a codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

impl RtcpFeedback {
    #[must_use]
    pub fn new(kind: &str, parameter: &str) -> Self {
        Self {
            kind: kind.to_string(),
            parameter: parameter.to_string(),
        }
    }
}

/// A codec the router (or a client) is able to handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecCapability {
    fn matches(&self, codec: &RtpCodecParameters) -> bool {
        if !self.mime_type.eq_ignore_ascii_case(&codec.mime_type) {
            return false;
        }
        if self.clock_rate != codec.clock_rate {
            return false;
        }
        match (self.channels, codec.channels) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }
}

/// The set of codecs an endpoint supports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    /// First payload type handed out to codecs without a preferred one.
    const DYNAMIC_PAYLOAD_TYPE_START: u8 = 100;

    /// Build router capabilities from configured codecs, assigning dynamic
    /// payload types to codecs that do not carry a preferred one.
    #[must_use]
    pub fn from_media_codecs(media_codecs: &[RtpCodecCapability]) -> Self {
        let mut next_payload_type = Self::DYNAMIC_PAYLOAD_TYPE_START;
        let codecs = media_codecs
            .iter()
            .map(|codec| {
                let mut codec = codec.clone();
                if codec.preferred_payload_type.is_none() {
                    codec.preferred_payload_type = Some(next_payload_type);
                    next_payload_type = next_payload_type.saturating_add(1);
                }
                codec
            })
            .collect();

        Self {
            codecs,
            header_extensions: Vec::new(),
        }
    }

    /// Whether these capabilities can receive the given codec.
    ///
    /// Matching is on MIME type (case-insensitive), clock rate and, when both
    /// sides state it, channel count.
    #[must_use]
    pub fn supports(&self, codec: &RtpCodecParameters) -> bool {
        self.codecs.iter().any(|capability| capability.matches(codec))
    }
}

/// A negotiated codec inside [`RtpParameters`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// Parameters describing what a producer sends or a consumer receives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    #[serde(default)]
    pub encodings: Vec<Value>,
    #[serde(default)]
    pub rtcp: Value,
}

/// DTLS role of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

/// Certificate fingerprint advertised during DTLS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS handshake material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<DtlsRole>,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// ICE credentials of the server side of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    pub ice_lite: bool,
}

/// Transport protocol of an ICE candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

/// One server-side ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

/// Connection parameters of a newly created transport, returned to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Network options applied to every WebRTC transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcTransportOptions {
    /// Local address the transport binds to.
    pub listen_ip: IpAddr,
    /// Public address advertised in ICE candidates (defaults to `listen_ip`).
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    /// Bits per second assumed available before bandwidth estimation settles.
    pub initial_available_outgoing_bitrate: u32,
    /// Floor for the outgoing bitrate estimation.
    pub min_outgoing_bitrate: u32,
    /// Cap applied to everything a client sends on this transport.
    pub max_incoming_bitrate: u32,
}

/// Settings a worker is spawned with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

/// Resource usage reported by a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResourceUsage {
    /// User CPU time in milliseconds.
    pub user_time_ms: u64,
    /// System CPU time in milliseconds.
    pub system_time_ms: u64,
    /// Maximum resident set size in kilobytes.
    pub max_rss_kb: u64,
    /// Routers currently hosted by the worker.
    pub router_count: usize,
}
