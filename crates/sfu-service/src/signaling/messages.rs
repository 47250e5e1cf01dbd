//! Signaling wire messages.
//!
//! Client frames are `{"id": <u64>, "method": "<kebab-name>", ...params}` with
//! camelCase parameters. Server frames carry a `type` of `response`, `error`
//! or `notification`.

use crate::errors::SfuError;
use crate::media::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters};
use crate::registry::{MediaState, PeerInfo, ProducerInfo, TransportDirection};
use crate::types::{ConsumerId, PeerId, ProducerId, RoomKey, TransportId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Id used for errors answering frames that could not be parsed.
pub const UNPARSEABLE_REQUEST_ID: u64 = 0;

/// A client request frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

impl ClientRequest {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// `SfuError::InvalidRequest` if the frame is not a known request.
    pub fn parse(text: &str) -> Result<Self, SfuError> {
        serde_json::from_str(text).map_err(|e| SfuError::InvalidRequest(e.to_string()))
    }
}

/// Signaling requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    Join {
        room_key: RoomKey,
        #[serde(default)]
        display_name: Option<String>,
    },
    GetCapabilities,
    CreateTransport {
        direction: TransportDirection,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    PauseConsumer { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: ProducerId },
    ToggleAudio { enabled: bool },
    ToggleVideo { enabled: bool },
    ToggleScreenshare { enabled: bool },
    ChatMessage { text: String },
    Leave,
}

impl Request {
    /// Wire method name, used as a metrics label.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Join { .. } => "join",
            Request::GetCapabilities => "get-capabilities",
            Request::CreateTransport { .. } => "create-transport",
            Request::ConnectTransport { .. } => "connect-transport",
            Request::Produce { .. } => "produce",
            Request::Consume { .. } => "consume",
            Request::PauseConsumer { .. } => "pause-consumer",
            Request::ResumeConsumer { .. } => "resume-consumer",
            Request::CloseProducer { .. } => "close-producer",
            Request::ToggleAudio { .. } => "toggle-audio",
            Request::ToggleVideo { .. } => "toggle-video",
            Request::ToggleScreenshare { .. } => "toggle-screenshare",
            Request::ChatMessage { .. } => "chat-message",
            Request::Leave => "leave",
        }
    }
}

/// Payload of a successful `join`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub room_key: RoomKey,
    pub peer_id: PeerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    pub max_participants: u32,
    pub settings: Value,
    pub rtp_capabilities: RtpCapabilities,
    pub peers: Vec<PeerInfo>,
    pub producers: Vec<ProducerInfo>,
}

/// Room events pushed to participants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Event {
    PeerJoined(PeerInfo),
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    MediaStateChanged {
        peer_id: PeerId,
        media_state: MediaState,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        peer_id: PeerId,
        display_name: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
}

/// Server frames.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Response { id: u64, data: Value },
    Error { id: u64, code: i32, message: String },
    Notification(Event),
}

impl ServerMessage {
    /// Error frame for a failed request; only the client-safe message is sent.
    pub fn from_error(id: u64, err: &SfuError) -> Self {
        ServerMessage::Error {
            id,
            code: err.error_code(),
            message: err.client_message(),
        }
    }

    /// Serialize to a text frame.
    ///
    /// # Errors
    ///
    /// `SfuError::Internal` if serialization fails.
    pub fn to_json(&self) -> Result<String, SfuError> {
        serde_json::to_string(self).map_err(|e| SfuError::Internal(format!("encode frame: {e}")))
    }
}
