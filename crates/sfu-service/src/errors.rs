//! SFU service error types.
//!
//! Every variant maps to a signaling error code sent to clients. Internal
//! details are logged server-side but never exposed in `client_message()`.

use crate::media::MediaError;
use thiserror::Error;

/// SFU service error type.
///
/// Maps to signaling error codes:
/// - `InvalidRequest`: `INVALID_REQUEST` (1)
/// - `NotJoined`, `CrossRoomConsume`, `NotOwner`: `FORBIDDEN` (3)
/// - Room/peer/transport/producer/consumer/meeting not found: `NOT_FOUND` (4)
/// - `AlreadyJoined`: `CONFLICT` (5)
/// - `MediaEngine`, `MeetingStore`, `Config`, `Internal`: `INTERNAL_ERROR` (6)
/// - `RoomFull`, `IncompatibleCodecs`: `CAPACITY_EXCEEDED` (7)
#[derive(Debug, Error)]
pub enum SfuError {
    /// Request frame or parameters could not be understood.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// No active meeting exists for the room key.
    #[error("Meeting not found: {0}")]
    MeetingNotFound(String),

    /// Request requires the connection to have joined a room.
    #[error("Not joined to a room")]
    NotJoined,

    /// Peer tried to consume a producer from another room.
    #[error("Producer {producer_id} is not in room {room_key}")]
    CrossRoomConsume {
        producer_id: String,
        room_key: String,
    },

    /// Peer tried to act on a resource it does not own.
    #[error("Not owner: {0}")]
    NotOwner(String),

    /// Connection (or peer id) is already joined to a room.
    #[error("Already joined: {0}")]
    AlreadyJoined(String),

    /// Room reached its participant limit.
    #[error("Room {room_key} is full ({max_participants} participants)")]
    RoomFull {
        room_key: String,
        max_participants: u32,
    },

    /// Receiver capabilities cannot decode the producer's codec.
    #[error("Incompatible codecs for producer {0}")]
    IncompatibleCodecs(String),

    #[error("Media engine error: {0}")]
    MediaEngine(String),

    #[error("Meeting store error: {0}")]
    MeetingStore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Returns the signaling error code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            SfuError::InvalidRequest(_) => 1, // INVALID_REQUEST
            SfuError::NotJoined | SfuError::CrossRoomConsume { .. } | SfuError::NotOwner(_) => 3, // FORBIDDEN
            SfuError::RoomNotFound(_)
            | SfuError::PeerNotFound(_)
            | SfuError::TransportNotFound(_)
            | SfuError::ProducerNotFound(_)
            | SfuError::ConsumerNotFound(_)
            | SfuError::MeetingNotFound(_) => 4, // NOT_FOUND
            SfuError::AlreadyJoined(_) => 5,    // CONFLICT
            SfuError::MediaEngine(_)
            | SfuError::MeetingStore(_)
            | SfuError::Config(_)
            | SfuError::Internal(_) => 6, // INTERNAL_ERROR
            SfuError::RoomFull { .. } | SfuError::IncompatibleCodecs(_) => 7, // CAPACITY_EXCEEDED
        }
    }

    /// Returns a bounded label string for the error variant (for metrics).
    pub fn error_type_label(&self) -> &'static str {
        match self {
            SfuError::InvalidRequest(_) => "invalid_request",
            SfuError::RoomNotFound(_) => "room_not_found",
            SfuError::PeerNotFound(_) => "peer_not_found",
            SfuError::TransportNotFound(_) => "transport_not_found",
            SfuError::ProducerNotFound(_) => "producer_not_found",
            SfuError::ConsumerNotFound(_) => "consumer_not_found",
            SfuError::MeetingNotFound(_) => "meeting_not_found",
            SfuError::NotJoined => "not_joined",
            SfuError::CrossRoomConsume { .. } => "cross_room_consume",
            SfuError::NotOwner(_) => "not_owner",
            SfuError::AlreadyJoined(_) => "already_joined",
            SfuError::RoomFull { .. } => "room_full",
            SfuError::IncompatibleCodecs(_) => "incompatible_codecs",
            SfuError::MediaEngine(_) => "media_engine",
            SfuError::MeetingStore(_) => "meeting_store",
            SfuError::Config(_) => "config",
            SfuError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            SfuError::MediaEngine(_)
            | SfuError::MeetingStore(_)
            | SfuError::Config(_)
            | SfuError::Internal(_) => "An internal error occurred".to_string(),
            SfuError::InvalidRequest(msg) => format!("Invalid request: {msg}"),
            SfuError::RoomNotFound(_) => "Room not found".to_string(),
            SfuError::PeerNotFound(_) => "Peer not found".to_string(),
            SfuError::TransportNotFound(_) => "Transport not found".to_string(),
            SfuError::ProducerNotFound(_) => "Producer not found".to_string(),
            SfuError::ConsumerNotFound(_) => "Consumer not found".to_string(),
            SfuError::MeetingNotFound(_) => "Meeting not found".to_string(),
            SfuError::NotJoined => "Join a room first".to_string(),
            SfuError::CrossRoomConsume { .. } => "Producer belongs to another room".to_string(),
            SfuError::NotOwner(_) => "Resource belongs to another participant".to_string(),
            SfuError::AlreadyJoined(_) => "Already joined to a room".to_string(),
            SfuError::RoomFull { .. } => "Room is full".to_string(),
            SfuError::IncompatibleCodecs(_) => "Cannot consume with the given capabilities".to_string(),
        }
    }
}

impl From<MediaError> for SfuError {
    fn from(err: MediaError) -> Self {
        SfuError::MediaEngine(err.to_string())
    }
}
