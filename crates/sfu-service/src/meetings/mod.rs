//! Meeting metadata store.
//!
//! The SFU does not own meetings. It asks the store whether a room key maps to
//! an active meeting (and its participant limit) on join, and reports when a
//! room becomes active or ends.
//!
//! - [`RedisMeetingStore`] reads the records the meeting API writes to Redis.
//! - [`StaticMeetingStore`] treats every room key as an active meeting, for
//!   deployments without Redis.

mod redis_store;

pub use redis_store::RedisMeetingStore;

use crate::errors::SfuError;
use crate::types::RoomKey;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// What the SFU needs to know about a meeting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    pub max_participants: u32,
    /// Opaque meeting settings passed through to clients.
    #[serde(default)]
    pub settings: Value,
}

/// Meeting store failures.
#[derive(Debug, Error)]
pub enum MeetingStoreError {
    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Malformed meeting record: {0}")]
    Malformed(String),
}

impl From<MeetingStoreError> for SfuError {
    fn from(err: MeetingStoreError) -> Self {
        SfuError::MeetingStore(err.to_string())
    }
}

/// Meeting metadata collaborator.
#[async_trait]
pub trait MeetingStore: Send + Sync {
    /// The meeting for a room key, unless it does not exist or has ended.
    async fn find_active_meeting(
        &self,
        room_key: &RoomKey,
    ) -> Result<Option<MeetingRecord>, MeetingStoreError>;

    /// Record that the meeting's room has its first participant.
    async fn mark_active(&self, room_key: &RoomKey) -> Result<(), MeetingStoreError>;

    /// Record that the meeting's room emptied.
    async fn mark_ended(&self, room_key: &RoomKey) -> Result<(), MeetingStoreError>;
}

/// Store that accepts every room key.
#[derive(Debug, Clone)]
pub struct StaticMeetingStore {
    max_participants: u32,
}

impl StaticMeetingStore {
    #[must_use]
    pub fn new(max_participants: u32) -> Self {
        Self { max_participants }
    }
}

#[async_trait]
impl MeetingStore for StaticMeetingStore {
    async fn find_active_meeting(
        &self,
        _room_key: &RoomKey,
    ) -> Result<Option<MeetingRecord>, MeetingStoreError> {
        Ok(Some(MeetingRecord {
            host_id: None,
            max_participants: self.max_participants,
            settings: Value::Object(serde_json::Map::new()),
        }))
    }

    async fn mark_active(&self, _room_key: &RoomKey) -> Result<(), MeetingStoreError> {
        Ok(())
    }

    async fn mark_ended(&self, _room_key: &RoomKey) -> Result<(), MeetingStoreError> {
        Ok(())
    }
}
