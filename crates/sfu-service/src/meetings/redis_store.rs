//! Redis-backed meeting store.
//!
//! # Key Pattern
//!
//! - `meeting:{roomKey}` - HASH with fields `host_id`, `max_participants`,
//!   `settings` (JSON), `status` (`scheduled` | `active` | `ended`) and the
//!   `started_at` / `ended_at` timestamps this service writes.
//!
//! # Connection Pattern
//!
//! `MultiplexedConnection` is cheap to clone and safe to use concurrently, so
//! each operation clones it instead of locking.

use super::{MeetingRecord, MeetingStore, MeetingStoreError};
use crate::observability::record_meeting_store_latency;
use crate::types::RoomKey;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, error, instrument, warn};

const STATUS_ENDED: &str = "ended";

fn meeting_key(room_key: &RoomKey) -> String {
    format!("meeting:{room_key}")
}

/// Build a record from the meeting hash.
///
/// An empty hash is an unknown meeting; an `ended` status hides the meeting.
fn parse_record(
    fields: &HashMap<String, String>,
) -> Result<Option<MeetingRecord>, MeetingStoreError> {
    if fields.is_empty() {
        return Ok(None);
    }
    if fields.get("status").map(String::as_str) == Some(STATUS_ENDED) {
        return Ok(None);
    }

    let max_participants = fields
        .get("max_participants")
        .ok_or_else(|| MeetingStoreError::Malformed("missing max_participants".to_string()))?
        .parse::<u32>()
        .map_err(|e| MeetingStoreError::Malformed(format!("max_participants: {e}")))?;

    let settings = match fields.get("settings").filter(|s| !s.is_empty()) {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| MeetingStoreError::Malformed(format!("settings: {e}")))?,
        None => Value::Object(serde_json::Map::new()),
    };

    Ok(Some(MeetingRecord {
        host_id: fields.get("host_id").cloned().filter(|h| !h.is_empty()),
        max_participants,
        settings,
    }))
}

/// Meeting store reading `meeting:{roomKey}` hashes.
#[derive(Clone)]
pub struct RedisMeetingStore {
    connection: MultiplexedConnection,
}

impl RedisMeetingStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `MeetingStoreError::Redis` if the URL is invalid or the
    /// connection fails.
    pub async fn connect(redis_url: &SecretString) -> Result<Self, MeetingStoreError> {
        let client = Client::open(redis_url.expose_secret()).map_err(|e| {
            // Do NOT log the URL, it may carry credentials.
            error!(target: "sfu.meetings.redis", error = %e, "Failed to open Redis client");
            MeetingStoreError::Redis(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "sfu.meetings.redis", error = %e, "Failed to connect to Redis");
                MeetingStoreError::Redis(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self { connection })
    }

    async fn set_status(
        &self,
        room_key: &RoomKey,
        status: &'static str,
        timestamp_field: &'static str,
    ) -> Result<(), MeetingStoreError> {
        let mut conn = self.connection.clone();
        let now = Utc::now().to_rfc3339();

        conn.hset_multiple::<_, _, _, ()>(
            meeting_key(room_key),
            &[("status", status), (timestamp_field, now.as_str())],
        )
        .await
        .map_err(|e| {
            warn!(
                target: "sfu.meetings.redis",
                room_key = %room_key,
                status = status,
                error = %e,
                "Failed to update meeting status"
            );
            MeetingStoreError::Redis(format!("Failed to set status {status}: {e}"))
        })?;

        debug!(target: "sfu.meetings.redis", room_key = %room_key, status = status, "Meeting status updated");
        Ok(())
    }
}

#[async_trait]
impl MeetingStore for RedisMeetingStore {
    #[instrument(skip_all, fields(room_key = %room_key))]
    async fn find_active_meeting(
        &self,
        room_key: &RoomKey,
    ) -> Result<Option<MeetingRecord>, MeetingStoreError> {
        let start = Instant::now();
        let mut conn = self.connection.clone();

        let fields: HashMap<String, String> =
            conn.hgetall(meeting_key(room_key)).await.map_err(|e| {
                warn!(
                    target: "sfu.meetings.redis",
                    room_key = %room_key,
                    error = %e,
                    "Failed to read meeting"
                );
                MeetingStoreError::Redis(format!("Failed to read meeting: {e}"))
            })?;
        record_meeting_store_latency("find", start.elapsed());

        parse_record(&fields)
    }

    #[instrument(skip_all, fields(room_key = %room_key))]
    async fn mark_active(&self, room_key: &RoomKey) -> Result<(), MeetingStoreError> {
        let start = Instant::now();
        let result = self.set_status(room_key, "active", "started_at").await;
        record_meeting_store_latency("mark_active", start.elapsed());
        result
    }

    #[instrument(skip_all, fields(room_key = %room_key))]
    async fn mark_ended(&self, room_key: &RoomKey) -> Result<(), MeetingStoreError> {
        let start = Instant::now();
        let result = self.set_status(room_key, STATUS_ENDED, "ended_at").await;
        record_meeting_store_latency("mark_ended", start.elapsed());
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn hash(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_meeting_key_format() {
        assert_eq!(meeting_key(&RoomKey::from("abc-123")), "meeting:abc-123");
    }

    #[test]
    fn test_parse_scheduled_meeting() {
        let record = parse_record(&hash(&[
            ("host_id", "user-7"),
            ("max_participants", "12"),
            ("settings", r#"{"waitingRoom":true}"#),
            ("status", "scheduled"),
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(record.host_id.as_deref(), Some("user-7"));
        assert_eq!(record.max_participants, 12);
        assert_eq!(record.settings.get("waitingRoom"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_parse_missing_or_ended_meeting() {
        assert!(parse_record(&HashMap::new()).unwrap().is_none());
        assert!(parse_record(&hash(&[("max_participants", "5"), ("status", "ended")]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_malformed_meeting() {
        let missing_limit = parse_record(&hash(&[("status", "active")]));
        assert!(matches!(missing_limit, Err(MeetingStoreError::Malformed(_))));

        let bad_settings = parse_record(&hash(&[("max_participants", "5"), ("settings", "{")]));
        assert!(matches!(bad_settings, Err(MeetingStoreError::Malformed(_))));
    }
}
