//! In-memory meeting store for SFU testing.
//!
//! Holds meeting records keyed by room and records every `mark_*` call. A
//! meeting marked ended is no longer found, until it is marked active again.
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::MockMeetingStore;
//!
//! let store = MockMeetingStore::new()
//!     .with_meeting("room-1", 2)
//!     .failing_marks();
//!
//! // join "room-1" ...
//! assert_eq!(store.calls(), vec![StoreCall::MarkActive("room-1".into())]);
//! ```

use async_trait::async_trait;
use serde_json::Value;
use sfu_service::meetings::{MeetingRecord, MeetingStore, MeetingStoreError};
use sfu_service::types::RoomKey;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// A `mark_*` call received by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    MarkActive(RoomKey),
    MarkEnded(RoomKey),
}

/// Meeting store backed by a map.
#[derive(Default)]
pub struct MockMeetingStore {
    meetings: Mutex<HashMap<RoomKey, MeetingRecord>>,
    calls: Mutex<Vec<StoreCall>>,
    ended: Mutex<HashSet<RoomKey>>,
    mark_ended_delay: Duration,
    fail_marks: bool,
    fail_lookups: bool,
}

impl MockMeetingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an active meeting with the given participant limit.
    #[must_use]
    pub fn with_meeting(self, room_key: &str, max_participants: u32) -> Self {
        self.meetings.lock().unwrap().insert(
            RoomKey::from(room_key),
            MeetingRecord {
                host_id: Some("host-user".to_string()),
                max_participants,
                settings: Value::Object(serde_json::Map::new()),
            },
        );
        self
    }

    /// Make `mark_active` / `mark_ended` fail (calls are still recorded).
    #[must_use]
    pub fn failing_marks(mut self) -> Self {
        self.fail_marks = true;
        self
    }

    /// Sleep inside `mark_ended` before the meeting is written as ended.
    #[must_use]
    pub fn mark_ended_delay(mut self, delay: Duration) -> Self {
        self.mark_ended_delay = delay;
        self
    }

    /// Make `find_active_meeting` fail.
    #[must_use]
    pub fn failing_lookups(mut self) -> Self {
        self.fail_lookups = true;
        self
    }

    /// Mark calls received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Whether the meeting exists and is not marked ended.
    #[must_use]
    pub fn is_active(&self, room_key: &str) -> bool {
        let room_key = RoomKey::from(room_key);
        self.meetings.lock().unwrap().contains_key(&room_key)
            && !self.ended.lock().unwrap().contains(&room_key)
    }

    fn record(&self, call: StoreCall) -> Result<(), MeetingStoreError> {
        self.calls.lock().unwrap().push(call.clone());
        if self.fail_marks {
            return Err(MeetingStoreError::Redis("injected mark failure".to_string()));
        }
        let mut ended = self.ended.lock().unwrap();
        match call {
            StoreCall::MarkActive(room_key) => ended.remove(&room_key),
            StoreCall::MarkEnded(room_key) => ended.insert(room_key),
        };
        Ok(())
    }
}

#[async_trait]
impl MeetingStore for MockMeetingStore {
    async fn find_active_meeting(
        &self,
        room_key: &RoomKey,
    ) -> Result<Option<MeetingRecord>, MeetingStoreError> {
        if self.fail_lookups {
            return Err(MeetingStoreError::Redis("injected lookup failure".to_string()));
        }
        if self.ended.lock().unwrap().contains(room_key) {
            return Ok(None);
        }
        Ok(self.meetings.lock().unwrap().get(room_key).cloned())
    }

    async fn mark_active(&self, room_key: &RoomKey) -> Result<(), MeetingStoreError> {
        self.record(StoreCall::MarkActive(room_key.clone()))
    }

    async fn mark_ended(&self, room_key: &RoomKey) -> Result<(), MeetingStoreError> {
        if !self.mark_ended_delay.is_zero() {
            tokio::time::sleep(self.mark_ended_delay).await;
        }
        self.record(StoreCall::MarkEnded(room_key.clone()))
    }
}
