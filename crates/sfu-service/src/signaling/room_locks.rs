//! Per-room ordering of meeting status updates.
//!
//! A room can empty and be re-created by a new joiner while the store write
//! for the old room is still in flight. Creating a room together with its
//! `mark_active`, and removing it together with its `mark_ended`, both run
//! under the room key's lock, so the store sees the updates in the order the
//! rooms came and went.

use crate::types::RoomKey;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Async locks keyed by room. Entries exist only while someone holds or
/// waits for them.
#[derive(Default)]
pub struct RoomLocks {
    locks: Mutex<HashMap<RoomKey, Arc<Mutex<()>>>>,
}

impl RoomLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` while holding the lock of `room_key`.
    pub async fn run<F, T>(&self, room_key: &RoomKey, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = Arc::clone(self.locks.lock().await.entry(room_key.clone()).or_default());

        let output = {
            let _held = lock.lock().await;
            task.await
        };
        drop(lock);

        let mut locks = self.locks.lock().await;
        if locks
            .get(room_key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(room_key);
        }
        output
    }

    /// Rooms with a held or awaited lock.
    pub async fn held_rooms(&self) -> usize {
        self.locks.lock().await.len()
    }
}
