//! Room fan-out of signaling events.
//!
//! Each connected participant registers its outbound channel under its room.
//! Broadcasts use `try_send` so one slow client never stalls a request
//! handler; a full or closed channel drops the event for that client only.

use super::messages::{Event, ServerMessage};
use crate::types::{PeerId, RoomKey};

use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Outbound frame queue of one connection.
pub type Outbound = mpsc::Sender<ServerMessage>;

/// Per-room registry of participant outbound queues.
#[derive(Default)]
pub struct RoomHub {
    rooms: RwLock<HashMap<RoomKey, HashMap<PeerId, Outbound>>>,
}

impl RoomHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, room_key: &RoomKey, peer_id: PeerId, outbound: Outbound) {
        self.rooms
            .write()
            .await
            .entry(room_key.clone())
            .or_default()
            .insert(peer_id, outbound);
    }

    pub async fn unsubscribe(&self, room_key: &RoomKey, peer_id: PeerId) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room_key) {
            members.remove(&peer_id);
            if members.is_empty() {
                rooms.remove(room_key);
            }
        }
    }

    /// Number of subscribed participants in a room.
    pub async fn member_count(&self, room_key: &RoomKey) -> usize {
        self.rooms
            .read()
            .await
            .get(room_key)
            .map_or(0, HashMap::len)
    }

    /// Push an event to every subscriber of a room except `excluding`.
    ///
    /// Returns how many subscribers accepted the event.
    pub async fn broadcast(
        &self,
        room_key: &RoomKey,
        event: Event,
        excluding: Option<PeerId>,
    ) -> usize {
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(room_key) else {
            return 0;
        };

        let mut delivered = 0;
        for (peer_id, outbound) in members {
            if Some(*peer_id) == excluding {
                continue;
            }
            match outbound.try_send(ServerMessage::Notification(event.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        target: "sfu.signaling.hub",
                        room_key = %room_key,
                        peer_id = %peer_id,
                        "Outbound queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        target: "sfu.signaling.hub",
                        room_key = %room_key,
                        peer_id = %peer_id,
                        "Outbound queue closed, dropping event"
                    );
                }
            }
        }
        delivered
    }
}
