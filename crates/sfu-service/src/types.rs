//! Identifier types for SFU resources.
//!
//! Room keys are chosen by clients. Every other identifier is a UUID: peer ids
//! are assigned per signaling connection, worker/router/transport/producer/consumer
//! ids are assigned by the media engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Key of a room (meeting) as supplied by clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    /// Create a room key from any string-like value.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

uuid_id!(
    /// Identity of one signaling connection / participant.
    PeerId
);
uuid_id!(
    /// Identity of a media-engine worker.
    WorkerId
);
uuid_id!(
    /// Identity of a per-room router.
    RouterId
);
uuid_id!(
    /// Identity of a WebRTC transport.
    TransportId
);
uuid_id!(
    /// Identity of an outgoing media track.
    ProducerId
);
uuid_id!(
    /// Identity of one peer's view of a producer.
    ConsumerId
);
