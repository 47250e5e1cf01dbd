//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU service.
//!
//! ## Modules
//!
//! - `mock_media` - Scriptable in-memory media engine that records what it
//!   was asked to do (router creations per worker, close order, keyframe
//!   requests) and can inject failures, delays and worker deaths
//! - `mock_meeting_store` - In-memory meeting store recording mark calls
//! - `fixtures` - Codec, RTP and DTLS test data plus a session harness
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let engine = MockMediaEngine::builder()
//!         .router_delay(Duration::from_millis(50))
//!         .build();
//!     let harness = SessionHarness::new(&engine, 3).await;
//!
//!     harness.sessions.join_room(&RoomKey::from("r"), PeerId::new(), "a".into(), 10).await?;
//!     assert_eq!(engine.routers_created(), 1);
//! }
//! ```

pub mod fixtures;
pub mod mock_media;
pub mod mock_meeting_store;

pub use fixtures::*;
pub use mock_media::{ClosedObject, MockMediaEngine, MockMediaEngineBuilder};
pub use mock_meeting_store::{MockMeetingStore, StoreCall};
