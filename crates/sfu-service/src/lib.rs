//! SFU Service Library
//!
//! Media-session orchestration for a Selective Forwarding Unit:
//!
//! - A pool of media-engine workers, assigned to rooms round-robin
//! - A registry of rooms, peers, transports, producers and consumers with
//!   cascading cleanup
//! - A WebSocket signaling protocol that drives the session lifecycle
//!
//! # Architecture
//!
//! ```text
//! signaling (one task per WebSocket)
//! └── SessionManager
//!     ├── ResourceRegistry (behind a tokio Mutex, never held across engine awaits)
//!     └── WorkerPool
//!         └── MediaWorker -> MediaRouter -> MediaTransport -> MediaProducer / MediaConsumer
//! ```
//!
//! The media engine sits behind the traits in [`media`]. The bundled
//! [`media::loopback`] engine negotiates parameters without forwarding
//! packets.
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error type with signaling error codes
//! - [`media`] - Media engine traits, RTP types and the loopback engine
//! - [`meetings`] - Meeting metadata store
//! - [`registry`] - Resource tables and cleanup cascade
//! - [`session`] - Session lifecycle API
//! - [`signaling`] - WebSocket signaling protocol
//! - [`workers`] - Media worker pool

pub mod config;
pub mod errors;
pub mod media;
pub mod meetings;
pub mod observability;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod system_info;
pub mod types;
pub mod workers;
