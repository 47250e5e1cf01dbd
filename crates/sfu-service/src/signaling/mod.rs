//! Client signaling over WebSocket.
//!
//! - `messages`: JSON wire format
//! - `hub`: room event fan-out
//! - `room_locks`: per-room ordering of meeting status updates
//! - `connection`: per-connection request handling on top of the
//!   [`SessionManager`](crate::session::SessionManager)
//! - `ws`: axum WebSocket endpoint

pub mod connection;
pub mod hub;
pub mod messages;
pub mod room_locks;
mod ws;

pub use connection::{SignalingConnection, SignalingContext};
pub use hub::RoomHub;
pub use messages::{ClientRequest, Event, Request, ServerMessage};
pub use room_locks::RoomLocks;
pub use ws::{signaling_router, OUTBOUND_QUEUE_CAPACITY};
