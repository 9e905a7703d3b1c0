//! Network Layer
//!
//! WebSocket server, wire protocol and the live-room hub.

pub mod hub;
pub mod protocol;
pub mod server;

pub use hub::{ConnectionId, HubError, LeaveOutcome, RealtimeHub};
pub use protocol::{ClientMessage, ErrorCode, ServerMessage};
pub use server::{Gateway, ScaleServer, ScaleServerError};
