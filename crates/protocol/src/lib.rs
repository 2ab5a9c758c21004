//! relaydesk protocol
//!
//! Shared types for communication between the relaydesk server and its
//! user/agent clients. These types are serialized as JSON over WebSocket
//! and over the control-plane HTTP routes.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
