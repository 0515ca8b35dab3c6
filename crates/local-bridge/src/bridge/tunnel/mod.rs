//! Reverse tunnel over WebSocket.
//!
//! A private service dials `/ws/{user}/{component}` and keeps the socket open. Public requests
//! for that key are wrapped into [`envelope::RequestEnvelope`]s, written to the socket, and
//! matched back to their caller by `request_id` when the service answers.

pub mod envelope;
pub mod listener;
pub mod pending;
pub mod registry;
pub mod rendezvous;
pub mod server;
pub mod transport;

/// Logical tunnel identity derived from the user and component path segments.
pub fn client_key(user: &str, component: &str) -> String {
    format!("{}-{}", user.trim(), component.trim())
}
