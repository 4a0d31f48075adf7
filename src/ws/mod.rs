//! WebSocket layer: connection handling, action routing, subscriptions.
//!
//! The WebSocket endpoint at `/ws` accepts `execute`, `interrupt`,
//! `subscribe` and `unsubscribe` actions and streams the output of every
//! subscribed session back to the client.

pub mod connection;
pub mod handler;
pub mod messages;
pub mod subscription;

pub use messages::{ClientAction, ServerMessage};
