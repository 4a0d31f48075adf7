//! Multipart message channels over socket endpoints.
//!
//! A [`Channel`] wraps one socket of a given [`ChannelRole`] and moves whole
//! [`Message`]s. Router-role channels separate the peer identity frame from
//! the payload on receipt and require it on send.

pub mod channel;
pub mod message;
pub mod socket;

pub use channel::{Channel, MessageWriter};
pub use message::{ChannelRole, Frame, Message};
pub use socket::{SocketTransport, ZmqTransport};
