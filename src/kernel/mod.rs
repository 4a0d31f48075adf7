//! Kernel-facing protocol: connection info, wire codec and the channel link.
//!
//! A [`KernelLink`] connects the four kernel channels described by a
//! [`ConnectionInfo`] and turns everything the kernel sends into
//! [`LinkEvent`]s for the owning session.

pub mod connection_info;
pub mod events;
pub mod heartbeat;
pub mod link;
pub mod wire;

pub use connection_info::ConnectionInfo;
pub use events::{LinkEvent, LinkEventKind, LinkEventSender};
pub use heartbeat::HeartbeatSettings;
pub use link::{KernelLink, LinkChannels};
pub use wire::{KernelMessage, MessageHeader, WireCodec};
