//! Frames, messages and channel roles.

use std::fmt;

use bytes::Bytes;

/// A single opaque byte sequence within a multipart message.
pub type Frame = Bytes;

/// Socket pattern a [`super::Channel`] is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Identity-addressed server side of request/reply.
    Router,
    /// Asynchronous client side of request/reply.
    Dealer,
    /// Broadcast sender.
    Pub,
    /// Broadcast receiver, subscribed to every topic.
    Sub,
    /// Lock-step requester: send, then receive.
    Req,
    /// Lock-step replier: receive, then send.
    Rep,
}

impl ChannelRole {
    /// Returns `true` if received messages carry a leading identity frame.
    #[must_use]
    pub const fn is_identity_addressed(self) -> bool {
        matches!(self, Self::Router)
    }

    /// Returns `true` if the role can send.
    #[must_use]
    pub const fn can_send(self) -> bool {
        !matches!(self, Self::Sub)
    }

    /// Returns `true` if the role can receive.
    #[must_use]
    pub const fn can_receive(self) -> bool {
        !matches!(self, Self::Pub)
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Router => "ROUTER",
            Self::Dealer => "DEALER",
            Self::Pub => "PUB",
            Self::Sub => "SUB",
            Self::Req => "REQ",
            Self::Rep => "REP",
        };
        f.write_str(name)
    }
}

/// An ordered sequence of frames sent or received atomically.
///
/// On router-role channels `sender` holds the peer identity: on receipt it is
/// the identity frame the socket prepended, on send it selects the peer the
/// message is routed to. It is never part of `frames`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Peer identity for router-role channels.
    pub sender: Option<Frame>,
    /// Payload frames in order.
    pub frames: Vec<Frame>,
}

impl Message {
    /// Creates a message without a sender identity.
    #[must_use]
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            sender: None,
            frames,
        }
    }

    /// Creates a message addressed to (or received from) `sender`.
    #[must_use]
    pub fn with_sender(sender: Frame, frames: Vec<Frame>) -> Self {
        Self {
            sender: Some(sender),
            frames,
        }
    }

    /// Returns the number of payload frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns `true` if the message has no payload frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
