//! Socket backends underneath a [`super::Channel`].
//!
//! [`SocketTransport`] is the seam between the channel's framing discipline
//! and an actual multipart socket. [`ZmqTransport`] backs it with a `zeromq`
//! socket of the requested role.

use std::fmt;

use async_trait::async_trait;
use zeromq::{
    DealerSocket, PubSocket, RepSocket, ReqSocket, RouterSocket, Socket, SocketRecv, SocketSend,
    SubSocket, ZmqMessage,
};

use super::{ChannelRole, Frame};
use crate::error::GatewayError;

/// A multipart socket that moves whole messages.
#[async_trait]
pub trait SocketTransport: Send + fmt::Debug {
    /// Sends one multipart message.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the socket rejects the message.
    async fn send(&mut self, frames: Vec<Frame>) -> Result<(), GatewayError>;

    /// Receives one multipart message, including any routing identity.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] or [`GatewayError::ChannelClosed`]
    /// when the socket fails or the peer went away.
    async fn recv(&mut self) -> Result<Vec<Frame>, GatewayError>;

    /// Releases the socket. Further calls are no-ops.
    async fn close(&mut self);
}

enum ZmqSocket {
    Router(RouterSocket),
    Dealer(DealerSocket),
    Pub(PubSocket),
    Sub(SubSocket),
    Req(ReqSocket),
    Rep(RepSocket),
}

impl ZmqSocket {
    fn new(role: ChannelRole) -> Self {
        match role {
            ChannelRole::Router => Self::Router(RouterSocket::new()),
            ChannelRole::Dealer => Self::Dealer(DealerSocket::new()),
            ChannelRole::Pub => Self::Pub(PubSocket::new()),
            ChannelRole::Sub => Self::Sub(SubSocket::new()),
            ChannelRole::Req => Self::Req(ReqSocket::new()),
            ChannelRole::Rep => Self::Rep(RepSocket::new()),
        }
    }

    async fn bind(&mut self, endpoint: &str) -> Result<String, GatewayError> {
        let bound = match self {
            Self::Router(s) => s.bind(endpoint).await?,
            Self::Dealer(s) => s.bind(endpoint).await?,
            Self::Pub(s) => s.bind(endpoint).await?,
            Self::Sub(s) => s.bind(endpoint).await?,
            Self::Req(s) => s.bind(endpoint).await?,
            Self::Rep(s) => s.bind(endpoint).await?,
        };
        Ok(bound.to_string())
    }

    async fn connect(&mut self, endpoint: &str) -> Result<(), GatewayError> {
        match self {
            Self::Router(s) => s.connect(endpoint).await?,
            Self::Dealer(s) => s.connect(endpoint).await?,
            Self::Pub(s) => s.connect(endpoint).await?,
            Self::Sub(s) => s.connect(endpoint).await?,
            Self::Req(s) => s.connect(endpoint).await?,
            Self::Rep(s) => s.connect(endpoint).await?,
        }
        Ok(())
    }

    async fn close(self) -> Vec<zeromq::ZmqError> {
        match self {
            Self::Router(s) => s.close().await,
            Self::Dealer(s) => s.close().await,
            Self::Pub(s) => s.close().await,
            Self::Sub(s) => s.close().await,
            Self::Req(s) => s.close().await,
            Self::Rep(s) => s.close().await,
        }
    }
}

/// [`SocketTransport`] backed by a `zeromq` socket.
pub struct ZmqTransport {
    role: ChannelRole,
    endpoint: String,
    socket: Option<ZmqSocket>,
}

impl ZmqTransport {
    /// Creates a socket of `role` and connects it to `endpoint`.
    ///
    /// Subscriber sockets subscribe to every topic.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the endpoint is invalid or the
    /// connection cannot be established.
    pub async fn connect(role: ChannelRole, endpoint: &str) -> Result<Self, GatewayError> {
        let mut socket = ZmqSocket::new(role);
        if let ZmqSocket::Sub(sub) = &mut socket {
            sub.subscribe("").await?;
        }
        socket.connect(endpoint).await?;
        Ok(Self {
            role,
            endpoint: endpoint.to_string(),
            socket: Some(socket),
        })
    }

    /// Creates a socket of `role` and binds it to `endpoint`.
    ///
    /// A TCP port of `0` binds an ephemeral port; [`Self::endpoint`] reports
    /// the resolved address.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the endpoint cannot be bound.
    pub async fn bind(role: ChannelRole, endpoint: &str) -> Result<Self, GatewayError> {
        let mut socket = ZmqSocket::new(role);
        if let ZmqSocket::Sub(sub) = &mut socket {
            sub.subscribe("").await?;
        }
        let endpoint = socket.bind(endpoint).await?;
        Ok(Self {
            role,
            endpoint,
            socket: Some(socket),
        })
    }

    /// Returns the endpoint this socket is bound or connected to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Debug for ZmqTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZmqTransport")
            .field("role", &self.role)
            .field("endpoint", &self.endpoint)
            .field("open", &self.socket.is_some())
            .finish()
    }
}

#[async_trait]
impl SocketTransport for ZmqTransport {
    async fn send(&mut self, frames: Vec<Frame>) -> Result<(), GatewayError> {
        let message = ZmqMessage::try_from(frames)
            .map_err(|e| GatewayError::MalformedMessage(e.to_string()))?;
        match self.socket.as_mut() {
            Some(ZmqSocket::Router(s)) => s.send(message).await?,
            Some(ZmqSocket::Dealer(s)) => s.send(message).await?,
            Some(ZmqSocket::Pub(s)) => s.send(message).await?,
            Some(ZmqSocket::Req(s)) => s.send(message).await?,
            Some(ZmqSocket::Rep(s)) => s.send(message).await?,
            Some(ZmqSocket::Sub(_)) => {
                return Err(GatewayError::Transport(
                    "SUB sockets cannot send".to_string(),
                ));
            }
            None => return Err(GatewayError::ChannelClosed),
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<Frame>, GatewayError> {
        let message = match self.socket.as_mut() {
            Some(ZmqSocket::Router(s)) => s.recv().await?,
            Some(ZmqSocket::Dealer(s)) => s.recv().await?,
            Some(ZmqSocket::Sub(s)) => s.recv().await?,
            Some(ZmqSocket::Req(s)) => s.recv().await?,
            Some(ZmqSocket::Rep(s)) => s.recv().await?,
            Some(ZmqSocket::Pub(_)) => std::future::pending().await,
            None => return Err(GatewayError::ChannelClosed),
        };
        Ok(message.into_vec())
    }

    async fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            let errors = socket.close().await;
            for error in errors {
                tracing::debug!(role = %self.role, endpoint = %self.endpoint, %error, "socket close error");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-process transport pair for channel and link tests.

    use tokio::sync::mpsc;

    use super::*;

    /// One end of an in-memory message pipe.
    #[derive(Debug)]
    pub(crate) struct MemoryTransport {
        tx: Option<mpsc::UnboundedSender<Vec<Frame>>>,
        rx: mpsc::UnboundedReceiver<Vec<Frame>>,
    }

    impl MemoryTransport {
        /// Creates two connected ends.
        pub(crate) fn pair() -> (Self, Self) {
            let (a_tx, a_rx) = mpsc::unbounded_channel();
            let (b_tx, b_rx) = mpsc::unbounded_channel();
            (
                Self {
                    tx: Some(a_tx),
                    rx: b_rx,
                },
                Self {
                    tx: Some(b_tx),
                    rx: a_rx,
                },
            )
        }
    }

    #[async_trait]
    impl SocketTransport for MemoryTransport {
        async fn send(&mut self, frames: Vec<Frame>) -> Result<(), GatewayError> {
            self.tx
                .as_ref()
                .ok_or(GatewayError::ChannelClosed)?
                .send(frames)
                .map_err(|_| GatewayError::ChannelClosed)
        }

        async fn recv(&mut self) -> Result<Vec<Frame>, GatewayError> {
            self.rx.recv().await.ok_or(GatewayError::ChannelClosed)
        }

        async fn close(&mut self) {
            self.tx = None;
            self.rx.close();
        }
    }
}
