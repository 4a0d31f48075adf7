//! One socket endpoint plus its framing discipline.
//!
//! A [`Channel`] owns a background pump task that is the only code touching
//! the socket. Writers hand complete messages to the pump through a queue;
//! the pump hands received messages back through another. Sending and
//! receiving therefore proceed independently, and the write lock held by a
//! [`MessageWriter`] keeps two writers from interleaving partial messages.

use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio_util::sync::CancellationToken;

use super::socket::{SocketTransport, ZmqTransport};
use super::{ChannelRole, Frame, Message};
use crate::error::GatewayError;

/// Depth of the per-direction message queues between a channel and its pump.
const QUEUE_DEPTH: usize = 1024;

#[derive(Debug)]
struct WriteHalf {
    outbound: mpsc::Sender<Vec<Frame>>,
}

/// A multipart message channel over one socket endpoint.
#[derive(Debug)]
pub struct Channel {
    role: ChannelRole,
    endpoint: String,
    writer: Mutex<WriteHalf>,
    inbound: Mutex<mpsc::Receiver<Vec<Frame>>>,
    cancel: CancellationToken,
}

impl Channel {
    /// Opens a `zeromq` socket of `role` connected to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the socket cannot connect.
    pub async fn connect(role: ChannelRole, endpoint: &str) -> Result<Self, GatewayError> {
        let transport = ZmqTransport::connect(role, endpoint).await?;
        Ok(Self::from_transport(
            role,
            endpoint.to_string(),
            Box::new(transport),
        ))
    }

    /// Opens a `zeromq` socket of `role` bound to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the endpoint cannot be bound.
    pub async fn bind(role: ChannelRole, endpoint: &str) -> Result<Self, GatewayError> {
        let transport = ZmqTransport::bind(role, endpoint).await?;
        let resolved = transport.endpoint().to_string();
        Ok(Self::from_transport(role, resolved, Box::new(transport)))
    }

    /// Wraps an already-open transport and starts its pump task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn from_transport(
        role: ChannelRole,
        endpoint: String,
        transport: Box<dyn SocketTransport>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let cancel = CancellationToken::new();

        tokio::spawn(pump(
            role,
            transport,
            outbound_rx,
            inbound_tx,
            cancel.clone(),
        ));

        Self {
            role,
            endpoint,
            writer: Mutex::new(WriteHalf {
                outbound: outbound_tx,
            }),
            inbound: Mutex::new(inbound_rx),
            cancel,
        }
    }

    /// Returns the socket role.
    #[must_use]
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Returns the bound or connected endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns `true` once the channel was closed or its socket failed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Acquires the write side for one multipart message.
    ///
    /// Other writers wait until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ChannelClosed`] if the channel is closed and
    /// [`GatewayError::Transport`] if the role cannot send.
    pub async fn writer(&self) -> Result<MessageWriter<'_>, GatewayError> {
        if !self.role.can_send() {
            return Err(GatewayError::Transport(format!(
                "{} channel cannot send",
                self.role
            )));
        }
        let guard = self.writer.lock().await;
        if self.is_closed() {
            return Err(GatewayError::ChannelClosed);
        }
        Ok(MessageWriter {
            channel: self,
            guard,
            pending: Vec::new(),
        })
    }

    /// Sends a complete message.
    ///
    /// On router-role channels `message.sender` selects the destination peer
    /// and is required.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MalformedMessage`] for an empty message or a
    /// router message without a destination, and
    /// [`GatewayError::ChannelClosed`] if the channel is closed.
    pub async fn send(&self, message: Message) -> Result<(), GatewayError> {
        if message.frames.is_empty() {
            return Err(GatewayError::MalformedMessage(
                "cannot send a message without frames".to_string(),
            ));
        }
        let mut writer = self.writer().await?;
        if self.role.is_identity_addressed() {
            let Some(sender) = message.sender else {
                return Err(GatewayError::MalformedMessage(format!(
                    "{} channel requires a destination identity",
                    self.role
                )));
            };
            writer.send_frame(sender, true).await?;
        }
        let last = message.frames.len().saturating_sub(1);
        for (i, frame) in message.frames.into_iter().enumerate() {
            writer.send_frame(frame, i < last).await?;
        }
        Ok(())
    }

    /// Waits for the next complete message.
    ///
    /// On router-role channels the identity frame is returned as
    /// `sender` and removed from `frames`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ChannelClosed`] once the channel is closed,
    /// and [`GatewayError::MalformedMessage`] for an empty message or a
    /// router message without an identity frame. A malformed message is
    /// consumed; the next call continues with the following message.
    pub async fn receive(&self) -> Result<Message, GatewayError> {
        if !self.role.can_receive() {
            return Err(GatewayError::Transport(format!(
                "{} channel cannot receive",
                self.role
            )));
        }
        let mut inbound = self.inbound.lock().await;
        let frames = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(GatewayError::ChannelClosed),
            frames = inbound.recv() => frames.ok_or(GatewayError::ChannelClosed)?,
        };
        split_identity(self.role, frames)
    }

    /// Closes the channel. Pending and future operations fail with
    /// [`GatewayError::ChannelClosed`]. Idempotent.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(role = %self.role, endpoint = %self.endpoint, "closing channel");
            self.cancel.cancel();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Exclusive write access to a [`Channel`] for one multipart message.
#[derive(Debug)]
pub struct MessageWriter<'a> {
    channel: &'a Channel,
    guard: MutexGuard<'a, WriteHalf>,
    pending: Vec<Frame>,
}

impl MessageWriter<'_> {
    /// Appends a frame to the message being built.
    ///
    /// With `more == true` the frame is buffered and the call returns at
    /// once. With `more == false` the buffered frames are flushed to the
    /// socket as one atomic message. On router-role channels the first frame
    /// of each message is the destination identity.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ChannelClosed`] if the channel closed before
    /// the flush, and [`GatewayError::MalformedMessage`] if a router message
    /// has no payload after its identity.
    pub async fn send_frame(
        &mut self,
        data: impl Into<Frame>,
        more: bool,
    ) -> Result<(), GatewayError> {
        self.pending.push(data.into());
        if more {
            return Ok(());
        }
        let frames = std::mem::take(&mut self.pending);
        if self.channel.role.is_identity_addressed() && frames.len() < 2 {
            return Err(GatewayError::MalformedMessage(format!(
                "{} message needs an identity and at least one payload frame",
                self.channel.role
            )));
        }
        if self.channel.is_closed() {
            return Err(GatewayError::ChannelClosed);
        }
        self.guard
            .outbound
            .send(frames)
            .await
            .map_err(|_| GatewayError::ChannelClosed)
    }
}

impl Drop for MessageWriter<'_> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(
                role = %self.channel.role,
                frames = self.pending.len(),
                "discarding unfinished message"
            );
        }
    }
}

fn split_identity(role: ChannelRole, frames: Vec<Frame>) -> Result<Message, GatewayError> {
    if !role.is_identity_addressed() {
        if frames.is_empty() {
            return Err(GatewayError::MalformedMessage(
                "received an empty message".to_string(),
            ));
        }
        return Ok(Message::new(frames));
    }
    let mut frames = frames.into_iter();
    match frames.next() {
        Some(sender) if !sender.is_empty() => {
            let payload: Vec<Frame> = frames.collect();
            if payload.is_empty() {
                return Err(GatewayError::MalformedMessage(format!(
                    "{role} message carries an identity but no payload"
                )));
            }
            Ok(Message::with_sender(sender, payload))
        }
        _ => Err(GatewayError::MalformedMessage(format!(
            "{role} message is missing its identity frame"
        ))),
    }
}

async fn pump(
    role: ChannelRole,
    mut transport: Box<dyn SocketTransport>,
    mut outbound: mpsc::Receiver<Vec<Frame>>,
    inbound: mpsc::Sender<Vec<Frame>>,
    cancel: CancellationToken,
) {
    let result = match role {
        ChannelRole::Req => {
            pump_lockstep(transport.as_mut(), &mut outbound, &inbound, &cancel, true).await
        }
        ChannelRole::Rep => {
            pump_lockstep(transport.as_mut(), &mut outbound, &inbound, &cancel, false).await
        }
        _ => pump_duplex(transport.as_mut(), &mut outbound, &inbound, &cancel).await,
    };
    if let Err(error) = result {
        tracing::debug!(%role, %error, "channel pump stopped");
    }
    cancel.cancel();
    transport.close().await;
}

async fn pump_duplex(
    transport: &mut dyn SocketTransport,
    outbound: &mut mpsc::Receiver<Vec<Frame>>,
    inbound: &mpsc::Sender<Vec<Frame>>,
    cancel: &CancellationToken,
) -> Result<(), GatewayError> {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            frames = outbound.recv() => match frames {
                Some(frames) => transport.send(frames).await?,
                None => return Ok(()),
            },
            received = transport.recv() => {
                if inbound.send(received?).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Strict alternation for REQ (send first) and REP (receive first) sockets.
async fn pump_lockstep(
    transport: &mut dyn SocketTransport,
    outbound: &mut mpsc::Receiver<Vec<Frame>>,
    inbound: &mpsc::Sender<Vec<Frame>>,
    cancel: &CancellationToken,
    send_first: bool,
) -> Result<(), GatewayError> {
    let mut sending = send_first;
    loop {
        if sending {
            let frames = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                frames = outbound.recv() => match frames {
                    Some(frames) => frames,
                    None => return Ok(()),
                },
            };
            transport.send(frames).await?;
        } else {
            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                received = transport.recv() => received?,
            };
            if inbound.send(received).await.is_err() {
                return Ok(());
            }
        }
        sending = !sending;
    }
}
