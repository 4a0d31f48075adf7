//! Per-session subscriber set and output fan-out.
//!
//! [`Fanout`] is owned by exactly one session worker. Each subscriber is a
//! bounded queue belonging to one client connection (see [`output_channel`]),
//! so output for a subscriber is delivered in the order it was published and
//! a subscriber only sees output published after it joined.
//!
//! A subscriber whose queue is full is removed from the session instead of
//! stalling it. The connection learns about this through a
//! [`Delivery::Dropped`] notice that follows the output it did receive.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{OutputEnvelope, SessionKey, SubscriberId};

/// Sending half of a client connection's output queue.
#[derive(Debug, Clone)]
pub struct OutputSender {
    output: mpsc::Sender<OutputEnvelope>,
    dropped: mpsc::UnboundedSender<SessionKey>,
}

/// Receiving half of a client connection's output queue.
#[derive(Debug)]
pub struct OutputReceiver {
    output: mpsc::Receiver<OutputEnvelope>,
    dropped: mpsc::UnboundedReceiver<SessionKey>,
}

/// What a client connection receives from the sessions it subscribed to.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Kernel output or a session event.
    Output(OutputEnvelope),
    /// The connection fell behind on this session and no longer receives
    /// its output.
    Dropped(SessionKey),
}

/// Creates an output queue holding up to `buffer` undelivered envelopes.
#[must_use]
pub fn output_channel(buffer: usize) -> (OutputSender, OutputReceiver) {
    let (output_tx, output_rx) = mpsc::channel(buffer.max(1));
    let (dropped_tx, dropped_rx) = mpsc::unbounded_channel();
    (
        OutputSender {
            output: output_tx,
            dropped: dropped_tx,
        },
        OutputReceiver {
            output: output_rx,
            dropped: dropped_rx,
        },
    )
}

impl OutputReceiver {
    /// Waits for the next delivery. Returns `None` once every sender is gone.
    ///
    /// Queued output is delivered before a drop notice.
    pub async fn recv(&mut self) -> Option<Delivery> {
        tokio::select! {
            biased;
            Some(envelope) = self.output.recv() => Some(Delivery::Output(envelope)),
            Some(key) = self.dropped.recv() => Some(Delivery::Dropped(key)),
            else => None,
        }
    }
}

/// Fan-out target set for one session.
///
/// A subscriber whose queue is full is dropped and notified; a subscriber
/// whose receiver is gone is pruned on the next publish.
#[derive(Debug, Default)]
pub struct Fanout {
    subscribers: HashMap<SubscriberId, OutputSender>,
}

impl Fanout {
    /// Creates an empty fan-out set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a subscriber. Returns `true` if it was not present.
    pub fn subscribe(&mut self, id: SubscriberId, sender: OutputSender) -> bool {
        self.subscribers.insert(id, sender).is_none()
    }

    /// Removes a subscriber. Returns `true` if it was present.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Delivers an envelope to every subscriber.
    ///
    /// Returns the number of subscribers that accepted it.
    pub fn publish(&mut self, envelope: &OutputEnvelope) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|id, sender| {
            match sender.output.try_send(envelope.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = %id,
                        session = %envelope.session_key,
                        "subscriber lagged behind kernel output, dropping it"
                    );
                    let _ = sender.dropped.send(envelope.session_key.clone());
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber = %id, "subscriber disconnected");
                    false
                }
            }
        });
        delivered
    }

    /// Drops every subscriber.
    pub fn clear(&mut self) {
        self.subscribers.clear();
    }

    /// Returns the current number of subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Returns `true` if nobody is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
