//! Events flowing from a kernel link and its process to the session worker.
//!
//! Each event carries the generation of the kernel that produced it. The
//! generation increases on every restart, so a worker can discard anything a
//! replaced kernel still manages to emit.

use tokio::sync::mpsc;

use super::KernelMessage;
use crate::supervisor::ProcessExit;

/// What happened.
#[derive(Debug, Clone)]
pub enum LinkEventKind {
    /// A message arrived on the IOPub broadcast channel.
    Output(KernelMessage),
    /// A reply arrived on the shell or control channel.
    Reply(KernelMessage),
    /// The heartbeat went unanswered too many times in a row.
    Unresponsive {
        /// Consecutive missed heartbeats.
        missed: u32,
    },
    /// The kernel process exited.
    Exited(ProcessExit),
}

/// An event tagged with the kernel generation that produced it.
#[derive(Debug, Clone)]
pub struct LinkEvent {
    /// Kernel generation.
    pub generation: u64,
    /// Event payload.
    pub kind: LinkEventKind,
}

/// Emits [`LinkEvent`]s for one kernel generation.
///
/// Unbounded so that reader tasks never wait on the session worker while the
/// worker waits on the kernel.
#[derive(Debug, Clone)]
pub struct LinkEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEventSender {
    /// Creates a sender stamping events with `generation`.
    #[must_use]
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { generation, tx }
    }

    /// Generation stamped on emitted events.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Emits an event. Returns `false` once the receiving worker is gone.
    pub fn emit(&self, kind: LinkEventKind) -> bool {
        self.tx
            .send(LinkEvent {
                generation: self.generation,
                kind,
            })
            .is_ok()
    }

    /// Returns `true` once the receiving worker is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
