//! Domain layer: identifiers, output envelopes, ordering and fan-out.
//!
//! This module holds the transport-independent pieces of a session: the
//! identifiers clients use, the envelopes they receive, the execution
//! sequencer that keeps one request in flight per kernel, and the subscriber
//! set that output is fanned out to.

pub mod fanout;
pub mod ids;
pub mod output;
pub mod sequencer;

pub use fanout::{Delivery, Fanout, OutputReceiver, OutputSender, output_channel};
pub use ids::{RequestId, SessionKey, SubscriberId};
pub use output::{OutputEnvelope, StreamType};
pub use sequencer::{Completion, Drained, ExecutionSequencer, PendingExecute, Submission};
