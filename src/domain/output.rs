//! Output envelopes delivered to session subscribers.
//!
//! Every kernel broadcast and every session-level lifecycle change becomes an
//! [`OutputEnvelope`]. Envelopes are fanned out by the session worker to each
//! subscribed client connection, in the order they were produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{RequestId, SessionKey};
use crate::kernel::KernelMessage;

/// Kind of output carried by an [`OutputEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    /// Text written to standard output.
    Stdout,
    /// Text written to standard error.
    Stderr,
    /// The kernel re-broadcast the code it is about to run.
    ExecuteInput,
    /// Value of the last expression.
    ExecuteResult,
    /// Rich display output.
    DisplayData,
    /// Update of a previously displayed output.
    UpdateDisplayData,
    /// Request to clear the cell output.
    ClearOutput,
    /// Exception raised by the executed code.
    Error,
    /// Kernel busy/idle status.
    Status,
    /// Shell-channel reply to an execute request.
    ExecuteReply,
    /// Any other kernel broadcast; the payload carries the raw type.
    Other,
    /// The request was lost because the kernel died while running it.
    Failed,
    /// The request was dropped from the queue before it ran.
    Cancelled,
    /// A replacement kernel process is up.
    KernelRestarted,
    /// The kernel could not be started or restarted; the session is unusable.
    SessionFailed,
    /// The session was closed.
    SessionEnded,
}

impl StreamType {
    /// Maps a kernel message type to a stream type.
    #[must_use]
    pub fn from_kernel(msg_type: &str, content: &serde_json::Value) -> Self {
        match msg_type {
            "stream" => match content.get("name").and_then(|n| n.as_str()) {
                Some("stderr") => Self::Stderr,
                _ => Self::Stdout,
            },
            "execute_input" => Self::ExecuteInput,
            "execute_result" => Self::ExecuteResult,
            "display_data" => Self::DisplayData,
            "update_display_data" => Self::UpdateDisplayData,
            "clear_output" => Self::ClearOutput,
            "error" => Self::Error,
            "status" => Self::Status,
            "execute_reply" => Self::ExecuteReply,
            _ => Self::Other,
        }
    }
}

/// One unit of output for subscribers of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEnvelope {
    /// Session the output belongs to.
    pub session_key: SessionKey,
    /// Originating request, when the output is correlated to one.
    pub request_id: Option<RequestId>,
    /// Output kind.
    pub stream_type: StreamType,
    /// Kind-specific payload (kernel `content` for kernel output).
    pub payload: serde_json::Value,
    /// Time the gateway produced the envelope.
    pub timestamp: DateTime<Utc>,
}

impl OutputEnvelope {
    /// Builds an envelope for a session-level event.
    #[must_use]
    pub fn lifecycle(
        session_key: SessionKey,
        stream_type: StreamType,
        request_id: Option<RequestId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            session_key,
            request_id,
            stream_type,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Builds an envelope from a kernel message, correlating it through the
    /// parent header's message id.
    #[must_use]
    pub fn from_kernel(session_key: SessionKey, message: &KernelMessage) -> Self {
        let msg_type = message.header.msg_type.as_str();
        let stream_type = StreamType::from_kernel(msg_type, &message.content);
        let payload = match stream_type {
            StreamType::Other => json!({
                "msg_type": msg_type,
                "content": message.content,
            }),
            _ => message.content.clone(),
        };
        Self {
            session_key,
            request_id: message.parent_request_id(),
            stream_type,
            payload,
            timestamp: Utc::now(),
        }
    }
}
