//! Session DTOs for status, list and execute endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::RequestId;
use crate::service::{ExecuteAccepted, SessionStatus};
use crate::supervisor::ProcessState;

/// Kernel process details inside a [`SessionStatusDto`].
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct KernelStatusDto {
    /// OS process id, if running.
    pub pid: Option<u32>,
    /// Process lifecycle state.
    pub state: ProcessState,
    /// Restarts performed so far.
    pub restart_count: u32,
}

/// Response body for session status endpoints.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionStatusDto {
    /// Session key.
    pub session_key: String,
    /// Kernel process details.
    pub kernel: KernelStatusDto,
    /// Kernel generation; increases on every restart.
    pub generation: u64,
    /// Number of connected subscribers.
    pub subscribers: usize,
    /// Request currently executing, if any.
    pub executing: Option<String>,
    /// Requests queued behind it.
    pub queued: usize,
}

impl From<SessionStatus> for SessionStatusDto {
    fn from(status: SessionStatus) -> Self {
        Self {
            session_key: status.key.to_string(),
            kernel: KernelStatusDto {
                pid: status.kernel.pid,
                state: status.kernel.state,
                restart_count: status.kernel.restart_count,
            },
            generation: status.generation,
            subscribers: status.subscribers,
            executing: status.executing.map(|id| id.to_string()),
            queued: status.queued,
        }
    }
}

/// Response body for `GET /sessions`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionListResponse {
    /// Running sessions, ordered by key.
    pub data: Vec<SessionStatusDto>,
    /// Number of sessions.
    pub total: usize,
}

/// Request body for `POST /sessions/{key}/execute`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ExecuteRequest {
    /// Code to run.
    pub code: String,
    /// Caller-chosen request id; generated when absent.
    #[serde(default)]
    pub request_id: Option<String>,
}

impl ExecuteRequest {
    /// Validated request id, if one was supplied.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::GatewayError::InvalidRequest`] for an empty id.
    pub fn request_id(&self) -> Result<Option<RequestId>, crate::error::GatewayError> {
        self.request_id.clone().map(RequestId::new).transpose()
    }
}

/// Response body for an accepted execute (202 Accepted).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ExecuteResponse {
    /// Request id correlating all output of this execution.
    pub request_id: String,
    /// `0` if running now, else the 1-based queue position.
    pub position: usize,
}

impl From<ExecuteAccepted> for ExecuteResponse {
    fn from(accepted: ExecuteAccepted) -> Self {
        Self {
            request_id: accepted.request_id.to_string(),
            position: accepted.position,
        }
    }
}
