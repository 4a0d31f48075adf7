//! Gateway error types with HTTP status code mapping.
//!
//! [`GatewayError`] is the central error type for the gateway. Transport and
//! process failures are mostly handled inside the session worker and turned
//! into subscriber notifications; the variants that reach HTTP and WebSocket
//! callers map to a numeric code and a status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 3002,
///     "message": "kernel failed to start: readiness not reached after 10 attempts",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    /// Numeric error code (see code ranges on [`GatewayError`]).
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Server-side error enum with HTTP status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category          | HTTP Status                  |
/// |-----------|-------------------|------------------------------|
/// | 1000–1999 | Validation        | 400 Bad Request              |
/// | 2000–2999 | Session state     | 404 Not Found / 409 Conflict |
/// | 3000–3999 | Kernel lifecycle  | 503 / 500                    |
/// | 4000–4999 | Kernel transport  | 502 Bad Gateway              |
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// The channel was closed locally or the remote side went away.
    #[error("channel closed")]
    ChannelClosed,

    /// A kernel message violated the wire protocol.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The kernel stopped answering heartbeats.
    #[error("kernel unresponsive after {missed} missed heartbeats")]
    KernelUnresponsive {
        /// Consecutive heartbeat replies that never arrived.
        missed: u32,
    },

    /// The readiness probe budget was exhausted.
    #[error("kernel failed to start: readiness not reached after {attempts} attempts")]
    StartupTimeout {
        /// Number of probe attempts made.
        attempts: u32,
    },

    /// The kernel crashed too quickly, too often.
    #[error("kernel restart budget exceeded after {restarts} restarts")]
    RestartBudgetExceeded {
        /// Restarts performed before giving up.
        restarts: u32,
    },

    /// No session exists for the key.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The session is still starting its kernel.
    #[error("session is still starting: {0}")]
    SessionStarting(String),

    /// Request validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The kernel process could not be spawned or died during startup.
    #[error("failed to spawn kernel: {0}")]
    SpawnFailed(String),

    /// The kernel connection file was missing or unusable.
    #[error("invalid connection info: {0}")]
    ConnectionInfo(String),

    /// Socket-level failure below the channel abstraction.
    #[error("transport error: {0}")]
    Transport(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) => 1001,
            Self::SessionNotFound(_) => 2001,
            Self::SessionStarting(_) => 2002,
            Self::StartupTimeout { .. } => 3001,
            Self::RestartBudgetExceeded { .. } => 3002,
            Self::SpawnFailed(_) => 3003,
            Self::ConnectionInfo(_) => 3004,
            Self::KernelUnresponsive { .. } => 3005,
            Self::Internal(_) => 3000,
            Self::ChannelClosed => 4001,
            Self::MalformedMessage(_) => 4002,
            Self::Transport(_) => 4003,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionStarting(_) => StatusCode::CONFLICT,
            Self::StartupTimeout { .. }
            | Self::RestartBudgetExceeded { .. }
            | Self::KernelUnresponsive { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::SpawnFailed(_) | Self::ConnectionInfo(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ChannelClosed | Self::MalformedMessage(_) | Self::Transport(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    /// Returns `true` for failures the UI should present as "kernel failed".
    #[must_use]
    pub const fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::StartupTimeout { .. } | Self::RestartBudgetExceeded { .. }
        )
    }

    /// Message shown to HTTP and WebSocket clients.
    ///
    /// Request and session-state errors and the user-visible kernel failures
    /// keep their text. Other kernel and transport failures are reported as
    /// `kernel unavailable`; their detail only goes to the log.
    #[must_use]
    pub fn client_message(&self) -> String {
        if self.error_code() < 3000 || self.is_user_visible() {
            self.to_string()
        } else {
            tracing::warn!(error = %self, "kernel failure hidden from client");
            "kernel unavailable".to_string()
        }
    }
}

impl From<zeromq::ZmqError> for GatewayError {
    fn from(err: zeromq::ZmqError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::SpawnFailed(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.client_message(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_startup_errors_are_user_visible() {
        assert!(GatewayError::StartupTimeout { attempts: 10 }.is_user_visible());
        assert!(GatewayError::RestartBudgetExceeded { restarts: 3 }.is_user_visible());
        assert!(!GatewayError::ChannelClosed.is_user_visible());
        assert!(!GatewayError::KernelUnresponsive { missed: 3 }.is_user_visible());
    }

    #[test]
    fn client_message_hides_internal_kernel_failures() {
        assert_eq!(
            GatewayError::Transport("tcp://127.0.0.1:5555 refused".to_string()).client_message(),
            "kernel unavailable"
        );
        assert_eq!(
            GatewayError::ChannelClosed.client_message(),
            "kernel unavailable"
        );
        assert_eq!(
            GatewayError::StartupTimeout { attempts: 10 }.client_message(),
            "kernel failed to start: readiness not reached after 10 attempts"
        );
        assert_eq!(
            GatewayError::SessionNotFound("nb1".to_string()).client_message(),
            "session not found: nb1"
        );
    }

    #[test]
    fn status_codes_follow_categories() {
        assert_eq!(
            GatewayError::SessionNotFound("nb".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::StartupTimeout { attempts: 10 }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::MalformedMessage("x".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn into_response_carries_status() {
        let response = GatewayError::InvalidRequest("empty code".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
