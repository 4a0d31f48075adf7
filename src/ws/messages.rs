//! WebSocket message types: client actions and server frames.

use serde::{Deserialize, Serialize};

use crate::domain::{OutputEnvelope, RequestId, SessionKey};
use crate::error::GatewayError;

/// Actions a client can send over WebSocket.
///
/// ```json
/// {"action": "execute", "sessionKey": "nb1", "code": "1+1", "requestId": "req-1"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    /// Run code in the session's kernel.
    Execute {
        /// Target session.
        #[serde(rename = "sessionKey")]
        session_key: SessionKey,
        /// Code to run.
        code: String,
        /// Caller-chosen request id; generated when absent.
        #[serde(rename = "requestId", default)]
        request_id: Option<RequestId>,
    },
    /// Interrupt the running execution.
    Interrupt {
        /// Target session.
        #[serde(rename = "sessionKey")]
        session_key: SessionKey,
    },
    /// Start receiving the session's output.
    Subscribe {
        /// Target session.
        #[serde(rename = "sessionKey")]
        session_key: SessionKey,
    },
    /// Stop receiving the session's output.
    Unsubscribe {
        /// Target session.
        #[serde(rename = "sessionKey")]
        session_key: SessionKey,
    },
}

impl ClientAction {
    /// The action name, as sent by the client.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Execute { .. } => "execute",
            Self::Interrupt { .. } => "interrupt",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }

    /// The session the action targets.
    #[must_use]
    pub const fn session_key(&self) -> &SessionKey {
        match self {
            Self::Execute { session_key, .. }
            | Self::Interrupt { session_key }
            | Self::Subscribe { session_key }
            | Self::Unsubscribe { session_key } => session_key,
        }
    }
}

/// Frames the server sends over WebSocket, tagged by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Kernel output or a session event.
    Output(OutputEnvelope),
    /// An action was accepted.
    #[serde(rename_all = "camelCase")]
    Ack {
        /// Action name.
        action: &'static str,
        /// Target session.
        session_key: SessionKey,
        /// Request id of an accepted execute.
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        /// Queue position of an accepted execute; `0` means running.
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
    },
    /// The connection fell behind on a session's output and no longer
    /// receives it. Subscribing again resumes delivery.
    #[serde(rename_all = "camelCase")]
    SubscriptionDropped {
        /// Session whose output stopped.
        session_key: SessionKey,
    },
    /// An action failed or could not be parsed.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Numeric error code (see [`GatewayError::error_code`]).
        code: u32,
        /// Human-readable message.
        message: String,
        /// Target session, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        session_key: Option<SessionKey>,
    },
}

impl ServerMessage {
    /// Acknowledges `action` without execution details.
    #[must_use]
    pub fn ack(action: &ClientAction) -> Self {
        Self::Ack {
            action: action.name(),
            session_key: action.session_key().clone(),
            request_id: None,
            position: None,
        }
    }

    /// Error frame for `error`.
    #[must_use]
    pub fn error(error: &GatewayError, session_key: Option<SessionKey>) -> Self {
        Self::Error {
            code: error.error_code(),
            message: error.client_message(),
            session_key,
        }
    }

    /// Serializes the frame to JSON text.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::domain::StreamType;

    #[test]
    fn execute_action_parses_camel_case_fields() {
        let text = r#"{"action":"execute","sessionKey":"nb1","code":"1+1","requestId":"req-1"}"#;
        let Ok(ClientAction::Execute {
            session_key,
            code,
            request_id,
        }) = serde_json::from_str::<ClientAction>(text)
        else {
            panic!("expected execute");
        };
        assert_eq!(session_key.as_str(), "nb1");
        assert_eq!(code, "1+1");
        assert_eq!(request_id.as_ref().map(RequestId::as_str), Some("req-1"));
    }

    #[test]
    fn request_id_is_optional() {
        let text = r#"{"action":"execute","sessionKey":"nb1","code":"x"}"#;
        let Ok(ClientAction::Execute { request_id, .. }) = serde_json::from_str(text) else {
            panic!("expected execute");
        };
        assert!(request_id.is_none());
    }

    #[test]
    fn unknown_action_and_bad_key_are_rejected() {
        assert!(serde_json::from_str::<ClientAction>(r#"{"action":"swap","sessionKey":"nb1"}"#).is_err());
        assert!(serde_json::from_str::<ClientAction>(r#"{"action":"subscribe","sessionKey":""}"#).is_err());
        assert!(serde_json::from_str::<ClientAction>(r#"{"action":"subscribe"}"#).is_err());
    }

    #[test]
    fn output_frame_flattens_envelope() {
        let Ok(key) = SessionKey::new("nb1") else {
            panic!("valid key");
        };
        let envelope = OutputEnvelope::lifecycle(
            key,
            StreamType::SessionEnded,
            None,
            json!({"reason": "closed"}),
        );
        let Ok(value) = serde_json::from_str::<Value>(&ServerMessage::Output(envelope).to_json())
        else {
            panic!("valid json");
        };
        assert_eq!(value.get("type"), Some(&json!("output")));
        assert_eq!(value.get("sessionKey"), Some(&json!("nb1")));
        assert_eq!(value.get("streamType"), Some(&json!("session_ended")));
    }

    #[test]
    fn ack_and_error_frames_are_tagged() {
        let Ok(action) =
            serde_json::from_str::<ClientAction>(r#"{"action":"interrupt","sessionKey":"nb1"}"#)
        else {
            panic!("expected interrupt");
        };
        let Ok(ack) = serde_json::from_str::<Value>(&ServerMessage::ack(&action).to_json()) else {
            panic!("valid json");
        };
        assert_eq!(
            ack,
            json!({"type": "ack", "action": "interrupt", "sessionKey": "nb1"})
        );

        let error = GatewayError::SessionNotFound("nb1".to_string());
        let Ok(frame) = serde_json::from_str::<Value>(
            &ServerMessage::error(&error, Some(action.session_key().clone())).to_json(),
        ) else {
            panic!("valid json");
        };
        assert_eq!(frame.get("type"), Some(&json!("error")));
        assert_eq!(frame.get("code"), Some(&json!(2001)));
    }

    #[test]
    fn dropped_subscription_names_the_session() {
        let Ok(key) = SessionKey::new("nb1") else {
            panic!("valid key");
        };
        let frame = ServerMessage::SubscriptionDropped { session_key: key };
        let Ok(value) = serde_json::from_str::<Value>(&frame.to_json()) else {
            panic!("valid json");
        };
        assert_eq!(
            value,
            json!({"type": "subscription_dropped", "sessionKey": "nb1"})
        );
    }

    #[test]
    fn transport_failures_are_reported_generically() {
        let error = GatewayError::Transport("connection refused".to_string());
        let Ok(frame) = serde_json::from_str::<Value>(&ServerMessage::error(&error, None).to_json())
        else {
            panic!("valid json");
        };
        assert_eq!(frame.get("code"), Some(&json!(4003)));
        assert_eq!(frame.get("message"), Some(&json!("kernel unavailable")));
    }
}
