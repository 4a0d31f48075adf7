//! Kernel message wire format.
//!
//! ```text
//! [identities…] "<IDS|MSG>" signature header parent_header metadata content [buffers…]
//! ```
//!
//! The signature is the hex HMAC-SHA256 of the four JSON frames, keyed with
//! the connection file's `key`. An empty key means messages are unsigned.

use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::Sha256;

use crate::domain::RequestId;
use crate::error::GatewayError;
use crate::transport::Frame;

type HmacSha256 = Hmac<Sha256>;

/// Separates routing identities from the signed part of a message.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Messaging protocol version stamped on outgoing headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Header of a kernel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Unique message id. Execute requests use the gateway request id.
    pub msg_id: String,
    /// Client session id.
    pub session: String,
    /// User name.
    #[serde(default)]
    pub username: String,
    /// ISO-8601 creation time.
    #[serde(default)]
    pub date: String,
    /// Message type, e.g. `execute_request`.
    pub msg_type: String,
    /// Protocol version.
    #[serde(default)]
    pub version: String,
}

impl MessageHeader {
    /// Creates a header stamped with the current time.
    #[must_use]
    pub fn new(
        msg_id: impl Into<String>,
        msg_type: impl Into<String>,
        session: impl Into<String>,
    ) -> Self {
        Self {
            msg_id: msg_id.into(),
            session: session.into(),
            username: "gateway".to_string(),
            date: Utc::now().to_rfc3339(),
            msg_type: msg_type.into(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// A decoded kernel message.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelMessage {
    /// Routing prefix (topic on IOPub, peer identities on shell).
    pub identities: Vec<Frame>,
    /// Message header.
    pub header: MessageHeader,
    /// Header of the message this one answers, if any.
    pub parent: Option<MessageHeader>,
    /// Free-form metadata.
    pub metadata: Value,
    /// Type-specific content.
    pub content: Value,
    /// Trailing binary buffers.
    pub buffers: Vec<Frame>,
}

impl KernelMessage {
    /// Creates a message with empty metadata and no buffers.
    #[must_use]
    pub fn new(header: MessageHeader, parent: Option<MessageHeader>, content: Value) -> Self {
        Self {
            identities: Vec::new(),
            header,
            parent,
            metadata: json!({}),
            content,
            buffers: Vec::new(),
        }
    }

    /// Message type from the header.
    #[must_use]
    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// Gateway request this message answers, taken from the parent header.
    #[must_use]
    pub fn parent_request_id(&self) -> Option<RequestId> {
        self.parent
            .as_ref()
            .and_then(|p| RequestId::new(p.msg_id.as_str()).ok())
    }

    /// Returns `true` for an IOPub `status` message reporting `idle`.
    ///
    /// The kernel publishes it after all output of the parent request, so it
    /// marks that request's completion.
    #[must_use]
    pub fn is_idle_status(&self) -> bool {
        self.header.msg_type == "status"
            && self.content.get("execution_state").and_then(Value::as_str) == Some("idle")
    }
}

/// Signs, encodes and decodes kernel messages for one connection.
#[derive(Clone)]
pub struct WireCodec {
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for WireCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireCodec")
            .field("signed", &self.key.is_some())
            .finish()
    }
}

impl WireCodec {
    /// Creates a codec for `key`. An empty key disables signing.
    #[must_use]
    pub fn new(key: &str) -> Self {
        Self {
            key: (!key.is_empty()).then(|| key.as_bytes().to_vec()),
        }
    }

    fn mac(&self, parts: &[&[u8]]) -> Result<Option<HmacSha256>, GatewayError> {
        let Some(key) = &self.key else {
            return Ok(None);
        };
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| GatewayError::Internal(format!("hmac key: {e}")))?;
        for part in parts {
            mac.update(part);
        }
        Ok(Some(mac))
    }

    /// Hex signature over `parts`, or an empty string when unsigned.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if the key is unusable.
    pub fn sign(&self, parts: &[&[u8]]) -> Result<String, GatewayError> {
        Ok(self
            .mac(parts)?
            .map(|mac| hex::encode(mac.finalize().into_bytes()))
            .unwrap_or_default())
    }

    fn verify(&self, signature: &[u8], parts: &[&[u8]]) -> Result<(), GatewayError> {
        let Some(mac) = self.mac(parts)? else {
            return Ok(());
        };
        let expected = hex::decode(signature)
            .map_err(|_| GatewayError::MalformedMessage("signature is not hex".to_string()))?;
        mac.verify_slice(&expected)
            .map_err(|_| GatewayError::MalformedMessage("signature mismatch".to_string()))
    }

    /// Encodes a message into signed frames.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if a JSON part cannot be serialized.
    pub fn encode(&self, message: &KernelMessage) -> Result<Vec<Frame>, GatewayError> {
        let header = to_frame(&message.header)?;
        let parent = match &message.parent {
            Some(parent) => to_frame(parent)?,
            None => Bytes::from_static(b"{}"),
        };
        let metadata = to_frame(&message.metadata)?;
        let content = to_frame(&message.content)?;
        let signature = self.sign(&[&header, &parent, &metadata, &content])?;

        let mut frames = message.identities.clone();
        frames.push(Bytes::from_static(DELIMITER));
        frames.push(Bytes::from(signature));
        frames.extend([header, parent, metadata, content]);
        frames.extend(message.buffers.iter().cloned());
        Ok(frames)
    }

    /// Decodes and verifies frames received from a kernel.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MalformedMessage`] if the delimiter or a JSON
    /// part is missing, a part is not valid JSON, or the signature does not
    /// match.
    pub fn decode(&self, frames: Vec<Frame>) -> Result<KernelMessage, GatewayError> {
        let mut frames = frames.into_iter();
        let mut identities = Vec::new();
        loop {
            match frames.next() {
                Some(frame) if frame.as_ref() == DELIMITER => break,
                Some(frame) => identities.push(frame),
                None => {
                    return Err(GatewayError::MalformedMessage(
                        "missing <IDS|MSG> delimiter".to_string(),
                    ));
                }
            }
        }
        let (Some(signature), Some(header), Some(parent), Some(metadata), Some(content)) = (
            frames.next(),
            frames.next(),
            frames.next(),
            frames.next(),
            frames.next(),
        ) else {
            return Err(GatewayError::MalformedMessage(
                "message is missing header, parent, metadata or content".to_string(),
            ));
        };
        self.verify(&signature, &[&header, &parent, &metadata, &content])?;

        let header: MessageHeader = parse_part("header", &header)?;
        let parent: Value = parse_part("parent_header", &parent)?;
        let parent = match parent {
            Value::Object(ref fields) if fields.is_empty() => None,
            Value::Null => None,
            other => Some(
                serde_json::from_value(other)
                    .map_err(|e| GatewayError::MalformedMessage(format!("parent_header: {e}")))?,
            ),
        };
        Ok(KernelMessage {
            identities,
            header,
            parent,
            metadata: parse_part("metadata", &metadata)?,
            content: parse_part("content", &content)?,
            buffers: frames.collect(),
        })
    }
}

fn parse_part<T: serde::de::DeserializeOwned>(name: &str, frame: &[u8]) -> Result<T, GatewayError> {
    serde_json::from_slice(frame).map_err(|e| GatewayError::MalformedMessage(format!("{name}: {e}")))
}

fn to_frame<T: Serialize>(value: &T) -> Result<Frame, GatewayError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| GatewayError::Internal(format!("serialize message: {e}")))
}
