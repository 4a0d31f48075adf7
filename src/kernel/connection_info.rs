//! Kernel connection file.
//!
//! A kernel started with `-f <path>` writes the socket addresses it listens on
//! and its signing key to a small JSON document. The gateway reads it once the
//! process is up and connects its channels accordingly.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// The only signature scheme the gateway understands.
pub const SIGNATURE_SCHEME: &str = "hmac-sha256";

/// Socket addresses and signing key advertised by a kernel process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Address the kernel listens on.
    pub ip: String,
    /// Socket transport, normally `tcp`.
    #[serde(default = "default_transport")]
    pub transport: String,
    /// Shell (request/reply) port.
    pub shell_port: u16,
    /// IOPub (broadcast) port.
    pub iopub_port: u16,
    /// Stdin port. Unused by the gateway.
    pub stdin_port: u16,
    /// Control (out-of-band) port.
    pub control_port: u16,
    /// Heartbeat port.
    pub hb_port: u16,
    /// HMAC key; empty disables signing.
    #[serde(default)]
    pub key: String,
    /// Signature scheme, e.g. `hmac-sha256`.
    #[serde(default = "default_signature_scheme")]
    pub signature_scheme: String,
    /// Kernel spec name, if the kernel reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_signature_scheme() -> String {
    SIGNATURE_SCHEME.to_string()
}

impl ConnectionInfo {
    /// Parses and validates a connection document.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionInfo`] if the JSON is invalid, a port
    /// is zero, or the signature scheme is not `hmac-sha256`.
    pub fn parse(json: &str) -> Result<Self, GatewayError> {
        let info: Self = serde_json::from_str(json)
            .map_err(|e| GatewayError::ConnectionInfo(e.to_string()))?;
        info.validate()?;
        Ok(info)
    }

    /// Reads and validates a connection file.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionInfo`] if the file cannot be read or
    /// fails [`Self::parse`].
    pub async fn load(path: &Path) -> Result<Self, GatewayError> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::ConnectionInfo(format!("{}: {e}", path.display()))
        })?;
        Self::parse(&json)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.signature_scheme != SIGNATURE_SCHEME {
            return Err(GatewayError::ConnectionInfo(format!(
                "unsupported signature scheme {}",
                self.signature_scheme
            )));
        }
        let ports = [
            ("shell_port", self.shell_port),
            ("iopub_port", self.iopub_port),
            ("control_port", self.control_port),
            ("hb_port", self.hb_port),
        ];
        if let Some((name, _)) = ports.iter().find(|(_, port)| *port == 0) {
            return Err(GatewayError::ConnectionInfo(format!("{name} is not set")));
        }
        Ok(())
    }

    /// Builds a socket endpoint for `port` on the kernel's address.
    #[must_use]
    pub fn endpoint(&self, port: u16) -> String {
        format!("{}://{}:{port}", self.transport, self.ip)
    }

    /// Shell channel endpoint.
    #[must_use]
    pub fn shell_endpoint(&self) -> String {
        self.endpoint(self.shell_port)
    }

    /// IOPub channel endpoint.
    #[must_use]
    pub fn iopub_endpoint(&self) -> String {
        self.endpoint(self.iopub_port)
    }

    /// Control channel endpoint.
    #[must_use]
    pub fn control_endpoint(&self) -> String {
        self.endpoint(self.control_port)
    }

    /// Heartbeat channel endpoint.
    #[must_use]
    pub fn heartbeat_endpoint(&self) -> String {
        self.endpoint(self.hb_port)
    }
}
