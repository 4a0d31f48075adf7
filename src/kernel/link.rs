//! The channel bundle for one kernel process.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{self, HeartbeatSettings};
use super::{
    ConnectionInfo, KernelMessage, LinkEventKind, LinkEventSender, MessageHeader, WireCodec,
};
use crate::domain::RequestId;
use crate::error::GatewayError;
use crate::supervisor::ProcessHandle;
use crate::transport::{Channel, ChannelRole, Message};

/// The four channels of a kernel, before they are wired together.
#[derive(Debug)]
pub struct LinkChannels {
    /// Request/reply channel for execute requests.
    pub shell: Channel,
    /// Broadcast channel carrying all kernel output.
    pub iopub: Channel,
    /// Out-of-band channel for interrupt and shutdown.
    pub control: Channel,
    /// Liveness ping channel.
    pub heartbeat: Channel,
}

impl LinkChannels {
    /// Connects to the sockets advertised in `info`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if any channel fails to connect.
    pub async fn connect(info: &ConnectionInfo) -> Result<Self, GatewayError> {
        Ok(Self {
            shell: Channel::connect(ChannelRole::Dealer, &info.shell_endpoint()).await?,
            iopub: Channel::connect(ChannelRole::Sub, &info.iopub_endpoint()).await?,
            control: Channel::connect(ChannelRole::Dealer, &info.control_endpoint()).await?,
            heartbeat: Channel::connect(ChannelRole::Req, &info.heartbeat_endpoint()).await?,
        })
    }
}

/// Exclusive connection to one kernel.
///
/// Messages received on IOPub, shell and control are decoded and emitted as
/// [`LinkEventKind`]s. Malformed messages are logged and dropped.
#[derive(Debug)]
pub struct KernelLink {
    session_id: String,
    codec: WireCodec,
    shell: Arc<Channel>,
    iopub: Arc<Channel>,
    control: Arc<Channel>,
    heartbeat: Arc<Channel>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KernelLink {
    /// Opens a link to the kernel behind `process`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionInfo`] if the process has not
    /// reported its sockets and [`GatewayError::Transport`] if the channels
    /// cannot connect.
    pub async fn open(
        process: &ProcessHandle,
        events: LinkEventSender,
        heartbeat: HeartbeatSettings,
    ) -> Result<Self, GatewayError> {
        let info = process.connection_info()?;
        let channels = LinkChannels::connect(info).await?;
        tracing::debug!(
            pid = process.pid(),
            shell = %info.shell_endpoint(),
            generation = events.generation(),
            "kernel link connected"
        );
        Ok(Self::from_channels(
            channels,
            WireCodec::new(&info.key),
            events,
            heartbeat,
        ))
    }

    /// Wires up already-connected channels and starts the reader and
    /// heartbeat tasks.
    #[must_use]
    pub fn from_channels(
        channels: LinkChannels,
        codec: WireCodec,
        events: LinkEventSender,
        heartbeat_settings: HeartbeatSettings,
    ) -> Self {
        let cancel = CancellationToken::new();
        let shell = Arc::new(channels.shell);
        let iopub = Arc::new(channels.iopub);
        let control = Arc::new(channels.control);
        let heartbeat = Arc::new(channels.heartbeat);

        let tasks = vec![
            spawn_reader(Arc::clone(&iopub), codec.clone(), events.clone(), true),
            spawn_reader(Arc::clone(&shell), codec.clone(), events.clone(), false),
            spawn_reader(Arc::clone(&control), codec.clone(), events.clone(), false),
            heartbeat::spawn(
                Arc::clone(&heartbeat),
                heartbeat_settings,
                events,
                cancel.clone(),
            ),
        ];

        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            codec,
            shell,
            iopub,
            control,
            heartbeat,
            cancel,
            tasks: Mutex::new(tasks),
        }
    }

    async fn send(
        &self,
        channel: &Channel,
        msg_id: &str,
        msg_type: &str,
        content: serde_json::Value,
    ) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::ChannelClosed);
        }
        let message = KernelMessage::new(
            MessageHeader::new(msg_id, msg_type, self.session_id.as_str()),
            None,
            content,
        );
        let frames = self.codec.encode(&message)?;
        channel.send(Message::new(frames)).await
    }

    /// Sends an `execute_request` on the shell channel. The kernel echoes
    /// `request_id` as the parent of every related message.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ChannelClosed`] if the link is closed.
    pub async fn send_execute(
        &self,
        code: &str,
        request_id: &RequestId,
    ) -> Result<(), GatewayError> {
        tracing::debug!(request_id = %request_id, "sending execute_request");
        self.send(
            &self.shell,
            request_id.as_str(),
            "execute_request",
            json!({
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
        )
        .await
    }

    /// Sends an `interrupt_request` on the control channel.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ChannelClosed`] if the link is closed.
    pub async fn send_interrupt(&self) -> Result<(), GatewayError> {
        let msg_id = uuid::Uuid::new_v4().to_string();
        self.send(&self.control, &msg_id, "interrupt_request", json!({}))
            .await
    }

    /// Sends a `shutdown_request` on the control channel.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ChannelClosed`] if the link is closed.
    pub async fn send_shutdown(&self, restart: bool) -> Result<(), GatewayError> {
        let msg_id = uuid::Uuid::new_v4().to_string();
        self.send(
            &self.control,
            &msg_id,
            "shutdown_request",
            json!({ "restart": restart }),
        )
        .await
    }

    /// Returns `true` once [`Self::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Closes all four channels and stops the background tasks. Idempotent.
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        for channel in [&self.shell, &self.iopub, &self.control, &self.heartbeat] {
            channel.close();
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

impl Drop for KernelLink {
    fn drop(&mut self) {
        self.cancel.cancel();
        for channel in [&self.shell, &self.iopub, &self.control, &self.heartbeat] {
            channel.close();
        }
    }
}

fn spawn_reader(
    channel: Arc<Channel>,
    codec: WireCodec,
    events: LinkEventSender,
    broadcast: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = match channel.receive().await {
                Ok(message) => message,
                Err(GatewayError::ChannelClosed) => break,
                Err(error) => {
                    tracing::warn!(role = %channel.role(), %error, "dropping kernel message");
                    continue;
                }
            };
            let decoded = match codec.decode(message.frames) {
                Ok(decoded) => decoded,
                Err(error) => {
                    tracing::warn!(role = %channel.role(), %error, "dropping kernel message");
                    continue;
                }
            };
            let kind = if broadcast {
                LinkEventKind::Output(decoded)
            } else {
                LinkEventKind::Reply(decoded)
            };
            if !events.emit(kind) {
                break;
            }
        }
        tracing::trace!(role = %channel.role(), "kernel reader stopped");
    })
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::kernel::LinkEvent;
    use crate::transport::socket::memory::MemoryTransport;

    /// Kernel-side ends of the four channels.
    struct FakeKernel {
        shell: Channel,
        iopub: Channel,
        control: Channel,
        _heartbeat: Channel,
    }

    fn link_pair(key: &str) -> (KernelLink, FakeKernel, mpsc::UnboundedReceiver<LinkEvent>) {
        let channel = |role, other| {
            let (a, b) = MemoryTransport::pair();
            (
                Channel::from_transport(role, "mem://gw".to_string(), Box::new(a)),
                Channel::from_transport(other, "mem://kernel".to_string(), Box::new(b)),
            )
        };
        let (shell, k_shell) = channel(ChannelRole::Dealer, ChannelRole::Dealer);
        let (iopub, k_iopub) = channel(ChannelRole::Sub, ChannelRole::Pub);
        let (control, k_control) = channel(ChannelRole::Dealer, ChannelRole::Dealer);
        let (hb, k_hb) = channel(ChannelRole::Req, ChannelRole::Rep);
        let (tx, rx) = mpsc::unbounded_channel();
        let link = KernelLink::from_channels(
            LinkChannels {
                shell,
                iopub,
                control,
                heartbeat: hb,
            },
            WireCodec::new(key),
            LinkEventSender::new(1, tx),
            HeartbeatSettings {
                interval: Duration::from_secs(3600),
                max_misses: 3,
            },
        );
        (
            link,
            FakeKernel {
                shell: k_shell,
                iopub: k_iopub,
                control: k_control,
                _heartbeat: k_hb,
            },
            rx,
        )
    }

    fn rid(s: &str) -> RequestId {
        let Ok(id) = RequestId::new(s) else {
            panic!("valid request id");
        };
        id
    }

    #[tokio::test]
    async fn execute_request_carries_request_id() {
        let (link, kernel, _rx) = link_pair("secret");
        assert!(link.send_execute("1+1", &rid("req-1")).await.is_ok());

        let Ok(message) = kernel.shell.receive().await else {
            panic!("kernel saw nothing");
        };
        let Ok(decoded) = WireCodec::new("secret").decode(message.frames) else {
            panic!("request should verify");
        };
        assert_eq!(decoded.header.msg_id, "req-1");
        assert_eq!(decoded.msg_type(), "execute_request");
        assert_eq!(decoded.content.get("code"), Some(&json!("1+1")));
    }

    #[tokio::test]
    async fn interrupt_goes_over_control() {
        let (link, kernel, _rx) = link_pair("");
        assert!(link.send_interrupt().await.is_ok());
        let Ok(message) = kernel.control.receive().await else {
            panic!("control saw nothing");
        };
        let Ok(decoded) = WireCodec::new("").decode(message.frames) else {
            panic!("decode failed");
        };
        assert_eq!(decoded.msg_type(), "interrupt_request");
    }

    #[tokio::test]
    async fn iopub_output_becomes_output_event() {
        let (_link, kernel, mut rx) = link_pair("k");
        let codec = WireCodec::new("k");
        let stream = KernelMessage::new(
            MessageHeader::new("m-1", "stream", "kernel"),
            Some(MessageHeader::new("req-1", "execute_request", "gw")),
            json!({"name": "stdout", "text": "2\n"}),
        );
        let Ok(frames) = codec.encode(&stream) else {
            panic!("encode failed");
        };
        assert!(kernel.iopub.send(Message::new(frames)).await.is_ok());

        let Some(event) = rx.recv().await else {
            panic!("expected an event");
        };
        assert_eq!(event.generation, 1);
        let LinkEventKind::Output(message) = event.kind else {
            panic!("expected output");
        };
        assert_eq!(message.parent_request_id(), Some(rid("req-1")));
    }

    #[tokio::test]
    async fn malformed_output_is_dropped() {
        let (_link, kernel, mut rx) = link_pair("k");
        let bogus = Message::new(vec![bytes::Bytes::from_static(b"garbage")]);
        assert!(kernel.iopub.send(bogus).await.is_ok());

        let status = KernelMessage::new(
            MessageHeader::new("m-2", "status", "kernel"),
            None,
            json!({"execution_state": "idle"}),
        );
        let Ok(frames) = WireCodec::new("k").encode(&status) else {
            panic!("encode failed");
        };
        assert!(kernel.iopub.send(Message::new(frames)).await.is_ok());

        let Some(event) = rx.recv().await else {
            panic!("expected an event");
        };
        let LinkEventKind::Output(message) = event.kind else {
            panic!("expected output");
        };
        assert_eq!(message.header.msg_id, "m-2");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (link, _kernel, _rx) = link_pair("");
        link.close().await;
        link.close().await;
        assert!(link.is_closed());
        assert!(matches!(
            link.send_execute("x", &rid("r")).await,
            Err(GatewayError::ChannelClosed)
        ));
    }
}
