//! KernelLink against an in-test kernel speaking the wire protocol over
//! loopback `zeromq` sockets.

#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use notebook_gateway::domain::RequestId;
use notebook_gateway::error::GatewayError;
use notebook_gateway::kernel::{
    ConnectionInfo, HeartbeatSettings, KernelLink, KernelMessage, LinkChannels, LinkEvent,
    LinkEventKind, LinkEventSender, MessageHeader, WireCodec,
};
use notebook_gateway::transport::{Channel, ChannelRole, Message};

const KEY: &str = "a0436f6c-1916-498b-8eb9-e81ab9368e84";
const TIMEOUT: Duration = Duration::from_secs(5);

/// Kernel side of the four channels.
struct FakeKernel {
    shell: Channel,
    iopub: Channel,
    control: Channel,
    heartbeat: Arc<Channel>,
    codec: WireCodec,
}

fn port(channel: &Channel) -> u16 {
    let Some(port) = channel
        .endpoint()
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
    else {
        panic!("no port in {}", channel.endpoint());
    };
    port
}

async fn bind(role: ChannelRole) -> Channel {
    let Ok(channel) = Channel::bind(role, "tcp://127.0.0.1:0").await else {
        panic!("bind {role} failed");
    };
    channel
}

impl FakeKernel {
    async fn start() -> Self {
        Self {
            shell: bind(ChannelRole::Router).await,
            iopub: bind(ChannelRole::Pub).await,
            control: bind(ChannelRole::Router).await,
            heartbeat: Arc::new(bind(ChannelRole::Rep).await),
            codec: WireCodec::new(KEY),
        }
    }

    fn connection_info(&self) -> ConnectionInfo {
        let json = json!({
            "ip": "127.0.0.1",
            "transport": "tcp",
            "shell_port": port(&self.shell),
            "iopub_port": port(&self.iopub),
            "stdin_port": 1,
            "control_port": port(&self.control),
            "hb_port": port(&self.heartbeat),
            "key": KEY,
            "signature_scheme": "hmac-sha256",
        });
        let Ok(info) = ConnectionInfo::parse(&json.to_string()) else {
            panic!("valid connection info");
        };
        info
    }

    fn answer_heartbeats(&self) {
        let heartbeat = Arc::clone(&self.heartbeat);
        tokio::spawn(async move {
            while let Ok(ping) = heartbeat.receive().await {
                if heartbeat.send(Message::new(ping.frames)).await.is_err() {
                    break;
                }
            }
        });
    }

    async fn receive(&self, channel: &Channel) -> (Option<bytes::Bytes>, KernelMessage) {
        let Ok(Ok(message)) = tokio::time::timeout(TIMEOUT, channel.receive()).await else {
            panic!("kernel received nothing");
        };
        let Ok(decoded) = self.codec.decode(message.frames) else {
            panic!("gateway sent a malformed message");
        };
        (message.sender, decoded)
    }

    async fn publish(&self, codec: &WireCodec, message: &KernelMessage) {
        let Ok(frames) = codec.encode(message) else {
            panic!("encode failed");
        };
        assert!(self.iopub.send(Message::new(frames)).await.is_ok());
    }
}

fn reply(parent: &MessageHeader, msg_type: &str, content: serde_json::Value) -> KernelMessage {
    KernelMessage::new(
        MessageHeader::new(uuid::Uuid::new_v4().to_string(), msg_type, "kernel"),
        Some(parent.clone()),
        content,
    )
}

async fn open(
    kernel: &FakeKernel,
    heartbeat: HeartbeatSettings,
) -> (KernelLink, mpsc::UnboundedReceiver<LinkEvent>) {
    let Ok(channels) = LinkChannels::connect(&kernel.connection_info()).await else {
        panic!("link channels failed to connect");
    };
    let (tx, rx) = mpsc::unbounded_channel();
    let link = KernelLink::from_channels(
        channels,
        WireCodec::new(KEY),
        LinkEventSender::new(0, tx),
        heartbeat,
    );
    // Let the IOPub subscription reach the publisher.
    tokio::time::sleep(Duration::from_millis(300)).await;
    (link, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
    let Ok(Some(event)) = tokio::time::timeout(TIMEOUT, rx.recv()).await else {
        panic!("no link event");
    };
    event
}

fn quiet_heartbeat() -> HeartbeatSettings {
    HeartbeatSettings {
        interval: Duration::from_secs(60),
        max_misses: 3,
    }
}

#[tokio::test]
async fn execute_round_trip_yields_output_then_idle() {
    let kernel = FakeKernel::start().await;
    kernel.answer_heartbeats();
    let (link, mut rx) = open(
        &kernel,
        HeartbeatSettings {
            interval: Duration::from_millis(100),
            max_misses: 3,
        },
    )
    .await;

    let Ok(request_id) = RequestId::new("req-1") else {
        panic!("valid request id");
    };
    assert!(link.send_execute("1+1", &request_id).await.is_ok());

    let (sender, request) = kernel.receive(&kernel.shell).await;
    assert_eq!(request.msg_type(), "execute_request");
    assert_eq!(request.header.msg_id, "req-1");
    assert_eq!(request.content.get("code"), Some(&json!("1+1")));

    kernel
        .publish(
            &kernel.codec,
            &reply(&request.header, "execute_result", json!({"data": {"text/plain": "2"}})),
        )
        .await;
    kernel
        .publish(
            &kernel.codec,
            &reply(&request.header, "status", json!({"execution_state": "idle"})),
        )
        .await;
    let Some(sender) = sender else {
        panic!("shell router must see the gateway identity");
    };
    let Ok(frames) = kernel
        .codec
        .encode(&reply(&request.header, "execute_reply", json!({"status": "ok"})))
    else {
        panic!("encode failed");
    };
    assert!(
        kernel
            .shell
            .send(Message::with_sender(sender, frames))
            .await
            .is_ok()
    );

    let mut outputs = Vec::new();
    let mut replies = Vec::new();
    while outputs.len() < 2 || replies.is_empty() {
        let event = next_event(&mut rx).await;
        assert_eq!(event.generation, 0);
        match event.kind {
            LinkEventKind::Output(message) => outputs.push(message),
            LinkEventKind::Reply(message) => replies.push(message),
            other => panic!("unexpected event {other:?}"),
        }
    }
    let types: Vec<&str> = outputs.iter().map(KernelMessage::msg_type).collect();
    assert_eq!(types, vec!["execute_result", "status"]);
    assert!(outputs.iter().all(|m| m.parent_request_id() == Some(request_id.clone())));
    assert!(outputs.last().is_some_and(KernelMessage::is_idle_status));
    assert_eq!(replies.first().map(KernelMessage::msg_type), Some("execute_reply"));

    link.close().await;
}

#[tokio::test]
async fn interrupt_and_shutdown_use_control() {
    let kernel = FakeKernel::start().await;
    let (link, _rx) = open(&kernel, quiet_heartbeat()).await;

    assert!(link.send_interrupt().await.is_ok());
    let (_, interrupt) = kernel.receive(&kernel.control).await;
    assert_eq!(interrupt.msg_type(), "interrupt_request");

    assert!(link.send_shutdown(false).await.is_ok());
    let (_, shutdown) = kernel.receive(&kernel.control).await;
    assert_eq!(shutdown.msg_type(), "shutdown_request");
    assert_eq!(shutdown.content.get("restart"), Some(&json!(false)));
}

#[tokio::test]
async fn badly_signed_output_is_dropped() {
    let kernel = FakeKernel::start().await;
    let (_link, mut rx) = open(&kernel, quiet_heartbeat()).await;

    let parent = MessageHeader::new("req-9", "execute_request", "gateway");
    let forged = WireCodec::new("wrong-key");
    kernel
        .publish(&forged, &reply(&parent, "stream", json!({"name": "stdout", "text": "forged"})))
        .await;
    kernel
        .publish(
            &kernel.codec,
            &reply(&parent, "stream", json!({"name": "stdout", "text": "genuine"})),
        )
        .await;

    let LinkEventKind::Output(message) = next_event(&mut rx).await.kind else {
        panic!("expected output");
    };
    assert_eq!(message.content.get("text"), Some(&json!("genuine")));
}

#[tokio::test]
async fn silent_heartbeat_reports_unresponsive() {
    let kernel = FakeKernel::start().await;
    let (_link, mut rx) = open(
        &kernel,
        HeartbeatSettings {
            interval: Duration::from_millis(50),
            max_misses: 2,
        },
    )
    .await;

    let event = next_event(&mut rx).await;
    assert!(matches!(
        event.kind,
        LinkEventKind::Unresponsive { missed: 2 }
    ));
}

#[tokio::test]
async fn closed_link_rejects_requests() {
    let kernel = FakeKernel::start().await;
    let (link, _rx) = open(&kernel, quiet_heartbeat()).await;

    link.close().await;
    link.close().await;
    assert!(link.is_closed());
    let Ok(request_id) = RequestId::new("late") else {
        panic!("valid request id");
    };
    assert!(matches!(
        link.send_execute("x", &request_id).await,
        Err(GatewayError::ChannelClosed)
    ));
}
