//! Channel framing over real `zeromq` sockets on loopback TCP.

#![allow(clippy::panic)]

use std::time::Duration;

use bytes::Bytes;
use notebook_gateway::error::GatewayError;
use notebook_gateway::transport::{Channel, ChannelRole, Message};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn bind(role: ChannelRole) -> Channel {
    let Ok(channel) = Channel::bind(role, "tcp://127.0.0.1:0").await else {
        panic!("bind {role} failed");
    };
    channel
}

async fn connect(role: ChannelRole, endpoint: &str) -> Channel {
    let Ok(channel) = Channel::connect(role, endpoint).await else {
        panic!("connect {role} to {endpoint} failed");
    };
    channel
}

async fn receive(channel: &Channel) -> Message {
    let Ok(Ok(message)) = tokio::time::timeout(TIMEOUT, channel.receive()).await else {
        panic!("no message on {}", channel.role());
    };
    message
}

fn frames(parts: &[&'static str]) -> Vec<Bytes> {
    parts.iter().map(|p| Bytes::from_static(p.as_bytes())).collect()
}

#[tokio::test]
async fn router_separates_sender_and_routes_replies() {
    let router = bind(ChannelRole::Router).await;
    let alice = connect(ChannelRole::Dealer, router.endpoint()).await;
    let bob = connect(ChannelRole::Dealer, router.endpoint()).await;

    assert!(alice.send(Message::new(frames(&["from", "alice"]))).await.is_ok());
    let first = receive(&router).await;
    assert!(bob.send(Message::new(frames(&["from", "bob"]))).await.is_ok());
    let second = receive(&router).await;

    assert_eq!(first.frames, frames(&["from", "alice"]));
    assert_eq!(second.frames, frames(&["from", "bob"]));
    let (Some(alice_id), Some(bob_id)) = (first.sender, second.sender) else {
        panic!("router messages must carry a sender");
    };
    assert_ne!(alice_id, bob_id);

    assert!(
        router
            .send(Message::with_sender(bob_id, frames(&["to", "bob"])))
            .await
            .is_ok()
    );
    assert!(
        router
            .send(Message::with_sender(alice_id, frames(&["to", "alice"])))
            .await
            .is_ok()
    );
    let to_bob = receive(&bob).await;
    let to_alice = receive(&alice).await;
    assert_eq!(to_bob.frames, frames(&["to", "bob"]));
    assert!(to_bob.sender.is_none());
    assert_eq!(to_alice.frames, frames(&["to", "alice"]));
}

#[tokio::test]
async fn router_send_without_destination_is_rejected() {
    let router = bind(ChannelRole::Router).await;
    let result = router.send(Message::new(frames(&["nowhere"]))).await;
    assert!(matches!(result, Err(GatewayError::MalformedMessage(_))));
}

#[tokio::test]
async fn req_rep_echoes_in_lockstep() {
    let rep = bind(ChannelRole::Rep).await;
    let req = connect(ChannelRole::Req, rep.endpoint()).await;

    for round in ["ping-1", "ping-2"] {
        assert!(req.send(Message::new(frames(&[round]))).await.is_ok());
        let request = receive(&rep).await;
        assert_eq!(request.frames, frames(&[round]));
        assert!(rep.send(Message::new(request.frames)).await.is_ok());
        assert_eq!(receive(&req).await.frames, frames(&[round]));
    }
}

#[tokio::test]
async fn multipart_writer_sends_one_message() {
    let router = bind(ChannelRole::Router).await;
    let dealer = connect(ChannelRole::Dealer, router.endpoint()).await;

    {
        let Ok(mut writer) = dealer.writer().await else {
            panic!("writer unavailable");
        };
        for (i, part) in ["a", "b", "c"].into_iter().enumerate() {
            assert!(writer.send_frame(part, i < 2).await.is_ok());
        }
    }
    let message = receive(&router).await;
    assert_eq!(message.frames, frames(&["a", "b", "c"]));
}

#[tokio::test]
async fn close_is_idempotent_and_fails_pending_receive() {
    let router = bind(ChannelRole::Router).await;
    let dealer = std::sync::Arc::new(connect(ChannelRole::Dealer, router.endpoint()).await);

    let waiting = {
        let dealer = std::sync::Arc::clone(&dealer);
        tokio::spawn(async move { dealer.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    dealer.close();
    dealer.close();
    assert!(dealer.is_closed());

    let Ok(Ok(result)) = tokio::time::timeout(TIMEOUT, waiting).await else {
        panic!("pending receive did not finish");
    };
    assert!(matches!(result, Err(GatewayError::ChannelClosed)));
    assert!(matches!(
        dealer.send(Message::new(frames(&["late"]))).await,
        Err(GatewayError::ChannelClosed)
    ));
}
