//! WebSocket connection state machine.
//!
//! Each connection runs two tasks. The socket loop writes replies and
//! session output to the client and forwards client frames to an action
//! task. The action task dispatches actions to the session registry one at a
//! time, so a kernel that is slow to start never holds up output from other
//! sessions.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::messages::{ClientAction, ServerMessage};
use super::subscription::SubscriptionManager;
use crate::domain::{Delivery, OutputSender, SessionKey, output_channel};
use crate::error::GatewayError;
use crate::service::SessionRegistry;

/// Client actions waiting for dispatch before new ones are refused.
const ACTION_QUEUE: usize = 32;

/// Input of the action task.
#[derive(Debug)]
enum Inbound {
    /// A text frame from the client.
    Text(String),
    /// The connection was dropped from a session's subscribers.
    Dropped(SessionKey),
}

/// Runs the read/write loop for a single WebSocket connection.
///
/// - Reads actions from the client and answers each with an `ack` or `error`,
///   in the order the actions arrived.
/// - Forwards output envelopes from all subscribed sessions, in the order
///   each session produced them, and a `subscription_dropped` notice when
///   the client fell too far behind on a session.
///
/// On disconnect every subscription of this connection is removed; the
/// sessions themselves keep running.
pub async fn run_connection(socket: WebSocket, registry: Arc<SessionRegistry>, buffer: usize) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (output_tx, mut output_rx) = output_channel(buffer);
    let (action_tx, action_rx) = mpsc::channel(ACTION_QUEUE);
    let (reply_tx, mut reply_rx) = mpsc::channel(ACTION_QUEUE);
    let subs = SubscriptionManager::new();
    let id = subs.id();
    tracing::debug!(subscriber = %id, "ws connection opened");
    tokio::spawn(run_actions(action_rx, reply_tx, registry, subs, output_tx));

    loop {
        let frame = tokio::select! {
            biased;
            // Incoming action from client
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match action_tx.try_send(Inbound::Text(text.to_string())) {
                        Ok(()) => continue,
                        Err(TrySendError::Full(_)) => {
                            let error = GatewayError::InvalidRequest(
                                "too many actions in flight".to_string(),
                            );
                            ServerMessage::error(&error, None)
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(error)) => {
                    tracing::debug!(%error, "ws receive failed");
                    break;
                }
                _ => continue,
            },
            // Answer to an earlier action
            Some(reply) = reply_rx.recv() => reply,
            // Output from a subscribed session
            Some(delivery) = output_rx.recv() => match delivery {
                Delivery::Output(envelope) => ServerMessage::Output(envelope),
                Delivery::Dropped(session_key) => {
                    // Best effort: cleanup on disconnect unsubscribes anyway.
                    let _ = action_tx.try_send(Inbound::Dropped(session_key.clone()));
                    ServerMessage::SubscriptionDropped { session_key }
                }
            },
        };
        if ws_tx.send(Message::text(frame.to_json())).await.is_err() {
            break;
        }
    }
    // Dropping the action queue lets the action task clean up.
    tracing::debug!(subscriber = %id, "ws connection closing");
}

/// Dispatches actions in arrival order, then unsubscribes the connection
/// from every session once the socket loop is gone.
async fn run_actions(
    mut inbound: mpsc::Receiver<Inbound>,
    replies: mpsc::Sender<ServerMessage>,
    registry: Arc<SessionRegistry>,
    mut subs: SubscriptionManager,
    output_tx: OutputSender,
) {
    while let Some(item) = inbound.recv().await {
        match item {
            Inbound::Text(text) => {
                let reply = handle_text_message(&text, &registry, &mut subs, &output_tx).await;
                if replies.send(reply).await.is_err() {
                    break;
                }
            }
            Inbound::Dropped(key) => {
                subs.unsubscribe(&key);
                tracing::debug!(
                    subscriber = %subs.id(),
                    session = %key,
                    remaining = subs.count(),
                    "subscription dropped"
                );
            }
        }
    }

    for key in subs.drain() {
        registry.unsubscribe(&key, subs.id()).await;
    }
    tracing::debug!(subscriber = %subs.id(), "ws connection closed");
}

/// Handles a text frame from the client, returning the frame to answer with.
async fn handle_text_message(
    text: &str,
    registry: &SessionRegistry,
    subs: &mut SubscriptionManager,
    output_tx: &OutputSender,
) -> ServerMessage {
    let action = match serde_json::from_str::<ClientAction>(text) {
        Ok(action) => action,
        Err(error) => {
            let error = GatewayError::InvalidRequest(format!("malformed action: {error}"));
            return ServerMessage::error(&error, None);
        }
    };
    let key = action.session_key().clone();
    match dispatch(action, registry, subs, output_tx).await {
        Ok(response) => response,
        Err(error) => {
            tracing::debug!(session = %key, %error, "ws action failed");
            ServerMessage::error(&error, Some(key))
        }
    }
}

async fn dispatch(
    action: ClientAction,
    registry: &SessionRegistry,
    subs: &mut SubscriptionManager,
    output_tx: &OutputSender,
) -> Result<ServerMessage, GatewayError> {
    match &action {
        ClientAction::Execute {
            session_key,
            code,
            request_id,
        } => {
            let accepted = registry
                .submit_execute(session_key, code.clone(), request_id.clone())
                .await?;
            Ok(ServerMessage::Ack {
                action: action.name(),
                session_key: session_key.clone(),
                request_id: Some(accepted.request_id),
                position: Some(accepted.position),
            })
        }
        ClientAction::Interrupt { session_key } => {
            registry.interrupt(session_key).await?;
            Ok(ServerMessage::ack(&action))
        }
        ClientAction::Subscribe { session_key } => {
            // Re-subscribing is forwarded too: the session may have been
            // replaced since the last subscribe.
            registry
                .subscribe(session_key, subs.id(), output_tx.clone())
                .await?;
            subs.subscribe(session_key.clone());
            Ok(ServerMessage::ack(&action))
        }
        ClientAction::Unsubscribe { session_key } => {
            subs.unsubscribe(session_key);
            registry.unsubscribe(session_key, subs.id()).await;
            Ok(ServerMessage::ack(&action))
        }
    }
}
