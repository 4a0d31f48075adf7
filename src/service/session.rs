//! Per-session worker.
//!
//! All state of one session (kernel backend, sequencer, subscribers) is owned
//! by a single task. Callers talk to it through a [`SessionHandle`], which
//! turns each operation into a [`SessionCommand`] and awaits the reply. Kernel
//! output reaches the same task through the link event queue, so subscriber
//! delivery order equals kernel emission order.

use std::ops::ControlFlow;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::backend::{KernelConnection, KernelInfo, KernelLauncher};
use super::session_registry::Eviction;
use crate::domain::{
    Completion, ExecutionSequencer, Fanout, OutputEnvelope, OutputSender, PendingExecute,
    RequestId, SessionKey, StreamType, SubscriberId, Submission,
};
use crate::error::GatewayError;
use crate::kernel::{KernelMessage, LinkEvent, LinkEventKind, LinkEventSender};

/// Tunables for session workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Close a session with no subscribers and nothing executing after this
    /// long. `None` disables idle eviction.
    pub idle_timeout: Option<Duration>,
    /// How long a close waits for the executing request after interrupting.
    pub close_grace: Duration,
    /// Queued execute requests per session.
    pub max_pending: usize,
    /// Depth of the command queue in front of each worker.
    pub command_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            close_grace: Duration::from_secs(2),
            max_pending: 1024,
            command_buffer: 256,
        }
    }
}

/// Result of a successful execute submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteAccepted {
    /// Request identifier correlating all output of this execution.
    pub request_id: RequestId,
    /// `0` if forwarded to the kernel at once, else the 1-based queue position.
    pub position: usize,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Session key.
    pub key: SessionKey,
    /// Kernel backend state.
    pub kernel: KernelInfo,
    /// Kernel generation; increases on every restart.
    pub generation: u64,
    /// Current subscriber count.
    pub subscribers: usize,
    /// Request currently executing.
    pub executing: Option<RequestId>,
    /// Requests waiting behind it.
    pub queued: usize,
}

/// Operations handled by the session worker.
#[derive(Debug)]
pub enum SessionCommand {
    /// Add a fan-out target.
    Subscribe {
        /// Subscriber identity.
        id: SubscriberId,
        /// Where the subscriber's envelopes go.
        sender: OutputSender,
        /// `true` if newly added.
        reply: oneshot::Sender<bool>,
    },
    /// Remove a fan-out target.
    Unsubscribe {
        /// Subscriber identity.
        id: SubscriberId,
        /// `true` if it was subscribed.
        reply: oneshot::Sender<bool>,
    },
    /// Submit code for execution.
    Execute {
        /// Caller-chosen or generated request id.
        request_id: RequestId,
        /// Code to run.
        code: String,
        /// Acceptance or rejection.
        reply: oneshot::Sender<Result<ExecuteAccepted, GatewayError>>,
    },
    /// Interrupt the kernel, bypassing the queue.
    Interrupt {
        /// Whether the interrupt was sent.
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    /// Report status.
    Status {
        /// Status snapshot.
        reply: oneshot::Sender<SessionStatus>,
    },
    /// Kernel output delivered from outside the link.
    KernelOutput {
        /// The kernel message.
        message: KernelMessage,
    },
    /// Tear the session down.
    Close {
        /// Signalled once the kernel is stopped.
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a session worker.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    key: SessionKey,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Session key.
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Returns `true` once the worker has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Returns `true` if both handles address the same worker.
    #[must_use]
    pub fn same_session(&self, other: &Self) -> bool {
        self.commands.same_channel(&other.commands)
    }

    fn gone(&self) -> GatewayError {
        GatewayError::SessionNotFound(self.key.to_string())
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())
    }

    /// Adds a subscriber. Returns `false` if it was already subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SessionNotFound`] if the session has ended.
    pub async fn subscribe(
        &self,
        id: SubscriberId,
        sender: OutputSender,
    ) -> Result<bool, GatewayError> {
        self.request(|reply| SessionCommand::Subscribe { id, sender, reply })
            .await
    }

    /// Removes a subscriber. Returns `false` if it was not subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SessionNotFound`] if the session has ended.
    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<bool, GatewayError> {
        self.request(|reply| SessionCommand::Unsubscribe { id, reply })
            .await
    }

    /// Submits code for execution.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for a duplicate request id or
    /// a full queue, and [`GatewayError::SessionNotFound`] if the session has
    /// ended.
    pub async fn execute(
        &self,
        request_id: RequestId,
        code: String,
    ) -> Result<ExecuteAccepted, GatewayError> {
        self.request(|reply| SessionCommand::Execute {
            request_id,
            code,
            reply,
        })
        .await?
    }

    /// Interrupts the kernel.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SessionNotFound`] if the session has ended, or
    /// the transport error if the interrupt could not be sent.
    pub async fn interrupt(&self) -> Result<(), GatewayError> {
        self.request(|reply| SessionCommand::Interrupt { reply })
            .await?
    }

    /// Returns a status snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SessionNotFound`] if the session has ended.
    pub async fn status(&self) -> Result<SessionStatus, GatewayError> {
        self.request(|reply| SessionCommand::Status { reply }).await
    }

    /// Delivers a kernel message to the session's subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SessionNotFound`] if the session has ended.
    pub async fn kernel_output(&self, message: KernelMessage) -> Result<(), GatewayError> {
        self.commands
            .send(SessionCommand::KernelOutput { message })
            .await
            .map_err(|_| self.gone())
    }

    /// Closes the session and waits for the kernel to stop. Closing an ended
    /// session is a no-op.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::Close { reply: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// Launches the kernel and spawns the worker. `eviction` runs when the
/// worker stops.
///
/// # Errors
///
/// Returns the launcher's startup error.
pub(crate) async fn start(
    key: SessionKey,
    launcher: &dyn KernelLauncher,
    settings: SessionSettings,
    eviction: Eviction,
) -> Result<SessionHandle, GatewayError> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let kernel = launcher
        .launch(&key, LinkEventSender::new(0, events_tx.clone()))
        .await?;
    let (commands_tx, commands_rx) = mpsc::channel(settings.command_buffer.max(1));

    let worker = SessionWorker {
        key: key.clone(),
        kernel,
        sequencer: ExecutionSequencer::new(settings.max_pending),
        fanout: Fanout::new(),
        generation: 0,
        events_tx,
        events: events_rx,
        commands: commands_rx,
        settings,
        last_activity: Instant::now(),
    };
    tokio::spawn(async move {
        worker.run().await;
        eviction.evict().await;
    });
    Ok(SessionHandle {
        key,
        commands: commands_tx,
    })
}

struct SessionWorker {
    key: SessionKey,
    kernel: Box<dyn KernelConnection>,
    sequencer: ExecutionSequencer,
    fanout: Fanout,
    generation: u64,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    commands: mpsc::Receiver<SessionCommand>,
    settings: SessionSettings,
    last_activity: Instant,
}

impl SessionWorker {
    async fn run(mut self) {
        tracing::info!(session = %self.key, "session started");
        loop {
            let idle_deadline = self.idle_deadline();
            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        self.last_activity = Instant::now();
                        self.handle_command(command).await
                    }
                    None => {
                        self.end("all handles dropped").await;
                        ControlFlow::Break(())
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event).await,
                () = tokio::time::sleep_until(idle_deadline.unwrap_or_else(Instant::now)),
                    if idle_deadline.is_some() =>
                {
                    tracing::info!(session = %self.key, "closing idle session");
                    self.close("idle timeout").await;
                    ControlFlow::Break(())
                }
            };
            if flow.is_break() {
                break;
            }
        }
        tracing::info!(session = %self.key, "session stopped");
    }

    fn idle_deadline(&self) -> Option<Instant> {
        self.settings
            .idle_timeout
            .filter(|_| self.fanout.is_empty() && self.sequencer.is_idle())
            .map(|timeout| self.last_activity + timeout)
    }

    fn publish(
        &mut self,
        stream_type: StreamType,
        request_id: Option<RequestId>,
        payload: serde_json::Value,
    ) {
        let envelope =
            OutputEnvelope::lifecycle(self.key.clone(), stream_type, request_id, payload);
        self.fanout.publish(&envelope);
    }

    fn publish_kernel(&mut self, message: &KernelMessage) {
        let envelope = OutputEnvelope::from_kernel(self.key.clone(), message);
        self.fanout.publish(&envelope);
    }

    async fn handle_command(&mut self, command: SessionCommand) -> ControlFlow<()> {
        match command {
            SessionCommand::Subscribe { id, sender, reply } => {
                let added = self.fanout.subscribe(id, sender);
                tracing::debug!(session = %self.key, subscriber = %id, added, "subscribe");
                let _ = reply.send(added);
            }
            SessionCommand::Unsubscribe { id, reply } => {
                let removed = self.fanout.unsubscribe(id);
                tracing::debug!(session = %self.key, subscriber = %id, removed, "unsubscribe");
                let _ = reply.send(removed);
            }
            SessionCommand::Execute {
                request_id,
                code,
                reply,
            } => {
                let _ = reply.send(self.submit(request_id, code).await);
            }
            SessionCommand::Interrupt { reply } => {
                tracing::info!(session = %self.key, "interrupting kernel");
                let _ = reply.send(self.kernel.interrupt().await);
            }
            SessionCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            SessionCommand::KernelOutput { message } => self.on_kernel_output(&message).await,
            SessionCommand::Close { reply } => {
                self.close("closed").await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            key: self.key.clone(),
            kernel: self.kernel.info(),
            generation: self.generation,
            subscribers: self.fanout.len(),
            executing: self.sequencer.executing().cloned(),
            queued: self.sequencer.queued(),
        }
    }

    async fn submit(
        &mut self,
        request_id: RequestId,
        code: String,
    ) -> Result<ExecuteAccepted, GatewayError> {
        match self.sequencer.submit(request_id.clone(), code)? {
            Submission::Queued { position } => {
                tracing::debug!(session = %self.key, request_id = %request_id, position, "execute queued");
                Ok(ExecuteAccepted {
                    request_id,
                    position,
                })
            }
            Submission::Forward(request) => {
                if let Err(error) = self.kernel.execute(&request).await {
                    // Nothing else is queued behind a request forwarded from idle.
                    let _ = self.sequencer.complete(&request.request_id);
                    return Err(error);
                }
                Ok(ExecuteAccepted {
                    request_id,
                    position: 0,
                })
            }
        }
    }

    async fn on_kernel_output(&mut self, message: &KernelMessage) {
        self.publish_kernel(message);
        if message.is_idle_status()
            && let Some(request_id) = message.parent_request_id()
        {
            self.complete(request_id).await;
        }
    }

    /// Marks `request_id` complete and forwards the next queued request. A
    /// request the kernel refuses is failed and the one after it tried.
    async fn complete(&mut self, mut request_id: RequestId) {
        loop {
            match self.sequencer.complete(&request_id) {
                Completion::Next(next) => match self.forward(&next).await {
                    Ok(()) => return,
                    Err(error) => {
                        self.publish(
                            StreamType::Failed,
                            Some(next.request_id.clone()),
                            json!({ "reason": error.to_string() }),
                        );
                        request_id = next.request_id;
                    }
                },
                Completion::Idle => {
                    tracing::debug!(session = %self.key, request_id = %request_id, "sequencer idle");
                    return;
                }
                Completion::Stale => {
                    tracing::trace!(session = %self.key, request_id = %request_id, "stale completion ignored");
                    return;
                }
            }
        }
    }

    async fn forward(&mut self, request: &PendingExecute) -> Result<(), GatewayError> {
        tracing::debug!(session = %self.key, request_id = %request.request_id, "forwarding execute");
        self.kernel.execute(request).await
    }

    async fn handle_event(&mut self, event: LinkEvent) -> ControlFlow<()> {
        if event.generation != self.generation {
            tracing::trace!(
                session = %self.key,
                generation = event.generation,
                current = self.generation,
                "event from replaced kernel discarded"
            );
            return ControlFlow::Continue(());
        }
        match event.kind {
            LinkEventKind::Output(message) => {
                self.last_activity = Instant::now();
                self.on_kernel_output(&message).await;
                ControlFlow::Continue(())
            }
            LinkEventKind::Reply(message) => {
                self.publish_kernel(&message);
                ControlFlow::Continue(())
            }
            LinkEventKind::Unresponsive { missed } => {
                tracing::warn!(session = %self.key, missed, "kernel unresponsive");
                self.recover(&GatewayError::KernelUnresponsive { missed }.to_string())
                    .await
            }
            LinkEventKind::Exited(exit) if exit.success() => {
                tracing::info!(session = %self.key, "kernel exited normally");
                self.end("kernel exited").await;
                ControlFlow::Break(())
            }
            LinkEventKind::Exited(exit) => {
                tracing::warn!(session = %self.key, %exit, "kernel crashed");
                self.recover(&format!("kernel exited with {exit}")).await
            }
        }
    }

    /// Fails the executing request, cancels the queued ones and resets the
    /// sequencer.
    fn abandon_in_flight(&mut self, reason: &str) {
        let drained = self.sequencer.reset();
        if let Some(request_id) = drained.executing {
            self.publish(StreamType::Failed, Some(request_id), json!({ "reason": reason }));
        }
        for request in drained.pending {
            self.publish(
                StreamType::Cancelled,
                Some(request.request_id),
                json!({ "reason": reason }),
            );
        }
    }

    async fn recover(&mut self, reason: &str) -> ControlFlow<()> {
        self.abandon_in_flight(reason);
        self.generation += 1;
        let events = LinkEventSender::new(self.generation, self.events_tx.clone());
        match self.kernel.restart(events).await {
            Ok(()) => {
                let info = self.kernel.info();
                tracing::info!(session = %self.key, generation = self.generation, "kernel restarted");
                self.publish(
                    StreamType::KernelRestarted,
                    None,
                    json!({
                        "reason": reason,
                        "generation": self.generation,
                        "restartCount": info.restart_count,
                    }),
                );
                ControlFlow::Continue(())
            }
            Err(error) => {
                tracing::error!(session = %self.key, %error, "kernel could not be restarted");
                self.kernel.shutdown().await;
                self.publish(
                    StreamType::SessionFailed,
                    None,
                    json!({ "code": error.error_code(), "message": error.client_message() }),
                );
                self.fanout.clear();
                ControlFlow::Break(())
            }
        }
    }

    async fn end(&mut self, reason: &str) {
        self.abandon_in_flight(reason);
        self.kernel.shutdown().await;
        self.publish(StreamType::SessionEnded, None, json!({ "reason": reason }));
        self.fanout.clear();
    }

    async fn close(&mut self, reason: &str) {
        let drained = self.sequencer.reset();
        for request in drained.pending {
            self.publish(
                StreamType::Cancelled,
                Some(request.request_id),
                json!({ "reason": reason }),
            );
        }
        if let Some(request_id) = drained.executing {
            if let Err(error) = self.kernel.interrupt().await {
                tracing::debug!(session = %self.key, %error, "interrupt on close failed");
            }
            if !self.drain_until_idle(&request_id).await {
                self.publish(
                    StreamType::Cancelled,
                    Some(request_id),
                    json!({ "reason": reason }),
                );
            }
        }
        self.kernel.shutdown().await;
        self.publish(StreamType::SessionEnded, None, json!({ "reason": reason }));
        self.fanout.clear();
    }

    /// Relays kernel output until `request_id` completes or the close grace
    /// period runs out. Returns `true` if it completed.
    async fn drain_until_idle(&mut self, request_id: &RequestId) -> bool {
        let deadline = Instant::now() + self.settings.close_grace;
        loop {
            let event = match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => return false,
            };
            if event.generation != self.generation {
                continue;
            }
            match event.kind {
                LinkEventKind::Output(message) => {
                    self.publish_kernel(&message);
                    if message.is_idle_status()
                        && message.parent_request_id().as_ref() == Some(request_id)
                    {
                        return true;
                    }
                }
                LinkEventKind::Reply(message) => self.publish_kernel(&message),
                LinkEventKind::Unresponsive { .. } | LinkEventKind::Exited(_) => return false,
            }
        }
    }
}

impl std::fmt::Debug for SessionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWorker")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("subscribers", &self.fanout.len())
            .finish_non_exhaustive()
    }
}
