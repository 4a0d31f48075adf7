//! Session registry: maps notebook keys to running sessions.
//!
//! The map lock is only held for the key lookup. Session creation runs
//! inside a per-key [`OnceCell`], so concurrent callers for the same key wait
//! for a single kernel launch instead of starting two.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, OnceCell};

use super::backend::KernelLauncher;
use super::session::{self, ExecuteAccepted, SessionHandle, SessionSettings, SessionStatus};
use crate::domain::{OutputSender, RequestId, SessionKey, SubscriberId};
use crate::error::GatewayError;
use crate::kernel::KernelMessage;

type SessionCell = Arc<OnceCell<SessionHandle>>;
type SessionMap = HashMap<SessionKey, SessionCell>;

/// Removes a session from the registry once its worker stops.
#[derive(Debug)]
pub(crate) struct Eviction {
    sessions: Weak<Mutex<SessionMap>>,
    key: SessionKey,
    cell: Weak<OnceCell<SessionHandle>>,
}

impl Eviction {
    /// Removes the entry, unless it already belongs to a newer session.
    pub(crate) async fn evict(self) {
        let Some(sessions) = self.sessions.upgrade() else {
            return;
        };
        let mut sessions = sessions.lock().await;
        let ours = sessions
            .get(&self.key)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), self.cell.as_ptr()));
        if ours {
            sessions.remove(&self.key);
            tracing::debug!(session = %self.key, "session evicted");
        }
    }
}

/// All live sessions, keyed by notebook.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<SessionMap>>,
    launcher: Arc<dyn KernelLauncher>,
    settings: SessionSettings,
}

impl SessionRegistry {
    /// Creates an empty registry that starts kernels with `launcher`.
    #[must_use]
    pub fn new(launcher: Arc<dyn KernelLauncher>, settings: SessionSettings) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            launcher,
            settings,
        }
    }

    /// Returns the session for `key`, starting a kernel if there is none.
    ///
    /// Concurrent calls for the same key share one launch.
    ///
    /// # Errors
    ///
    /// Returns the startup failure ([`GatewayError::StartupTimeout`],
    /// [`GatewayError::SpawnFailed`], ...). Nothing is registered in that case.
    pub async fn get_or_create(&self, key: &SessionKey) -> Result<SessionHandle, GatewayError> {
        let cell = {
            let mut sessions = self.sessions.lock().await;
            Arc::clone(sessions.entry(key.clone()).or_default())
        };

        let result = cell
            .get_or_try_init(|| {
                let eviction = Eviction {
                    sessions: Arc::downgrade(&self.sessions),
                    key: key.clone(),
                    cell: Arc::downgrade(&cell),
                };
                session::start(key.clone(), self.launcher.as_ref(), self.settings, eviction)
            })
            .await;

        match result {
            Ok(handle) if !handle.is_closed() => Ok(handle.clone()),
            Ok(_) => {
                // The worker stopped between lookup and now; start over.
                self.remove_cell(key, &cell).await;
                Box::pin(self.get_or_create(key)).await
            }
            Err(error) => {
                tracing::warn!(session = %key, %error, "session failed to start");
                let mut sessions = self.sessions.lock().await;
                // Waiters still holding the cell retry the launch themselves;
                // the last one to fail unregisters it.
                if !cell.initialized()
                    && Arc::strong_count(&cell) <= 2
                    && sessions
                        .get(key)
                        .is_some_and(|current| Arc::ptr_eq(current, &cell))
                {
                    sessions.remove(key);
                }
                Err(error)
            }
        }
    }

    async fn remove_cell(&self, key: &SessionKey, cell: &SessionCell) {
        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, cell))
        {
            sessions.remove(key);
        }
    }

    /// Returns the running session for `key` without starting one.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SessionStarting`] while its kernel is still
    /// being launched.
    pub async fn lookup(&self, key: &SessionKey) -> Result<Option<SessionHandle>, GatewayError> {
        let cell = self.sessions.lock().await.get(key).map(Arc::clone);
        match cell {
            None => Ok(None),
            Some(cell) => match cell.get() {
                Some(handle) if handle.is_closed() => Ok(None),
                Some(handle) => Ok(Some(handle.clone())),
                None => Err(GatewayError::SessionStarting(key.to_string())),
            },
        }
    }

    async fn require(&self, key: &SessionKey) -> Result<SessionHandle, GatewayError> {
        self.lookup(key)
            .await?
            .ok_or_else(|| GatewayError::SessionNotFound(key.to_string()))
    }

    /// Subscribes `sender` to the output of `key`, starting the session if
    /// needed. Only output produced after this call is delivered.
    ///
    /// # Errors
    ///
    /// Returns the startup failure if the session had to be started.
    pub async fn subscribe(
        &self,
        key: &SessionKey,
        id: SubscriberId,
        sender: OutputSender,
    ) -> Result<(), GatewayError> {
        let handle = self.get_or_create(key).await?;
        handle.subscribe(id, sender).await?;
        Ok(())
    }

    /// Removes a subscriber. Never stops the session. Returns `false` if the
    /// subscriber or session was not found.
    pub async fn unsubscribe(&self, key: &SessionKey, id: SubscriberId) -> bool {
        match self.lookup(key).await {
            Ok(Some(handle)) => handle.unsubscribe(id).await.unwrap_or(false),
            Ok(None) | Err(_) => false,
        }
    }

    /// Submits code to the session for `key`, starting it if needed. Returns
    /// as soon as the request is forwarded or queued.
    ///
    /// # Errors
    ///
    /// Returns the startup failure, or [`GatewayError::InvalidRequest`] for a
    /// duplicate request id or a full queue.
    pub async fn submit_execute(
        &self,
        key: &SessionKey,
        code: String,
        request_id: Option<RequestId>,
    ) -> Result<ExecuteAccepted, GatewayError> {
        let handle = self.get_or_create(key).await?;
        let request_id = request_id.unwrap_or_else(RequestId::generate);
        handle.execute(request_id, code).await
    }

    /// Interrupts the kernel of `key`, bypassing the execution queue.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SessionNotFound`] if there is no such session.
    pub async fn interrupt(&self, key: &SessionKey) -> Result<(), GatewayError> {
        self.require(key).await?.interrupt().await
    }

    /// Delivers a kernel message to the subscribers of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SessionNotFound`] if there is no such session.
    pub async fn on_kernel_output(
        &self,
        key: &SessionKey,
        message: KernelMessage,
    ) -> Result<(), GatewayError> {
        self.require(key).await?.kernel_output(message).await
    }

    /// Closes the session for `key`: interrupts running code, stops the
    /// kernel, notifies subscribers and evicts it. Closing an unknown or
    /// already closed session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SessionStarting`] while its kernel is still
    /// being launched.
    pub async fn close(&self, key: &SessionKey) -> Result<(), GatewayError> {
        if let Some(handle) = self.lookup(key).await? {
            tracing::info!(session = %key, "closing session");
            handle.close().await;
        }
        Ok(())
    }

    /// Status of the session for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SessionNotFound`] if there is no such session.
    pub async fn status(&self, key: &SessionKey) -> Result<SessionStatus, GatewayError> {
        self.require(key).await?.status().await
    }

    async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions
            .lock()
            .await
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }

    /// Status of every running session.
    pub async fn list(&self) -> Vec<SessionStatus> {
        let mut statuses = Vec::new();
        for handle in self.handles().await {
            if let Ok(status) = handle.status().await {
                statuses.push(status);
            }
        }
        statuses.sort_by(|a, b| a.key.as_str().cmp(b.key.as_str()));
        statuses
    }

    /// Number of registered sessions, including ones still starting.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Returns `true` if no sessions are registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Closes every session.
    pub async fn shutdown_all(&self) {
        let handles = self.handles().await;
        tracing::info!(sessions = handles.len(), "closing all sessions");
        let closing = handles.iter().map(SessionHandle::close);
        futures_util::future::join_all(closing).await;
    }
}
