//! Kernel backends behind a session.
//!
//! A session worker talks to its kernel only through [`KernelConnection`].
//! The production backend is [`SupervisedKernel`]: a supervised process plus
//! the [`KernelLink`] to it. Tests substitute in-memory kernels.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::domain::{PendingExecute, SessionKey};
use crate::error::GatewayError;
use crate::kernel::{HeartbeatSettings, KernelLink, LinkEventKind, LinkEventSender};
use crate::supervisor::{
    ProcessHandle, ProcessSpec, ProcessState, ProcessSupervisor, ReadinessPolicy, wait_exit,
};

/// How long a kernel gets to honor `shutdown_request` before it is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Snapshot of a kernel backend for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelInfo {
    /// OS process id.
    pub pid: Option<u32>,
    /// Process lifecycle state.
    pub state: ProcessState,
    /// Restarts performed so far.
    pub restart_count: u32,
}

/// Starts kernels for sessions.
#[async_trait]
pub trait KernelLauncher: Send + Sync + std::fmt::Debug {
    /// Starts a kernel for `key`. Kernel output and process events are
    /// emitted through `events`.
    ///
    /// # Errors
    ///
    /// Returns the startup failure, typically [`GatewayError::StartupTimeout`]
    /// or [`GatewayError::SpawnFailed`].
    async fn launch(
        &self,
        key: &SessionKey,
        events: LinkEventSender,
    ) -> Result<Box<dyn KernelConnection>, GatewayError>;
}

/// A running kernel owned by one session worker.
#[async_trait]
pub trait KernelConnection: Send + std::fmt::Debug {
    /// Forwards an execute request to the kernel.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ChannelClosed`] if the kernel is gone.
    async fn execute(&mut self, request: &PendingExecute) -> Result<(), GatewayError>;

    /// Sends an interrupt out of band.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ChannelClosed`] if the kernel is gone.
    async fn interrupt(&mut self) -> Result<(), GatewayError>;

    /// Replaces a crashed or unresponsive kernel. Events from the new kernel
    /// go to `events`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RestartBudgetExceeded`] on a crash loop, or a
    /// startup error for the replacement.
    async fn restart(&mut self, events: LinkEventSender) -> Result<(), GatewayError>;

    /// Asks the kernel to shut down, then stops the process.
    async fn shutdown(&mut self);

    /// Current backend state.
    fn info(&self) -> KernelInfo;
}

/// Command line and environment used to launch every kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelTemplate {
    /// Executable.
    pub program: String,
    /// Arguments; `{connection_file}` is substituted.
    pub args: Vec<String>,
    /// Working directory.
    pub working_dir: PathBuf,
    /// Extra environment.
    pub env: Vec<(String, String)>,
    /// Readiness criterion.
    pub readiness: ReadinessPolicy,
    /// Directory for connection files.
    pub runtime_dir: PathBuf,
}

impl KernelTemplate {
    /// Builds a process spec with a fresh connection file.
    #[must_use]
    pub fn spec(&self) -> ProcessSpec {
        let file = format!("kernel-{}.json", uuid::Uuid::new_v4());
        ProcessSpec {
            program: self.program.clone(),
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            readiness: self.readiness.clone(),
            connection_file: self.runtime_dir.join(file),
        }
    }
}

/// Launches [`SupervisedKernel`]s.
#[derive(Debug, Clone)]
pub struct SupervisedLauncher {
    supervisor: Arc<ProcessSupervisor>,
    template: KernelTemplate,
    heartbeat: HeartbeatSettings,
}

impl SupervisedLauncher {
    /// Creates a launcher.
    #[must_use]
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        template: KernelTemplate,
        heartbeat: HeartbeatSettings,
    ) -> Self {
        Self {
            supervisor,
            template,
            heartbeat,
        }
    }
}

#[async_trait]
impl KernelLauncher for SupervisedLauncher {
    async fn launch(
        &self,
        key: &SessionKey,
        events: LinkEventSender,
    ) -> Result<Box<dyn KernelConnection>, GatewayError> {
        let spec = self.template.spec();
        tracing::info!(session = %key, program = %spec.program, "starting kernel");
        let mut process = self.supervisor.start(&spec).await?;
        let link = match KernelLink::open(&process, events.clone(), self.heartbeat).await {
            Ok(link) => link,
            Err(error) => {
                self.supervisor.stop(&mut process).await;
                return Err(error);
            }
        };
        let exit_forwarder = forward_exit(&process, events);
        Ok(Box::new(SupervisedKernel {
            key: key.clone(),
            supervisor: Arc::clone(&self.supervisor),
            heartbeat: self.heartbeat,
            process,
            link,
            exit_forwarder,
        }))
    }
}

/// A supervised kernel process and its channel link.
#[derive(Debug)]
pub struct SupervisedKernel {
    key: SessionKey,
    supervisor: Arc<ProcessSupervisor>,
    heartbeat: HeartbeatSettings,
    process: ProcessHandle,
    link: KernelLink,
    exit_forwarder: JoinHandle<()>,
}

/// Emits [`LinkEventKind::Exited`] when the process exits.
fn forward_exit(process: &ProcessHandle, events: LinkEventSender) -> JoinHandle<()> {
    let exit = process.exit_watch();
    tokio::spawn(async move {
        if let Some(status) = wait_exit(exit).await {
            events.emit(LinkEventKind::Exited(status));
        }
    })
}

#[async_trait]
impl KernelConnection for SupervisedKernel {
    async fn execute(&mut self, request: &PendingExecute) -> Result<(), GatewayError> {
        self.link
            .send_execute(&request.code, &request.request_id)
            .await
    }

    async fn interrupt(&mut self) -> Result<(), GatewayError> {
        self.link.send_interrupt().await
    }

    async fn restart(&mut self, events: LinkEventSender) -> Result<(), GatewayError> {
        self.exit_forwarder.abort();
        self.link.close().await;
        tracing::info!(
            session = %self.key,
            generation = events.generation(),
            "restarting kernel"
        );
        self.supervisor.restart(&mut self.process).await?;
        self.link = KernelLink::open(&self.process, events.clone(), self.heartbeat).await?;
        self.exit_forwarder = forward_exit(&self.process, events);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.exit_forwarder.abort();
        if self.process.exit_status().is_none()
            && let Err(error) = self.link.send_shutdown(false).await
        {
            tracing::debug!(session = %self.key, %error, "shutdown request not sent");
        }
        // Grace period for the shutdown request before signals. The link
        // stays open meanwhile so the request is flushed.
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, self.process.wait()).await;
        self.link.close().await;
        self.supervisor.stop(&mut self.process).await;
        if let Err(error) = tokio::fs::remove_file(&self.process.spec().connection_file).await
            && error.kind() != std::io::ErrorKind::NotFound
        {
            tracing::debug!(session = %self.key, %error, "connection file not removed");
        }
    }

    fn info(&self) -> KernelInfo {
        KernelInfo {
            pid: self.process.pid(),
            state: self.process.state(),
            restart_count: self.process.restart_count(),
        }
    }
}
