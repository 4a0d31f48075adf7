//! Supervised kernel processes.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::policy::{ReadinessPolicy, RestartTracker};
use crate::error::GatewayError;
use crate::kernel::ConnectionInfo;

/// Placeholder in kernel arguments replaced by the connection file path.
pub const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";

/// Everything needed to launch a kernel process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Executable.
    pub program: String,
    /// Arguments; `{connection_file}` is substituted.
    pub args: Vec<String>,
    /// Working directory.
    pub working_dir: PathBuf,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Readiness criterion.
    pub readiness: ReadinessPolicy,
    /// Where the kernel writes its connection info.
    pub connection_file: PathBuf,
}

impl ProcessSpec {
    /// Arguments with the connection file substituted.
    #[must_use]
    pub fn resolved_args(&self) -> Vec<String> {
        let path = self.connection_file.display().to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(CONNECTION_FILE_PLACEHOLDER, &path))
            .collect()
    }
}

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Spawned, waiting for readiness.
    Starting,
    /// Ready and running.
    Healthy,
    /// Alive but failing health checks, or exited unexpectedly.
    Unhealthy,
    /// Being replaced by a new process.
    Restarting,
    /// Shut down or given up on.
    Stopped,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if it exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if it was killed.
    pub signal: Option<i32>,
}

impl ProcessExit {
    /// Returns `true` for a normal shutdown (exit code 0).
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// A running (or finished) kernel process.
///
/// The child itself is owned by a watcher task; the handle observes its exit
/// and can ask the watcher to kill it.
#[derive(Debug)]
pub struct ProcessHandle {
    spec: ProcessSpec,
    pid: Option<u32>,
    state: ProcessState,
    started_at: Instant,
    connection_info: Option<ConnectionInfo>,
    pub(super) tracker: RestartTracker,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill: CancellationToken,
}

impl ProcessHandle {
    /// Spawns `spec` and starts watching it. The handle is `Starting`.
    pub(super) fn spawn(spec: &ProcessSpec, tracker: RestartTracker) -> Result<Self, GatewayError> {
        let mut command = Command::new(&spec.program);
        command
            .args(spec.resolved_args())
            .current_dir(&spec.working_dir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| GatewayError::SpawnFailed(format!("{}: {e}", spec.program)))?;
        let pid = child.id();
        tracing::info!(pid, program = %spec.program, "kernel process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, pid, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, pid, "stderr");
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        tokio::spawn(watch_child(child, pid, kill.clone(), exit_tx));

        Ok(Self {
            spec: spec.clone(),
            pid,
            state: ProcessState::Starting,
            started_at: Instant::now(),
            connection_info: None,
            tracker,
            exit: exit_rx,
            kill,
        })
    }

    /// Launch parameters.
    #[must_use]
    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// OS process id, if the process was running when spawned.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub(super) fn set_state(&mut self, state: ProcessState) {
        if self.state != state {
            tracing::debug!(pid = self.pid, from = %self.state, to = %state, "process state");
            self.state = state;
        }
    }

    /// When the current process was spawned.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Restarts performed so far.
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.tracker.restarts()
    }

    /// Socket addresses advertised by the kernel.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionInfo`] before the process is ready.
    pub fn connection_info(&self) -> Result<&ConnectionInfo, GatewayError> {
        self.connection_info.as_ref().ok_or_else(|| {
            GatewayError::ConnectionInfo("kernel has not reported its sockets".to_string())
        })
    }

    pub(super) fn set_connection_info(&mut self, info: ConnectionInfo) {
        self.connection_info = Some(info);
    }

    /// How the process ended, if it has.
    #[must_use]
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// A receiver that observes the process exit.
    #[must_use]
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    /// Waits until the process has exited.
    pub async fn wait(&self) -> Option<ProcessExit> {
        wait_exit(self.exit.clone()).await
    }

    /// Kills the process without waiting for it to exit.
    pub(super) fn start_kill(&self) {
        self.kill.cancel();
    }

    /// Replaces the process with a freshly spawned one, keeping the restart
    /// history.
    pub(super) fn replace(&mut self, mut fresh: Self) {
        std::mem::swap(&mut fresh.tracker, &mut self.tracker);
        std::mem::swap(self, &mut fresh);
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// Waits on an exit watch until the process has exited.
pub async fn wait_exit(mut exit: watch::Receiver<Option<ProcessExit>>) -> Option<ProcessExit> {
    if let Ok(status) = exit.wait_for(Option::is_some).await {
        return *status;
    }
    *exit.borrow()
}

async fn watch_child(
    mut child: Child,
    pid: Option<u32>,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            if let Err(error) = child.start_kill() {
                tracing::debug!(pid, %error, "kill failed");
            }
            child.wait().await
        }
    };
    let exit = match status {
        Ok(status) => ProcessExit::from(status),
        Err(error) => {
            tracing::warn!(pid, %error, "failed to wait on kernel process");
            ProcessExit {
                code: None,
                signal: None,
            }
        }
    };
    tracing::info!(pid, %exit, "kernel process exited");
    exit_tx.send_replace(Some(exit));
}

fn forward_output<R>(stream: R, pid: Option<u32>, name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(pid, stream = name, "{line}");
        }
    });
}
