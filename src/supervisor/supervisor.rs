//! Spawning, readiness, restart and shutdown of kernel processes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::policy::{
    Probe, ReadinessPolicy, RestartDecision, RestartPolicy, RestartTracker, RetryPolicy,
};
use super::process::{ProcessExit, ProcessHandle, ProcessSpec, ProcessState};
use crate::error::GatewayError;
use crate::kernel::ConnectionInfo;

/// Starts kernel processes, waits for them to become ready, restarts them
/// within the crash-loop budget and stops them.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    retry: RetryPolicy,
    restart: RestartPolicy,
    stop_timeout: Duration,
    http: reqwest::Client,
}

impl ProcessSupervisor {
    /// Creates a supervisor.
    #[must_use]
    pub fn new(retry: RetryPolicy, restart: RestartPolicy, stop_timeout: Duration) -> Self {
        Self {
            retry,
            restart,
            stop_timeout,
            http: reqwest::Client::new(),
        }
    }

    /// Launches `spec` and returns once it is ready.
    ///
    /// Startup is not retried: if readiness is not reached within the retry
    /// budget the process is killed and the error returned.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SpawnFailed`] if the process cannot be spawned
    /// or exits during startup, and [`GatewayError::StartupTimeout`] if the
    /// readiness budget is exhausted.
    pub async fn start(&self, spec: &ProcessSpec) -> Result<ProcessHandle, GatewayError> {
        self.launch(spec, RestartTracker::new(self.restart)).await
    }

    async fn launch(
        &self,
        spec: &ProcessSpec,
        tracker: RestartTracker,
    ) -> Result<ProcessHandle, GatewayError> {
        match tokio::fs::remove_file(&spec.connection_file).await {
            Ok(()) => {
                tracing::debug!(path = %spec.connection_file.display(), "removed stale connection file");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(GatewayError::SpawnFailed(e.to_string())),
        }

        let mut handle = ProcessHandle::spawn(spec, tracker)?;
        match self.await_ready(&handle).await {
            Ok(info) => {
                handle.set_connection_info(info);
                handle.set_state(ProcessState::Healthy);
                tracing::info!(pid = handle.pid(), "kernel process ready");
                Ok(handle)
            }
            Err(error) => {
                tracing::warn!(pid = handle.pid(), %error, "kernel process failed to start");
                self.stop(&mut handle).await;
                Err(error)
            }
        }
    }

    /// Polls until the readiness endpoint (if any) answers and the
    /// connection file is readable. Both phases share one attempt budget.
    async fn await_ready(&self, handle: &ProcessHandle) -> Result<ConnectionInfo, GatewayError> {
        let spec = handle.spec();
        let exited = || {
            handle.exit_status().map(|exit| {
                GatewayError::SpawnFailed(format!("kernel exited during startup with {exit}"))
            })
        };

        if let ReadinessPolicy::Grace(grace) = &spec.readiness {
            tokio::time::sleep(*grace).await;
            if let Some(error) = exited() {
                return Err(error);
            }
        }

        let endpoint_up = AtomicBool::new(!spec.readiness.has_endpoint());
        let (exited, endpoint_up) = (&exited, &endpoint_up);
        let path = spec.connection_file.as_path();
        let (info, attempts) = self
            .retry
            .poll(|_| async move {
                if let Some(error) = exited() {
                    return Probe::Abort(error);
                }
                if !endpoint_up.load(Ordering::Relaxed) {
                    if !self.endpoint_ready(&spec.readiness).await {
                        return Probe::NotReady;
                    }
                    tracing::debug!(readiness = ?spec.readiness, "kernel endpoint answered");
                    endpoint_up.store(true, Ordering::Relaxed);
                }
                match ConnectionInfo::load(path).await {
                    Ok(info) => Probe::Ready(info),
                    Err(_) => Probe::NotReady,
                }
            })
            .await?;
        tracing::debug!(attempts, path = %path.display(), "connection file read");
        Ok(info)
    }

    async fn endpoint_ready(&self, readiness: &ReadinessPolicy) -> bool {
        match readiness {
            ReadinessPolicy::Http(url) => matches!(
                self.http.get(url.as_str()).timeout(self.retry.interval).send().await,
                Ok(response) if response.status().is_success()
            ),
            ReadinessPolicy::Tcp(addr) => TcpStream::connect(addr.as_str()).await.is_ok(),
            ReadinessPolicy::ConnectionFile | ReadinessPolicy::Grace(_) => true,
        }
    }

    /// Replaces a crashed or unresponsive process, subject to the crash-loop
    /// budget. The old process is stopped first if it is still alive.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RestartBudgetExceeded`] when the failure
    /// completes a crash loop, or any [`Self::start`] error for the
    /// replacement.
    pub async fn restart(&self, handle: &mut ProcessHandle) -> Result<(), GatewayError> {
        let now = Instant::now();
        match handle.tracker.on_failure(handle.started_at(), now) {
            RestartDecision::GiveUp => {
                self.stop(handle).await;
                return Err(GatewayError::RestartBudgetExceeded {
                    restarts: handle.restart_count(),
                });
            }
            RestartDecision::RestartAfter(delay) => {
                handle.set_state(ProcessState::Restarting);
                self.stop(handle).await;
                tokio::time::sleep(delay).await;
            }
            RestartDecision::Restart => {
                handle.set_state(ProcessState::Restarting);
                self.stop(handle).await;
            }
        }

        let fresh = self
            .launch(handle.spec(), RestartTracker::new(self.restart))
            .await?;
        handle.replace(fresh);
        handle.tracker.record_restart(Instant::now());
        tracing::info!(
            pid = handle.pid(),
            restarts = handle.restart_count(),
            "kernel process restarted"
        );
        Ok(())
    }

    /// Sends SIGTERM, waits up to the stop timeout, then kills.
    pub async fn stop(&self, handle: &mut ProcessHandle) -> Option<ProcessExit> {
        if let Some(exit) = handle.exit_status() {
            handle.set_state(ProcessState::Stopped);
            return Some(exit);
        }
        if let Some(pid) = handle.pid().and_then(|pid| i32::try_from(pid).ok())
            && let Err(error) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
        {
            tracing::debug!(pid, %error, "SIGTERM failed");
        }
        let exit = match tokio::time::timeout(self.stop_timeout, handle.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                tracing::warn!(pid = handle.pid(), "kernel ignored SIGTERM, killing");
                handle.start_kill();
                handle.wait().await
            }
        };
        handle.set_state(ProcessState::Stopped);
        exit
    }
}
