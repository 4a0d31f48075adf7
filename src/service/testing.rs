//! In-memory kernel backend for session tests.

#![allow(clippy::panic)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::backend::{KernelConnection, KernelInfo, KernelLauncher};
use crate::domain::{PendingExecute, RequestId, SessionKey};
use crate::error::GatewayError;
use crate::kernel::{KernelMessage, LinkEventKind, LinkEventSender, MessageHeader};
use crate::supervisor::{ProcessExit, ProcessState};

/// Builds an IOPub `stream` message produced by `request_id`.
pub(crate) fn output(request_id: &str, text: &str) -> KernelMessage {
    KernelMessage::new(
        MessageHeader::new(uuid::Uuid::new_v4().to_string(), "stream", "fake"),
        Some(MessageHeader::new(request_id, "execute_request", "gateway")),
        json!({ "name": "stdout", "text": text }),
    )
}

/// Builds the IOPub `status: idle` message completing `request_id`.
pub(crate) fn idle_status(request_id: &str) -> KernelMessage {
    KernelMessage::new(
        MessageHeader::new(uuid::Uuid::new_v4().to_string(), "status", "fake"),
        Some(MessageHeader::new(request_id, "execute_request", "gateway")),
        json!({ "execution_state": "idle" }),
    )
}

#[derive(Debug, Default)]
struct FakeKernelState {
    executed: Vec<RequestId>,
    interrupts: u32,
    restarts: u32,
    shutdowns: u32,
    events: Option<LinkEventSender>,
    restart_error: Option<GatewayError>,
}

/// Test-side view of one fake kernel.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeKernelProbe(Arc<Mutex<FakeKernelState>>);

impl FakeKernelProbe {
    fn state(&self) -> MutexGuard<'_, FakeKernelState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn executed(&self) -> Vec<RequestId> {
        self.state().executed.clone()
    }

    pub(crate) fn interrupts(&self) -> u32 {
        self.state().interrupts
    }

    pub(crate) fn restarts(&self) -> u32 {
        self.state().restarts
    }

    pub(crate) fn shutdowns(&self) -> u32 {
        self.state().shutdowns
    }

    /// Event sender of the current kernel generation.
    pub(crate) fn events(&self) -> Option<LinkEventSender> {
        self.state().events.clone()
    }

    /// Makes the next restart fail with `error`.
    pub(crate) fn fail_restarts(&self, error: GatewayError) {
        self.state().restart_error = Some(error);
    }

    fn emit(&self, kind: LinkEventKind) {
        let Some(events) = self.events() else {
            panic!("fake kernel has no event sender");
        };
        events.emit(kind);
    }

    pub(crate) fn emit_output(&self, message: KernelMessage) {
        self.emit(LinkEventKind::Output(message));
    }

    pub(crate) fn emit_exit(&self, exit: ProcessExit) {
        self.emit(LinkEventKind::Exited(exit));
    }

    pub(crate) fn emit_unresponsive(&self, missed: u32) {
        self.emit(LinkEventKind::Unresponsive { missed });
    }
}

#[derive(Debug)]
struct FakeKernel(FakeKernelProbe);

#[async_trait]
impl KernelConnection for FakeKernel {
    async fn execute(&mut self, request: &PendingExecute) -> Result<(), GatewayError> {
        self.0.state().executed.push(request.request_id.clone());
        Ok(())
    }

    async fn interrupt(&mut self) -> Result<(), GatewayError> {
        self.0.state().interrupts += 1;
        Ok(())
    }

    async fn restart(&mut self, events: LinkEventSender) -> Result<(), GatewayError> {
        let mut state = self.0.state();
        if let Some(error) = state.restart_error.take() {
            return Err(error);
        }
        state.restarts += 1;
        state.events = Some(events);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.0.state().shutdowns += 1;
    }

    fn info(&self) -> KernelInfo {
        let state = self.0.state();
        KernelInfo {
            pid: Some(4242),
            state: ProcessState::Healthy,
            restart_count: state.restarts,
        }
    }
}

/// Launches [`FakeKernel`]s and keeps a probe for each.
#[derive(Debug, Default)]
pub(crate) struct FakeLauncher {
    delay: Duration,
    failure: Option<GatewayError>,
    launches: AtomicUsize,
    kernels: Mutex<Vec<FakeKernelProbe>>,
}

impl FakeLauncher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Each launch takes `delay`.
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Every launch fails with `error`.
    pub(crate) fn failing(error: GatewayError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Probe for the `index`-th launched kernel.
    pub(crate) fn kernel(&self, index: usize) -> FakeKernelProbe {
        let kernels = self.kernels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(probe) = kernels.get(index) else {
            panic!("kernel {index} was never launched");
        };
        probe.clone()
    }
}

#[async_trait]
impl KernelLauncher for FakeLauncher {
    async fn launch(
        &self,
        _key: &SessionKey,
        events: LinkEventSender,
    ) -> Result<Box<dyn KernelConnection>, GatewayError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let probe = FakeKernelProbe::default();
        probe.state().events = Some(events);
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(probe.clone());
        Ok(Box::new(FakeKernel(probe)))
    }
}
