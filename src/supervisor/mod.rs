//! Kernel process supervision.
//!
//! [`ProcessSupervisor`] launches a kernel from a [`ProcessSpec`], polls it
//! for readiness under a bounded [`RetryPolicy`], restarts it after a crash
//! unless the [`RestartPolicy`] detects a crash loop, and stops it with
//! SIGTERM followed by a kill.

pub mod policy;
pub mod process;
#[allow(clippy::module_inception)]
pub mod supervisor;

pub use policy::{
    Probe, ReadinessPolicy, RestartDecision, RestartPolicy, RestartTracker, RetryPolicy,
};
pub use process::{ProcessExit, ProcessHandle, ProcessSpec, ProcessState, wait_exit};
pub use supervisor::ProcessSupervisor;
