//! Service layer: session orchestration.
//!
//! [`SessionRegistry`] owns one [`SessionHandle`] per notebook. Each session
//! runs as a single worker task that drives its kernel through a
//! [`KernelConnection`], orders execute requests and fans kernel output out
//! to subscribers.

pub mod backend;
pub mod session;
pub mod session_registry;
#[cfg(test)]
pub(crate) mod testing;

pub use backend::{
    KernelConnection, KernelInfo, KernelLauncher, KernelTemplate, SupervisedKernel,
    SupervisedLauncher,
};
pub use session::{ExecuteAccepted, SessionHandle, SessionSettings, SessionStatus};
pub use session_registry::SessionRegistry;
