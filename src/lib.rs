//! # notebook-gateway
//!
//! HTTP and WebSocket session gateway for notebook compute kernels.
//!
//! Each notebook gets one long-lived kernel process. The gateway spawns and
//! supervises it, talks to it over the multipart kernel wire protocol, runs
//! execute requests one at a time in submission order, and fans the kernel's
//! output out to every connected viewer.
//!
//! ## Architecture
//!
//! ```text
//! Clients (HTTP, WebSocket)
//!     │
//!     ├── REST Handlers (api/)
//!     ├── WS Handler (ws/)
//!     │
//!     ├── SessionRegistry → session workers (service/)
//!     ├── ExecutionSequencer, Fanout (domain/)
//!     │
//!     ├── KernelLink, wire codec, heartbeat (kernel/)
//!     ├── ProcessSupervisor (supervisor/)
//!     │
//!     └── Channel over ZeroMQ sockets (transport/)
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod kernel;
pub mod service;
pub mod supervisor;
pub mod transport;
pub mod ws;

use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Builds the full HTTP and WebSocket router for `state`.
pub fn build_app(state: app_state::AppState) -> Router {
    Router::new()
        .merge(api::build_router())
        .route("/ws", get(ws::handler::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
