//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::service::SessionRegistry;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Registry of all live kernel sessions.
    pub registry: Arc<SessionRegistry>,
    /// Loaded configuration.
    pub config: Arc<GatewayConfig>,
}
