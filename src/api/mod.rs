//! REST API layer: route handlers, DTOs, and router composition.
//!
//! Session endpoints are mounted under `/api/v1`. With the `swagger-ui`
//! feature the OpenAPI document is served at `/api-docs/openapi.json` and
//! browsable at `/swagger-ui`.

pub mod dto;
pub mod handlers;

use axum::Router;
use utoipa::OpenApi;

use crate::app_state::AppState;

/// OpenAPI document for the REST surface.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "notebook-gateway",
        description = "HTTP and WebSocket gateway for notebook compute kernels"
    ),
    paths(
        handlers::system::health_handler,
        handlers::session::list_sessions,
        handlers::session::open_session,
        handlers::session::get_session,
        handlers::session::close_session,
        handlers::session::execute,
        handlers::session::interrupt,
    ),
    components(schemas(
        handlers::system::HealthResponse,
        dto::SessionStatusDto,
        dto::KernelStatusDto,
        dto::SessionListResponse,
        dto::ExecuteRequest,
        dto::ExecuteResponse,
        crate::error::ErrorResponse,
        crate::error::ErrorBody,
        crate::supervisor::ProcessState,
    )),
    tags(
        (name = "System", description = "Service health"),
        (name = "Sessions", description = "Kernel session lifecycle and execution"),
    )
)]
pub struct ApiDoc;

/// Builds the complete API router with all REST endpoints.
pub fn build_router() -> Router<AppState> {
    let router = Router::new()
        .nest("/api/v1", handlers::routes())
        .merge(handlers::system::routes());

    #[cfg(feature = "swagger-ui")]
    let router = router.merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger-ui")
            .url("/api-docs/openapi.json", ApiDoc::openapi()),
    );

    router
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_session_paths() {
        let doc = ApiDoc::openapi();
        for path in [
            "/health",
            "/api/v1/sessions",
            "/api/v1/sessions/{key}",
            "/api/v1/sessions/{key}/execute",
            "/api/v1/sessions/{key}/interrupt",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
