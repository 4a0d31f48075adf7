//! Session handlers: open, list, status, close, execute, interrupt.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::dto::{ExecuteRequest, ExecuteResponse, SessionListResponse, SessionStatusDto};
use crate::app_state::AppState;
use crate::domain::SessionKey;
use crate::error::{ErrorResponse, GatewayError};

/// `GET /sessions` — List running sessions.
#[utoipa::path(
    get,
    path = "/api/v1/sessions",
    tag = "Sessions",
    summary = "List sessions",
    description = "Returns the status of every running session, ordered by key.",
    responses(
        (status = 200, description = "Session list", body = SessionListResponse),
    )
)]
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let data: Vec<SessionStatusDto> = state
        .registry
        .list()
        .await
        .into_iter()
        .map(SessionStatusDto::from)
        .collect();
    let total = data.len();
    Json(SessionListResponse { data, total })
}

/// `PUT /sessions/{key}` — Get or create a session.
///
/// # Errors
///
/// Returns [`GatewayError::StartupTimeout`] or [`GatewayError::SpawnFailed`]
/// if the kernel could not be started.
#[utoipa::path(
    put,
    path = "/api/v1/sessions/{key}",
    tag = "Sessions",
    summary = "Open a session",
    description = "Returns the session for the key, starting a kernel and waiting for readiness if none is running.",
    params(
        ("key" = String, Path, description = "Session key"),
    ),
    responses(
        (status = 200, description = "Session ready", body = SessionStatusDto),
        (status = 400, description = "Invalid session key", body = ErrorResponse),
        (status = 503, description = "Kernel failed to start", body = ErrorResponse),
    )
)]
pub async fn open_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let key = SessionKey::new(key)?;
    let handle = state.registry.get_or_create(&key).await?;
    let status = handle.status().await?;
    Ok(Json(SessionStatusDto::from(status)))
}

/// `GET /sessions/{key}` — Session status.
///
/// # Errors
///
/// Returns [`GatewayError::SessionNotFound`] if no session is running.
#[utoipa::path(
    get,
    path = "/api/v1/sessions/{key}",
    tag = "Sessions",
    summary = "Get session status",
    description = "Returns kernel state, generation, subscriber count and execution queue of a session.",
    params(
        ("key" = String, Path, description = "Session key"),
    ),
    responses(
        (status = 200, description = "Session status", body = SessionStatusDto),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "Session still starting", body = ErrorResponse),
    )
)]
pub async fn get_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let key = SessionKey::new(key)?;
    let status = state.registry.status(&key).await?;
    Ok(Json(SessionStatusDto::from(status)))
}

/// `DELETE /sessions/{key}` — Close a session.
///
/// # Errors
///
/// Returns [`GatewayError::SessionStarting`] while the kernel is starting.
#[utoipa::path(
    delete,
    path = "/api/v1/sessions/{key}",
    tag = "Sessions",
    summary = "Close a session",
    description = "Interrupts running code, stops the kernel and notifies subscribers. Closing an unknown session succeeds.",
    params(
        ("key" = String, Path, description = "Session key"),
    ),
    responses(
        (status = 204, description = "Session closed"),
        (status = 409, description = "Session still starting", body = ErrorResponse),
    )
)]
pub async fn close_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let key = SessionKey::new(key)?;
    state.registry.close(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /sessions/{key}/execute` — Submit code.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] for a duplicate request id or a
/// full queue, or a startup error if the session had to be created.
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{key}/execute",
    tag = "Sessions",
    summary = "Execute code",
    description = "Queues code for execution. Output is delivered to WebSocket subscribers of the session, correlated by request id.",
    params(
        ("key" = String, Path, description = "Session key"),
    ),
    request_body = ExecuteRequest,
    responses(
        (status = 202, description = "Execution accepted", body = ExecuteResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 503, description = "Kernel failed to start", body = ErrorResponse),
    )
)]
pub async fn execute(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let key = SessionKey::new(key)?;
    let request_id = req.request_id()?;
    let accepted = state
        .registry
        .submit_execute(&key, req.code, request_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ExecuteResponse::from(accepted))))
}

/// `POST /sessions/{key}/interrupt` — Interrupt the running execution.
///
/// # Errors
///
/// Returns [`GatewayError::SessionNotFound`] if no session is running.
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{key}/interrupt",
    tag = "Sessions",
    summary = "Interrupt execution",
    description = "Sends an interrupt to the kernel on its control channel, bypassing the execution queue.",
    params(
        ("key" = String, Path, description = "Session key"),
    ),
    responses(
        (status = 202, description = "Interrupt sent"),
        (status = 404, description = "Session not found", body = ErrorResponse),
    )
)]
pub async fn interrupt(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let key = SessionKey::new(key)?;
    state.registry.interrupt(&key).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Session routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route(
            "/sessions/{key}",
            get(get_session).put(open_session).delete(close_session),
        )
        .route("/sessions/{key}/execute", post(execute))
        .route("/sessions/{key}/interrupt", post(interrupt))
}
