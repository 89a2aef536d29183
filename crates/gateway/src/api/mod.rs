//! HTTP API surface.
//!
//! - `/sandbox/sessions/…` — sandbox lifecycle (create, exec, files,
//!   snapshots, artifacts, heartbeat, screenshot)
//! - `/astra-control/sessions/…` — conversation CRUD, resume/cancel/
//!   message/upload_document and the SSE stream
//! - `/runs/:id/logs/stream` — request-scoped SSE stream

pub mod auth;
pub mod control;
pub mod sandbox;
pub mod stream;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use uuid::Uuid;

use af_domain::session::{Conversation, SandboxSession};
use af_domain::Error;

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn router(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        // ── Sandbox sessions ────────────────────────────────────────
        .route("/sandbox/sessions/", post(sandbox::create_session))
        .route("/sandbox/sessions", post(sandbox::create_session))
        .route(
            "/sandbox/sessions/:id/",
            get(sandbox::get_session).delete(sandbox::terminate_session),
        )
        .route(
            "/sandbox/sessions/:id",
            get(sandbox::get_session).delete(sandbox::terminate_session),
        )
        .route("/sandbox/sessions/:id/shell/", post(sandbox::exec_command))
        .route("/sandbox/sessions/:id/exec/", post(sandbox::exec_command))
        .route("/sandbox/sessions/:id/upload/", post(sandbox::upload_text))
        .route(
            "/sandbox/sessions/:id/files/upload",
            post(sandbox::upload_binary),
        )
        .route(
            "/sandbox/sessions/:id/files/content",
            get(sandbox::file_content),
        )
        .route(
            "/sandbox/sessions/:id/files/export",
            post(sandbox::export_file),
        )
        .route("/sandbox/sessions/:id/snapshot", post(sandbox::create_snapshot))
        .route(
            "/sandbox/sessions/:id/snapshots",
            post(sandbox::create_snapshot).get(sandbox::list_snapshots),
        )
        .route("/sandbox/sessions/:id/artifacts", get(sandbox::list_artifacts))
        .route("/sandbox/sessions/:id/heartbeat", post(sandbox::heartbeat))
        .route("/sandbox/sessions/:id/screenshot", get(sandbox::screenshot))
        // ── Conversations ───────────────────────────────────────────
        .route(
            "/astra-control/sessions/",
            post(control::create_conversation).get(control::list_conversations),
        )
        .route(
            "/astra-control/sessions",
            post(control::create_conversation).get(control::list_conversations),
        )
        .route("/astra-control/sessions/:id", get(control::get_conversation))
        .route("/astra-control/sessions/:id/", get(control::get_conversation))
        .route("/astra-control/sessions/:id/resume", post(control::resume))
        .route("/astra-control/sessions/:id/cancel", post(control::cancel))
        .route("/astra-control/sessions/:id/message", post(control::message))
        .route("/astra-control/sessions/:id/log_event", post(control::log_event))
        .route(
            "/astra-control/sessions/:id/upload_document",
            post(control::upload_document),
        )
        .route(
            "/astra-control/sessions/:id/stream",
            get(stream::conversation_stream),
        )
        // ── Request-scoped log stream ───────────────────────────────
        .route("/runs/:id/logs/stream", get(stream::run_log_stream))
        .route_layer(axum::middleware::from_fn_with_state(
            state,
            auth::require_api_key,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
}

async fn healthz() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared handler helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

/// Map a domain error onto an HTTP response.
pub(crate) fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Auth(_) => StatusCode::UNAUTHORIZED,
        Error::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        Error::SandboxNotReady(_) => StatusCode::CONFLICT,
        Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::Provision(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err.to_string())
}

/// Caller identity. Account management is external; the authenticated
/// caller names itself via `X-User-Id` and defaults to `local`.
pub(crate) fn caller_id(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or("local")
        .to_string()
}

/// Fetch a session, scoped to the caller. A session owned by someone else
/// is indistinguishable from a missing one.
pub(crate) fn owned_session(
    state: &AppState,
    id: &Uuid,
    headers: &HeaderMap,
) -> Result<SandboxSession, Response> {
    let caller = caller_id(headers);
    match state.manager.sessions().get(id) {
        Some(session) if session.user_id == caller => Ok(session),
        _ => Err(api_error(StatusCode::NOT_FOUND, "session not found")),
    }
}

/// Fetch a conversation, scoped to the caller.
pub(crate) fn owned_conversation(
    state: &AppState,
    id: &Uuid,
    headers: &HeaderMap,
) -> Result<Conversation, Response> {
    let caller = caller_id(headers);
    match state.conversations.get(id) {
        Some(conversation) if conversation.user_id == caller => Ok(conversation),
        _ => Err(api_error(StatusCode::NOT_FOUND, "session not found")),
    }
}
