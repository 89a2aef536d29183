//! Sandbox session endpoints.
//!
//! - `POST   /sandbox/sessions/`              — create + provision; 201
//! - `GET    /sandbox/sessions/:id/`          — detail; 200
//! - `DELETE /sandbox/sessions/:id/`          — terminate; 204
//! - `POST   /sandbox/sessions/:id/shell/`    — exec (alias `/exec/`); 200
//! - `POST   /sandbox/sessions/:id/upload/`   — write a text file; 200
//! - `POST   /sandbox/sessions/:id/files/upload`  — raw binary upload; 200
//! - `GET    /sandbox/sessions/:id/files/content` — stream file bytes; 200
//! - `POST   /sandbox/sessions/:id/files/export`  — register artifact; 201
//! - `POST   /sandbox/sessions/:id/snapshot(s)`   — create snapshot; 201
//! - `GET    /sandbox/sessions/:id/snapshots`     — list; 200
//! - `GET    /sandbox/sessions/:id/artifacts`     — list; 200
//! - `POST   /sandbox/sessions/:id/heartbeat`     — touch heartbeat; 200
//! - `GET    /sandbox/sessions/:id/screenshot`    — PNG (1×1 placeholder on failure)

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use uuid::Uuid;

use af_domain::session::SandboxBackend;
use af_sandbox::snapshot::SnapshotOptions;

use crate::api::{api_error, caller_id, error_response, owned_session};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sandbox/sessions/
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize, Default)]
pub struct CreateSessionBody {
    #[serde(default)]
    pub image: Option<String>,
    /// `local` or `cluster`.
    #[serde(default)]
    pub mode: Option<SandboxBackend>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub restore_snapshot_id: Option<Uuid>,
    #[serde(default)]
    pub idle_timeout_sec: Option<u64>,
    #[serde(default)]
    pub max_lifetime_sec: Option<u64>,
}

pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<CreateSessionBody>>,
) -> Response {
    let Json(body) = body.unwrap_or_default();
    let caller = caller_id(&headers);
    let workspace = body.workspace_id.clone().unwrap_or_else(|| caller.clone());

    let active = state
        .manager
        .sessions()
        .count_active(Some(workspace.as_str()));
    if let Err(e) = state
        .quotas
        .charge_sandbox(&workspace, active, chrono::Utc::now())
    {
        return error_response(e);
    }

    let session = state.manager.create_session(
        &caller,
        Some(workspace),
        body.mode,
        body.image,
        body.restore_snapshot_id,
    );
    if let Some(idle) = body.idle_timeout_sec {
        state.manager.sessions().update(&session.id, |s| {
            s.idle_timeout_sec = Some(idle);
        });
    }
    if let Some(max) = body.max_lifetime_sec {
        state.manager.sessions().update(&session.id, |s| {
            s.max_lifetime_sec = Some(max);
            s.expires_at = None;
            s.ensure_expiry();
        });
    }

    // Provision now; retriable failures get exactly one retry.
    let provisioned = match state.manager.provision(&session.id).await {
        Ok(session) => session,
        Err(e) if e.is_retriable() => match state.manager.provision(&session.id).await {
            Ok(session) => session,
            Err(e) => return error_response(e),
        },
        Err(e) => return error_response(e),
    };

    (StatusCode::CREATED, Json(serde_json::json!(provisioned))).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET / DELETE /sandbox/sessions/:id/
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    match owned_session(&state, &id, &headers) {
        Ok(session) => Json(serde_json::json!(session)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn terminate_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = owned_session(&state, &id, &headers) {
        return resp;
    }
    match state.manager.terminate(&id, Some("api_delete")).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sandbox/sessions/:id/shell/ (alias /exec/)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ExecBody {
    /// Either a rendered command string…
    #[serde(default)]
    pub command: Option<String>,
    /// …or an argv vector.
    #[serde(default)]
    pub argv: Option<Vec<String>>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
}

pub async fn exec_command(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<ExecBody>,
) -> Response {
    if let Err(resp) = owned_session(&state, &id, &headers) {
        return resp;
    }
    let command = match (&body.command, &body.argv) {
        (Some(command), _) if !command.is_empty() => command.clone(),
        (_, Some(argv)) if !argv.is_empty() => argv
            .iter()
            .map(|part| af_sandbox::runtime::shell_quote(part))
            .collect::<Vec<_>>()
            .join(" "),
        _ => return api_error(StatusCode::BAD_REQUEST, "command or argv is required"),
    };

    match state
        .manager
        .execute(&id, &command, body.cwd.as_deref(), body.timeout_sec, None)
        .await
    {
        Ok(out) => Json(serde_json::json!({
            "exit_code": out.exit_code,
            "stdout": out.stdout,
            "stderr": out.stderr,
            "duration_sec": out.duration_sec,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File transfer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct UploadTextBody {
    pub path: String,
    pub content: String,
}

pub async fn upload_text(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<UploadTextBody>,
) -> Response {
    if let Err(resp) = owned_session(&state, &id, &headers) {
        return resp;
    }
    match state
        .manager
        .upload(&id, &body.path, body.content.as_bytes())
        .await
    {
        Ok(()) => Json(serde_json::json!({ "status": "ok", "path": body.path })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

pub async fn upload_binary(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = owned_session(&state, &id, &headers) {
        return resp;
    }
    match state.manager.upload(&id, &query.path, &body).await {
        Ok(()) => Json(serde_json::json!({
            "status": "ok",
            "path": query.path,
            "size_bytes": body.len(),
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn file_content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = owned_session(&state, &id, &headers) {
        return resp;
    }
    match state.manager.read_file(&id, &query.path).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ExportBody {
    pub path: String,
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

pub async fn export_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<ExportBody>,
) -> Response {
    if let Err(resp) = owned_session(&state, &id, &headers) {
        return resp;
    }
    match state
        .manager
        .export_file(&id, &body.path, &body.filename, body.content_type.as_deref())
        .await
    {
        Ok(artifact) => (StatusCode::CREATED, Json(serde_json::json!(artifact))).into_response(),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshots & artifacts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize, Default)]
pub struct SnapshotBody {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

pub async fn create_snapshot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Option<Json<SnapshotBody>>,
) -> Response {
    if let Err(resp) = owned_session(&state, &id, &headers) {
        return resp;
    }
    let Json(body) = body.unwrap_or_default();
    match state
        .manager
        .snapshot(
            &id,
            SnapshotOptions {
                label: body.label,
                include_paths: body.include_paths,
                exclude_paths: body.exclude_paths,
            },
        )
        .await
    {
        Ok(snapshot) => (StatusCode::CREATED, Json(serde_json::json!(snapshot))).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_snapshots(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = owned_session(&state, &id, &headers) {
        return resp;
    }
    let snapshots = state.manager.snapshots().list_for_session(&id);
    Json(serde_json::json!({
        "snapshots": snapshots,
        "count": snapshots.len(),
    }))
    .into_response()
}

pub async fn list_artifacts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = owned_session(&state, &id, &headers) {
        return resp;
    }
    let artifacts = state.manager.artifacts().list_for_session(&id);
    Json(serde_json::json!({
        "artifacts": artifacts,
        "count": artifacts.len(),
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Heartbeat & screenshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = owned_session(&state, &id, &headers) {
        return resp;
    }
    match state.manager.heartbeat(&id) {
        Ok(session) => Json(serde_json::json!({
            "status": "ok",
            "last_heartbeat_at": session.last_heartbeat_at,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// 1×1 transparent PNG, served when real capture is unavailable.
const PLACEHOLDER_PNG_B64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

pub async fn screenshot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = owned_session(&state, &id, &headers) {
        return resp;
    }
    let bytes = match state.manager.capture_screenshot(&id).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(session_id = %id, error = %e, "screenshot fell back to placeholder");
            BASE64.decode(PLACEHOLDER_PNG_B64).unwrap_or_default()
        }
    };
    ([(header::CONTENT_TYPE, "image/png")], bytes).into_response()
}
