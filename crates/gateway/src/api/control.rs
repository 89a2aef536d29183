//! Conversation (agent run) endpoints.
//!
//! - `POST /astra-control/sessions/`                — create + dispatch; 201
//! - `GET  /astra-control/sessions/`                — list; 200
//! - `GET  /astra-control/sessions/:id`             — detail; 200
//! - `POST /astra-control/sessions/:id/resume`      — unblock a paused run; 200
//! - `POST /astra-control/sessions/:id/cancel`      — cooperative cancel; 200
//! - `POST /astra-control/sessions/:id/message`     — follow-up input; 200/202
//! - `POST /astra-control/sessions/:id/log_event`   — append an event; 200
//! - `POST /astra-control/sessions/:id/upload_document` — multipart; 201

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use af_agent::RuntimeContext;
use af_domain::event::{Event, EventKind};
use af_domain::session::{Conversation, ConversationStatus, UploadedDocument};
use af_events::{CANCEL_SENTINEL, USER_DONE_SENTINEL};

use crate::api::{api_error, caller_id, error_response, owned_conversation};
use crate::runtime::{dispatch_run, persist_event};
use crate::state::AppState;

const MAX_DOCUMENTS: usize = 5;
const MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;
const ALLOWED_EXTENSIONS: &[&str] = &[
    "pdf", "txt", "md", "csv", "json", "docx", "xlsx", "png", "jpg", "jpeg",
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /astra-control/sessions/
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CreateConversationBody {
    pub goal: String,
    /// Attach to an existing sandbox session instead of creating one.
    #[serde(default)]
    pub sandbox_session_id: Option<Uuid>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateConversationBody>,
) -> Response {
    if body.goal.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "goal is required");
    }
    let caller = caller_id(&headers);
    let workspace = body.workspace_id.clone().unwrap_or_else(|| caller.clone());

    if let Err(e) = state.quotas.charge_request(&workspace, Utc::now()) {
        return error_response(e);
    }

    // Auto-restore: seed the new sandbox from the caller's most recent
    // completed run, when it left a snapshot behind.
    let restore_snapshot_id = state
        .conversations
        .latest_completed_for_user(&caller)
        .and_then(|c| c.last_snapshot_id);

    let session = match body.sandbox_session_id {
        Some(existing) => match state.manager.sessions().get(&existing) {
            Some(session) if session.user_id == caller => session,
            _ => return api_error(StatusCode::NOT_FOUND, "sandbox session not found"),
        },
        None => {
            let active = state
                .manager
                .sessions()
                .count_active(Some(workspace.as_str()));
            if let Err(e) = state
                .quotas
                .charge_sandbox(&workspace, active, Utc::now())
            {
                return error_response(e);
            }
            if restore_snapshot_id.is_some() {
                tracing::info!(
                    snapshot_id = ?restore_snapshot_id,
                    "auto-restoring new conversation from latest snapshot"
                );
            }
            state.manager.create_session(
                &caller,
                Some(workspace.clone()),
                None,
                body.image.clone(),
                restore_snapshot_id,
            )
        }
    };

    let mut conversation = Conversation::new(session.id, &caller, &body.goal);
    conversation.workspace_id = Some(workspace);
    conversation.config = serde_json::json!({
        "image": session.image,
        "backend": session.backend,
    });
    let conversation_id = state.conversations.insert(conversation.clone());

    let mut ctx = RuntimeContext::new(session.id, &caller);
    ctx.workspace_id = conversation.workspace_id.clone();
    dispatch_run(&state, ctx, body.goal, false);

    let created = state
        .conversations
        .get(&conversation_id)
        .unwrap_or(conversation);
    (StatusCode::CREATED, Json(serde_json::json!(created))).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /astra-control/sessions/(:id)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let caller = caller_id(&headers);
    let conversations: Vec<_> = state
        .conversations
        .list()
        .into_iter()
        .filter(|c| c.user_id == caller)
        .collect();
    Json(serde_json::json!({
        "sessions": conversations,
        "count": conversations.len(),
    }))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    match owned_conversation(&state, &id, &headers) {
        Ok(conversation) => Json(serde_json::json!(conversation)).into_response(),
        Err(resp) => resp,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /astra-control/sessions/:id/resume
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn resume(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = owned_conversation(&state, &id, &headers) {
        return resp;
    }
    state.inbox.push(id, USER_DONE_SENTINEL);
    Json(serde_json::json!({ "status": "resume signal sent" })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /astra-control/sessions/:id/cancel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let conversation = match owned_conversation(&state, &id, &headers) {
        Ok(conversation) => conversation,
        Err(resp) => return resp,
    };
    if !matches!(
        conversation.status,
        ConversationStatus::Running | ConversationStatus::Paused | ConversationStatus::Created
    ) {
        return api_error(StatusCode::BAD_REQUEST, "session not running");
    }
    state.conversations.update(&id, |c| {
        c.status = ConversationStatus::Cancelled;
    });
    // Unblock a possible interrupt wait.
    state.inbox.push(id, CANCEL_SENTINEL);
    Json(serde_json::json!({ "status": "cancel signal sent" })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /astra-control/sessions/:id/message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

pub async fn message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<MessageBody>,
) -> Response {
    let conversation = match owned_conversation(&state, &id, &headers) {
        Ok(conversation) => conversation,
        Err(resp) => return resp,
    };
    if body.message.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "message is required");
    }

    // The human message is both durable and visible on the live stream.
    let event = Event::new(id, EventKind::HumanInput).with_message(body.message.clone());
    persist_event(&state.conversations, id, &event);
    state.bus.publish(event);

    match conversation.status {
        ConversationStatus::Paused => {
            state.inbox.push(id, body.message);
            Json(serde_json::json!({ "status": "message sent to paused session" }))
                .into_response()
        }
        status if status.is_terminal() => {
            state.conversations.update(&id, |c| {
                c.status = ConversationStatus::Running;
                c.goal = body.message.clone();
            });
            let caller = caller_id(&headers);
            let mut ctx = RuntimeContext::new(conversation.session_id, &caller);
            ctx.workspace_id = conversation.workspace_id.clone();
            dispatch_run(&state, ctx, body.message, true);
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "status": "session restarted with new message" })),
            )
                .into_response()
        }
        _ => api_error(StatusCode::BAD_REQUEST, "session is busy"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /astra-control/sessions/:id/log_event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct LogEventBody {
    #[serde(default)]
    pub event: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<ConversationStatus>,
}

pub async fn log_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<LogEventBody>,
) -> Response {
    if let Err(resp) = owned_conversation(&state, &id, &headers) {
        return resp;
    }
    state.conversations.update(&id, |c| {
        if let Some(status) = body.status {
            c.status = status;
        }
        if let Some(event) = body.event.clone() {
            c.events.push(event);
        }
    });
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /astra-control/sessions/:id/upload_document
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn extension_of(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

pub async fn upload_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let conversation = match owned_conversation(&state, &id, &headers) {
        Ok(conversation) => conversation,
        Err(resp) => return resp,
    };
    if conversation.documents.len() >= MAX_DOCUMENTS {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("maximum {MAX_DOCUMENTS} documents per session"),
        );
    }

    let mut filename = None;
    let mut content_type = String::new();
    let mut description = String::new();
    let mut bytes: Option<Vec<u8>> = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().map(String::from);
        match name.as_deref() {
            Some("file") => {
                filename = field.file_name().map(String::from);
                content_type = field.content_type().unwrap_or("").to_string();
                match field.bytes().await {
                    Ok(data) => bytes = Some(data.to_vec()),
                    Err(e) => {
                        return api_error(
                            StatusCode::BAD_REQUEST,
                            format!("unreadable file field: {e}"),
                        )
                    }
                }
            }
            Some("description") => {
                description = field.text().await.unwrap_or_default();
            }
            _ => {}
        }
    }

    let (Some(filename), Some(bytes)) = (filename, bytes) else {
        return api_error(StatusCode::BAD_REQUEST, "multipart 'file' field is required");
    };
    if bytes.len() > MAX_DOCUMENT_BYTES {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("file exceeds {} MiB", MAX_DOCUMENT_BYTES / (1024 * 1024)),
        );
    }
    match extension_of(&filename) {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => {}
        _ => {
            return api_error(
                StatusCode::BAD_REQUEST,
                format!("file type not allowed; accepted: {ALLOWED_EXTENSIONS:?}"),
            )
        }
    }

    let sandbox_path = format!("/workspace/uploads/{filename}");
    if let Err(e) = state
        .manager
        .upload(&conversation.session_id, &sandbox_path, &bytes)
        .await
    {
        return error_response(e);
    }

    let document = UploadedDocument {
        filename: filename.clone(),
        sandbox_path: sandbox_path.clone(),
        description: description.clone(),
        size_bytes: bytes.len() as u64,
        content_type,
        uploaded_at: Utc::now(),
    };
    state.conversations.update(&id, |c| {
        c.documents.push(document.clone());
    });

    let event = Event::new(id, EventKind::DocumentUploaded).with_payload(serde_json::json!({
        "filename": filename,
        "path": sandbox_path,
        "description": description,
    }));
    persist_event(&state.conversations, id, &event);
    state.bus.publish(event);

    // A paused run resumes with a notification naming the new file.
    if conversation.status == ConversationStatus::Paused {
        let mut notification = format!("New document uploaded: {filename}");
        if !description.is_empty() {
            notification.push_str(&format!(" - {description}"));
        }
        notification.push_str(&format!("\nPath: {sandbox_path}"));

        let event = Event::new(id, EventKind::HumanInput).with_message(notification.clone());
        persist_event(&state.conversations, id, &event);
        state.bus.publish(event);
        state.inbox.push(id, notification);

        return (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "status": "success",
                "message": "Document uploaded and session resumed",
                "document": document,
            })),
        )
            .into_response();
    }

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "status": "success",
            "message": "Document uploaded successfully",
            "document": document,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_allowlist() {
        assert_eq!(extension_of("report.PDF").as_deref(), Some("pdf"));
        assert_eq!(extension_of("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension_of("noext"), None);
        assert!(ALLOWED_EXTENSIONS.contains(&"pdf"));
        assert!(!ALLOWED_EXTENSIONS.contains(&"exe"));
    }
}
