//! Server-Sent Events endpoints.
//!
//! Frame format: `event: message\ndata: <json>\n\n`. Every stream opens
//! with a `{type: "heartbeat", message: "stream_ready"}` handshake followed
//! by a status snapshot, drains the backlog, then delivers live events with
//! a heartbeat after every idle window. When the conversation reaches
//! `completed` or `failed` the status frame is emitted and the stream
//! closes. `Cache-Control: no-cache` and `X-Accel-Buffering: no` defeat
//! intermediary buffering.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use futures_core::Stream;
use uuid::Uuid;

use af_domain::session::ConversationStatus;

use crate::api::owned_conversation;
use crate::state::AppState;

fn frame(data: serde_json::Value) -> SseEvent {
    SseEvent::default().event("message").data(data.to_string())
}

fn sse_headers() -> [(HeaderName, &'static str); 2] {
    [
        (axum::http::header::CACHE_CONTROL, "no-cache"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /astra-control/sessions/:id/stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn conversation_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let conversation = match owned_conversation(&state, &id, &headers) {
        Ok(conversation) => conversation,
        Err(resp) => return resp,
    };

    let stream = event_stream(state, id, Some(conversation.status));
    (sse_headers(), Sse::new(stream)).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /runs/:id/logs/stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Request-scoped stream: same framing, no status polling — it ends when
/// the topic delivers its terminal event.
pub async fn run_log_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    let stream = event_stream(state, id, None);
    (sse_headers(), Sse::new(stream)).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream generator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn event_stream(
    state: AppState,
    session_id: Uuid,
    initial_status: Option<ConversationStatus>,
) -> impl Stream<Item = Result<SseEvent, std::convert::Infallible>> {
    let heartbeat = Duration::from_secs(state.config.events.heartbeat_sec.max(1));
    let poll_status = initial_status.is_some();

    async_stream::stream! {
        let mut sub = state.bus.subscribe(session_id);

        // Handshake, then the current status snapshot.
        yield Ok(frame(serde_json::json!({
            "type": "heartbeat",
            "message": "stream_ready",
        })));
        if let Some(status) = initial_status {
            yield Ok(frame(serde_json::json!({ "status": status })));
        }

        loop {
            tokio::select! {
                event = sub.next() => {
                    match event {
                        Some(event) => {
                            match serde_json::to_value(&event) {
                                Ok(value) => yield Ok(frame(value)),
                                Err(e) => {
                                    // Skip the malformed entry; never kill
                                    // the stream over one bad payload.
                                    tracing::warn!(error = %e, "skipping unserializable event");
                                    continue;
                                }
                            }
                            if event.is_terminal() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(heartbeat) => {
                    if poll_status {
                        // Poll the durable record: a terminal status emitted
                        // out-of-band (worker crash) still closes the stream
                        // with an explicit frame.
                        let status = state
                            .conversations
                            .get(&session_id)
                            .map(|c| c.status);
                        if let Some(status @ (ConversationStatus::Completed
                            | ConversationStatus::Failed)) = status
                        {
                            yield Ok(frame(serde_json::json!({ "status": status })));
                            break;
                        }
                    }
                    yield Ok(frame(serde_json::json!({ "type": "heartbeat" })));
                }
            }
        }
    }
}
