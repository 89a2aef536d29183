//! Run dispatch — worker tasks for the graph driver and the event mirror.
//!
//! The controller is the only component that writes durable conversation
//! events: the driver publishes to the bus and the mirror task copies each
//! bus event into the persisted `events[]` until the terminal event lands.

pub mod session_lock;

use af_agent::RuntimeContext;
use af_domain::event::Event;

use crate::state::AppState;

/// Spawn a graph run for a conversation on a worker task, serialized per
/// session, with the event mirror attached first.
pub fn dispatch_run(state: &AppState, ctx: RuntimeContext, goal: String, is_resume: bool) {
    spawn_event_mirror(state, ctx.session_id);

    let driver = state.driver.clone();
    let locks = state.session_locks.clone();
    tokio::spawn(async move {
        let session_id = ctx.session_id;
        let _permit = locks.acquire(session_id).await;
        if let Err(e) = driver.run(ctx, &goal, is_resume).await {
            tracing::error!(session_id = %session_id, error = %e, "graph run failed");
        }
    });
}

/// Copy bus events into the conversation's durable event list. The
/// subscription ends after the terminal event, which also ends the task.
/// Backlog entries already persisted by an earlier mirror (re-dispatch of a
/// finished conversation) are skipped via the timestamp cursor.
pub fn spawn_event_mirror(state: &AppState, session_id: uuid::Uuid) {
    let bus = state.bus.clone();
    let conversations = state.conversations.clone();
    tokio::spawn(async move {
        let cursor = conversations.get(&session_id).and_then(|c| {
            c.events
                .last()
                .and_then(|e| e.get("ts"))
                .and_then(|ts| ts.as_str())
                .and_then(|ts| ts.parse::<chrono::DateTime<chrono::Utc>>().ok())
        });
        let mut sub = bus.subscribe(session_id);
        while let Some(event) = sub.next().await {
            if let Some(cutoff) = cursor {
                if event.ts <= cutoff {
                    continue;
                }
            }
            persist_event(&conversations, session_id, &event);
        }
    });
}

pub fn persist_event(
    conversations: &af_sandbox::ConversationStore,
    session_id: uuid::Uuid,
    event: &Event,
) {
    if let Ok(value) = serde_json::to_value(event) {
        conversations.update(&session_id, |c| {
            c.events.push(value);
        });
    }
}
