//! The per-session event vocabulary.
//!
//! Every progress signal in the system — agent output, tool brackets, human
//! messages, interrupts, terminal transitions — is one of these records,
//! published onto the session's bus topic and mirrored into the durable
//! conversation log. Within a session events are totally ordered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event kind
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    Command,
    Log,
    ToolStart,
    ToolResult,
    ToolArtifact,
    AssistantMessage,
    UserMessage,
    HumanInput,
    DocumentUploaded,
    Interrupt,
    PolicyDecision,
    Completed,
    Error,
    Heartbeat,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub session_id: Uuid,
    pub ts: DateTime<Utc>,
}

impl Event {
    pub fn new(session_id: Uuid, kind: EventKind) -> Self {
        Self {
            kind,
            stage: None,
            message: None,
            payload: None,
            session_id,
            ts: Utc::now(),
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    // ── Canonical constructors ───────────────────────────────────────

    pub fn status(session_id: Uuid, status: impl Into<String>) -> Self {
        Self::new(session_id, EventKind::Status)
            .with_payload(serde_json::json!({ "status": status.into() }))
    }

    pub fn log(session_id: Uuid, line: impl Into<String>) -> Self {
        Self::new(session_id, EventKind::Log).with_message(line)
    }

    pub fn error(session_id: Uuid, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(session_id, EventKind::Error)
            .with_stage(stage)
            .with_message(message)
    }

    pub fn heartbeat(session_id: Uuid) -> Self {
        Self::new(session_id, EventKind::Heartbeat)
    }

    pub fn stream_ready(session_id: Uuid) -> Self {
        Self::new(session_id, EventKind::Heartbeat).with_message("stream_ready")
    }

    pub fn tool_start(
        session_id: Uuid,
        tool_call_id: &str,
        tool_name: &str,
        args: serde_json::Value,
    ) -> Self {
        Self::new(session_id, EventKind::ToolStart).with_payload(serde_json::json!({
            "tool_call_id": tool_call_id,
            "tool_name": tool_name,
            "args": args,
        }))
    }

    pub fn tool_result(
        session_id: Uuid,
        tool_call_id: &str,
        tool_name: &str,
        output: &str,
        artifacts: Option<serde_json::Value>,
    ) -> Self {
        let mut payload = serde_json::json!({
            "tool_call_id": tool_call_id,
            "tool_name": tool_name,
            "output": output,
        });
        if let Some(artifacts) = artifacts {
            payload["artifacts"] = artifacts;
        }
        Self::new(session_id, EventKind::ToolResult).with_payload(payload)
    }

    pub fn interrupt(session_id: Uuid, description: &str) -> Self {
        Self::new(session_id, EventKind::Interrupt).with_payload(serde_json::json!({
            "action": "wait_for_user",
            "description": description,
            "timestamp": Utc::now().timestamp_millis(),
        }))
    }

    pub fn completed(session_id: Uuid, summary: impl Into<String>) -> Self {
        Self::new(session_id, EventKind::Completed).with_payload(serde_json::json!({
            "is_finished": true,
            "summary": summary.into(),
        }))
    }

    /// Terminal for bus subscribers: either an explicit `completed` event or
    /// a `status` event carrying a terminal conversation status.
    pub fn is_terminal(&self) -> bool {
        match self.kind {
            EventKind::Completed => true,
            EventKind::Status => self
                .payload
                .as_ref()
                .and_then(|p| p.get("status"))
                .and_then(|s| s.as_str())
                .map(|s| {
                    matches!(s, "completed" | "failed" | "cancelled" | "blocked_policy")
                })
                .unwrap_or(false),
            _ => false,
        }
    }
}
