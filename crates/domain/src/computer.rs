//! Computer-use wire protocol: browser-automation actions, safety checks
//! and observations. Actions are evaluated by the policy layer before
//! execution; every executed call produces an observation with a screenshot
//! and execution status.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComputerAction {
    Click {
        x: i32,
        y: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        button: Option<String>,
    },
    DoubleClick {
        x: i32,
        y: i32,
    },
    Type {
        x: i32,
        y: i32,
        text: String,
    },
    Scroll {
        scroll_dx: i32,
        scroll_dy: i32,
    },
    Keypress {
        keys: Vec<String>,
    },
    VisitUrl {
        url: String,
    },
    WebSearch {
        query: String,
    },
    Back,
    Wait {
        seconds: f64,
    },
    Terminate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
}

impl ComputerAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::DoubleClick { .. } => "double_click",
            Self::Type { .. } => "type",
            Self::Scroll { .. } => "scroll",
            Self::Keypress { .. } => "keypress",
            Self::VisitUrl { .. } => "visit_url",
            Self::WebSearch { .. } => "web_search",
            Self::Back => "back",
            Self::Wait { .. } => "wait",
            Self::Terminate { .. } => "terminate",
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::VisitUrl { url } => Some(url),
            _ => None,
        }
    }

    pub fn typed_text(&self) -> Option<&str> {
        match self {
            Self::Type { text, .. } => Some(text),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Safety checks & metadata
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSafetyCheck {
    pub id: String,
    pub category: String,
    pub severity: CheckSeverity,
    pub message: String,
}

impl PendingSafetyCheck {
    pub fn new(
        prefix: &str,
        category: impl Into<String>,
        severity: CheckSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("{prefix}_{}", Uuid::new_v4().simple()),
            category: category.into(),
            severity,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_summary: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub critical_point: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Computer call & observation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputerCall {
    pub call_id: String,
    pub action: ComputerAction,
    #[serde(default)]
    pub meta: CallMeta,
    #[serde(default)]
    pub pending_safety_checks: Vec<PendingSafetyCheck>,
}

impl ComputerCall {
    pub fn new(action: ComputerAction) -> Self {
        Self {
            call_id: new_call_id(),
            action,
            meta: CallMeta::default(),
            pending_safety_checks: Vec::new(),
        }
    }

    /// Ids are caller-supplied when non-empty and server-generated
    /// otherwise; once set they are never regenerated.
    pub fn ensure_call_id(&mut self) {
        if self.call_id.is_empty() {
            self.call_id = new_call_id();
        }
    }

    /// Trace-safe JSON: typed text is replaced by its SHA-256 digest.
    pub fn to_redacted_json(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "type": "computer_call",
            "call_id": self.call_id,
            "action": serde_json::to_value(&self.action).unwrap_or_default(),
            "meta": serde_json::to_value(&self.meta).unwrap_or_default(),
            "pending_safety_checks": serde_json::to_value(&self.pending_safety_checks)
                .unwrap_or_default(),
        });
        if let Some(text) = self.action.typed_text() {
            let digest = hex_digest(text);
            value["action"]["text"] = serde_json::Value::String("[REDACTED]".into());
            value["action"]["text_sha256"] = serde_json::Value::String(digest);
        }
        value
    }
}

pub fn new_call_id() -> String {
    format!("call_{}", &Uuid::new_v4().simple().to_string()[..12])
}

fn hex_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Viewport {
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExecutionResult {
    pub fn ok() -> Self {
        Self {
            status: ExecutionStatus::Ok,
            error_type: None,
            error_message: None,
        }
    }

    pub fn error(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            error_type: Some(error_type.into()),
            error_message: Some(message.into()),
        }
    }
}

/// The observation returned after executing a [`ComputerCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub call_id: String,
    pub url: String,
    pub viewport: Viewport,
    pub screenshot_b64: String,
    pub execution: ExecutionResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_tag_is_snake_case() {
        let action = ComputerAction::VisitUrl {
            url: "https://example.com".into(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "visit_url");
        assert_eq!(json["url"], "https://example.com");
    }

    #[test]
    fn action_round_trip() {
        let action = ComputerAction::Scroll {
            scroll_dx: 0,
            scroll_dy: 240,
        };
        let json = serde_json::to_string(&action).unwrap();
        let back: ComputerAction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn ensure_call_id_preserves_caller_ids() {
        let mut call = ComputerCall::new(ComputerAction::Back);
        call.call_id = "caller-chosen".into();
        call.ensure_call_id();
        assert_eq!(call.call_id, "caller-chosen");

        call.call_id = String::new();
        call.ensure_call_id();
        assert!(call.call_id.starts_with("call_"));
    }

    #[test]
    fn redaction_replaces_typed_text() {
        let call = ComputerCall::new(ComputerAction::Type {
            x: 10,
            y: 20,
            text: "hunter2".into(),
        });
        let redacted = call.to_redacted_json();
        assert_eq!(redacted["action"]["text"], "[REDACTED]");
        assert_eq!(
            redacted["action"]["text_sha256"].as_str().unwrap().len(),
            64
        );
        // Non-type actions are untouched.
        let plain = ComputerCall::new(ComputerAction::Back).to_redacted_json();
        assert!(plain["action"].get("text").is_none());
    }

    #[test]
    fn severity_ordering() {
        assert!(CheckSeverity::Medium >= CheckSeverity::Medium);
        assert!(CheckSeverity::High > CheckSeverity::Medium);
        assert!(CheckSeverity::Low < CheckSeverity::Medium);
    }

    #[test]
    fn execution_result_constructors() {
        assert_eq!(ExecutionResult::ok().status, ExecutionStatus::Ok);
        let err = ExecutionResult::error("navigation", "dns failure");
        assert_eq!(err.status, ExecutionStatus::Error);
        assert_eq!(err.error_type.as_deref(), Some("navigation"));
    }
}
