//! Session, snapshot, artifact and conversation aggregates.
//!
//! The `SandboxSession` is the central record: one isolated container-backed
//! execution environment owned by one user. Conversations bind an agent run
//! to a session (1:1 by default) and may outlive it in a terminal state.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime descriptor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackend {
    Local,
    Cluster,
}

impl Default for SandboxBackend {
    fn default() -> Self {
        Self::Local
    }
}

/// CPU/memory/storage limits, expressed as runtime-native strings
/// (e.g. `"1.5"` CPUs, `"512m"` memory).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_storage: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Ready,
    Failed,
    Terminated,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Valid transitions: `starting → ready | failed`,
    /// `ready | failed → terminated`, and `failed → ready` (a successful
    /// reprovision revives a failed session). No exit from `terminated`.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Ready)
                | (Self::Starting, Self::Failed)
                | (Self::Starting, Self::Terminated)
                | (Self::Ready, Self::Terminated)
                | (Self::Failed, Self::Ready)
                | (Self::Failed, Self::Terminated)
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const METADATA_LATEST_SNAPSHOT: &str = "latest_snapshot_id";
pub const METADATA_TERMINATED_REASON: &str = "terminated_reason";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSession {
    pub id: Uuid,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub backend: SandboxBackend,
    pub image: String,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_profile: Option<String>,
    pub status: SessionStatus,
    /// Runtime handle: `local://<name>` or `cluster://<namespace>/<pod>`.
    #[serde(default)]
    pub backend_ref: String,
    /// Where the in-sandbox daemon is reachable (exec ref or HTTP URL).
    #[serde(default)]
    pub control_endpoint: String,
    pub workspace_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_snapshot_id: Option<Uuid>,
    pub idle_timeout_sec: Option<u64>,
    pub max_lifetime_sec: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_base_url: Option<String>,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub cpu_seconds: f64,
    #[serde(default)]
    pub storage_bytes: u64,
}

impl SandboxSession {
    pub fn new(user_id: impl Into<String>, backend: SandboxBackend, image: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            workspace_id: None,
            backend,
            image: image.into(),
            limits: ResourceLimits::default(),
            network_policy: None,
            security_profile: None,
            status: SessionStatus::Starting,
            backend_ref: String::new(),
            control_endpoint: String::new(),
            workspace_path: "/workspace".into(),
            restore_snapshot_id: None,
            idle_timeout_sec: Some(300),
            max_lifetime_sec: Some(3600),
            created_at: Utc::now(),
            last_activity_at: None,
            last_heartbeat_at: None,
            expires_at: None,
            artifact_base_url: None,
            error_message: String::new(),
            metadata: HashMap::new(),
            cpu_seconds: 0.0,
            storage_bytes: 0,
        }
    }

    /// Touch both activity timestamps (any command execution counts).
    pub fn mark_activity(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = Some(now);
        self.last_heartbeat_at = Some(now);
    }

    /// Touch only the heartbeat; activity is backfilled if never set so
    /// `last_activity_at >= last_heartbeat_at` never inverts for idle math.
    pub fn mark_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat_at = Some(now);
        if self.last_activity_at.is_none() {
            self.last_activity_at = Some(now);
        }
    }

    /// The most recent sign of life, used by the reaper's idle check.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_activity_at
            .or(self.last_heartbeat_at)
            .unwrap_or(self.created_at)
    }

    /// Compute `expires_at` from `max_lifetime_sec` if not already pinned.
    pub fn ensure_expiry(&mut self) {
        if self.expires_at.is_none() {
            if let Some(max) = self.max_lifetime_sec {
                self.expires_at = Some(self.created_at + Duration::seconds(max as i64));
            }
        }
    }

    pub fn latest_snapshot_id(&self) -> Option<Uuid> {
        self.metadata
            .get(METADATA_LATEST_SNAPSHOT)
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn set_latest_snapshot_id(&mut self, id: Uuid) {
        self.metadata.insert(
            METADATA_LATEST_SNAPSHOT.into(),
            serde_json::Value::String(id.to_string()),
        );
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An immutable compressed archive of selected workspace paths. A snapshot
/// is complete when either `archive_path` refers to an existing tar in the
/// sandbox or `object_store_key` resolves remotely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub session_id: Uuid,
    #[serde(default)]
    pub label: String,
    /// In-sandbox archive path (`<workspace>/.sandbox-snapshots/<id>.tar.gz`).
    pub archive_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_store_key: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Artifact
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A file promoted out of a session and given a stable download URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub session_id: Uuid,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Path inside the sandbox or remote storage key.
    pub storage_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation (agent run bound to a session)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    BlockedPolicy,
    AwaitingAck,
}

impl ConversationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::BlockedPolicy
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    Todo,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub title: String,
    pub description: String,
    pub status: PlanStepStatus,
}

/// A document uploaded into the session workspace, visible to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedDocument {
    pub filename: String,
    pub sandbox_path: String,
    #[serde(default)]
    pub description: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub content_type: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    /// The sandbox session this run executes in (same id for the default
    /// 1:1 binding).
    pub session_id: Uuid,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub status: ConversationStatus,
    pub goal: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub plan_steps: Vec<PlanStep>,
    #[serde(default)]
    pub summary: String,
    /// Append-only ordered event log mirrored from the bus.
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
    #[serde(default)]
    pub documents: Vec<UploadedDocument>,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_snapshot_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(session_id: Uuid, user_id: impl Into<String>, goal: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: session_id,
            session_id,
            user_id: user_id.into(),
            workspace_id: None,
            status: ConversationStatus::Created,
            goal: goal.into(),
            plan: String::new(),
            plan_steps: Vec::new(),
            summary: String::new(),
            events: Vec::new(),
            documents: Vec::new(),
            config: serde_json::Value::Null,
            last_snapshot_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_walk_is_monotone() {
        use SessionStatus::*;
        assert!(Starting.can_transition_to(Ready));
        assert!(Starting.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Terminated));
        assert!(Failed.can_transition_to(Terminated));
        // Reprovision revives a failed session.
        assert!(Failed.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Starting));
        assert!(!Ready.can_transition_to(Failed));
        // Terminated is absorbing.
        assert!(!Terminated.can_transition_to(Ready));
        assert!(!Terminated.can_transition_to(Starting));
    }

    #[test]
    fn expiry_derived_from_max_lifetime() {
        let mut session = SandboxSession::new("u1", SandboxBackend::Local, "demo:latest");
        session.max_lifetime_sec = Some(3600);
        session.ensure_expiry();
        let expires = session.expires_at.unwrap();
        assert_eq!(expires, session.created_at + Duration::seconds(3600));

        // Pinned expiry is not recomputed.
        session.max_lifetime_sec = Some(60);
        session.ensure_expiry();
        assert_eq!(session.expires_at.unwrap(), expires);
    }

    #[test]
    fn heartbeat_backfills_activity() {
        let mut session = SandboxSession::new("u1", SandboxBackend::Local, "demo:latest");
        let now = Utc::now();
        session.mark_heartbeat(now);
        assert_eq!(session.last_activity_at, Some(now));
        assert_eq!(session.last_heartbeat_at, Some(now));
    }

    #[test]
    fn last_seen_prefers_activity() {
        let mut session = SandboxSession::new("u1", SandboxBackend::Local, "demo:latest");
        assert_eq!(session.last_seen(), session.created_at);
        let t = Utc::now() + Duration::seconds(5);
        session.mark_activity(t);
        assert_eq!(session.last_seen(), t);
    }

    #[test]
    fn latest_snapshot_round_trips_through_metadata() {
        let mut session = SandboxSession::new("u1", SandboxBackend::Local, "demo:latest");
        assert!(session.latest_snapshot_id().is_none());
        let id = Uuid::new_v4();
        session.set_latest_snapshot_id(id);
        assert_eq!(session.latest_snapshot_id(), Some(id));
    }

    #[test]
    fn conversation_terminal_statuses() {
        assert!(ConversationStatus::Completed.is_terminal());
        assert!(ConversationStatus::BlockedPolicy.is_terminal());
        assert!(!ConversationStatus::Paused.is_terminal());
        assert!(!ConversationStatus::AwaitingAck.is_terminal());
    }

    #[test]
    fn session_serde_round_trip() {
        let mut session = SandboxSession::new("u1", SandboxBackend::Cluster, "demo:latest");
        session.backend_ref = "cluster://sandboxes/af-sandbox-abc".into();
        let json = serde_json::to_string(&session).unwrap();
        let back: SandboxSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, session.id);
        assert_eq!(back.backend, SandboxBackend::Cluster);
        assert_eq!(back.backend_ref, session.backend_ref);
    }
}
