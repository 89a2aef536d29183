//! Durable aggregate stores for sessions, conversations and artifacts.
//!
//! Each store is an in-memory map behind a `RwLock` with JSONL persistence:
//! every update appends the full record, and reload keeps the last write
//! per id (compacting the file when it has grown past the live set). The
//! `update_with` closure runs inside the write lock, which is the
//! row-locking equivalent all status transitions go through — the reaper,
//! the controller and the driver contend on it.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use af_domain::session::{
    Artifact, Conversation, SandboxSession, SessionStatus,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSONL helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Load a JSONL file of id-keyed records, last write per id winning.
/// Returns the live map and the raw line count (to detect compaction need).
pub(crate) fn load_jsonl<T: DeserializeOwned>(
    path: &Path,
    id_of: impl Fn(&T) -> Uuid,
) -> (HashMap<Uuid, T>, usize) {
    let mut map = HashMap::new();
    let mut total = 0;
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            total += 1;
            match serde_json::from_str::<T>(line) {
                Ok(record) => {
                    map.insert(id_of(&record), record);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed record");
                }
            }
        }
    }
    (map, total)
}

pub(crate) fn rewrite_jsonl<T: Serialize>(path: &Path, records: impl Iterator<Item = T>) {
    let tmp = path.with_extension("jsonl.tmp");
    let mut ok = false;
    if let Ok(mut f) = std::fs::File::create(&tmp) {
        ok = true;
        for record in records {
            if let Ok(json) = serde_json::to_string(&record) {
                if writeln!(f, "{json}").is_err() {
                    ok = false;
                    break;
                }
            }
        }
    }
    if ok {
        let _ = std::fs::rename(&tmp, path);
    } else {
        let _ = std::fs::remove_file(&tmp);
    }
}

pub(crate) fn append_jsonl<T: Serialize>(path: &Path, record: &T) {
    if let Ok(json) = serde_json::to_string(record) {
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            let _ = writeln!(file, "{json}");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionStore {
    inner: RwLock<HashMap<Uuid, SandboxSession>>,
    log_path: PathBuf,
}

impl SessionStore {
    pub fn new(state_path: &Path) -> Self {
        std::fs::create_dir_all(state_path).ok();
        let log_path = state_path.join("sessions.jsonl");
        let (map, total) = load_jsonl::<SandboxSession>(&log_path, |s| s.id);
        if total > map.len() {
            rewrite_jsonl(&log_path, map.values().cloned());
        }
        Self {
            inner: RwLock::new(map),
            log_path,
        }
    }

    pub fn insert(&self, session: SandboxSession) -> Uuid {
        let id = session.id;
        append_jsonl(&self.log_path, &session);
        self.inner.write().insert(id, session);
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<SandboxSession> {
        self.inner.read().get(id).cloned()
    }

    /// Mutate a session inside the write lock and persist the result. The
    /// closure's return value is handed back alongside the updated record,
    /// which lets callers make check-and-act decisions atomically.
    pub fn update_with<R>(
        &self,
        id: &Uuid,
        f: impl FnOnce(&mut SandboxSession) -> R,
    ) -> Option<(R, SandboxSession)> {
        let mut inner = self.inner.write();
        let session = inner.get_mut(id)?;
        let result = f(session);
        let snapshot = session.clone();
        drop(inner);
        append_jsonl(&self.log_path, &snapshot);
        Some((result, snapshot))
    }

    pub fn update(&self, id: &Uuid, f: impl FnOnce(&mut SandboxSession)) -> Option<SandboxSession> {
        self.update_with(id, f).map(|(_, session)| session)
    }

    pub fn list(&self) -> Vec<SandboxSession> {
        let mut sessions: Vec<_> = self.inner.read().values().cloned().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    pub fn list_by_status(&self, status: SessionStatus) -> Vec<SandboxSession> {
        self.inner
            .read()
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect()
    }

    /// Live (starting or ready) sessions for a workspace — the concurrent
    /// sandbox quota counts these.
    pub fn count_active(&self, workspace_id: Option<&str>) -> usize {
        self.inner
            .read()
            .values()
            .filter(|s| matches!(s.status, SessionStatus::Starting | SessionStatus::Ready))
            .filter(|s| match workspace_id {
                Some(w) => s.workspace_id.as_deref() == Some(w),
                None => true,
            })
            .count()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ConversationStore {
    inner: RwLock<HashMap<Uuid, Conversation>>,
    log_path: PathBuf,
}

impl ConversationStore {
    pub fn new(state_path: &Path) -> Self {
        std::fs::create_dir_all(state_path).ok();
        let log_path = state_path.join("conversations.jsonl");
        let (map, total) = load_jsonl::<Conversation>(&log_path, |c| c.id);
        if total > map.len() {
            rewrite_jsonl(&log_path, map.values().cloned());
        }
        Self {
            inner: RwLock::new(map),
            log_path,
        }
    }

    pub fn insert(&self, conversation: Conversation) -> Uuid {
        let id = conversation.id;
        append_jsonl(&self.log_path, &conversation);
        self.inner.write().insert(id, conversation);
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<Conversation> {
        self.inner.read().get(id).cloned()
    }

    pub fn update_with<R>(
        &self,
        id: &Uuid,
        f: impl FnOnce(&mut Conversation) -> R,
    ) -> Option<(R, Conversation)> {
        let mut inner = self.inner.write();
        let conversation = inner.get_mut(id)?;
        let result = f(conversation);
        conversation.updated_at = chrono::Utc::now();
        let snapshot = conversation.clone();
        drop(inner);
        append_jsonl(&self.log_path, &snapshot);
        Some((result, snapshot))
    }

    pub fn update(&self, id: &Uuid, f: impl FnOnce(&mut Conversation)) -> Option<Conversation> {
        self.update_with(id, f).map(|(_, c)| c)
    }

    pub fn list(&self) -> Vec<Conversation> {
        let mut items: Vec<_> = self.inner.read().values().cloned().collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items
    }

    /// Most recent completed conversation for a user, used to seed
    /// restore-from-latest-snapshot on create.
    pub fn latest_completed_for_user(&self, user_id: &str) -> Option<Conversation> {
        self.inner
            .read()
            .values()
            .filter(|c| {
                c.user_id == user_id
                    && c.status == af_domain::session::ConversationStatus::Completed
            })
            .max_by_key(|c| c.created_at)
            .cloned()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Artifact store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ArtifactStore {
    inner: RwLock<HashMap<Uuid, Artifact>>,
    log_path: PathBuf,
}

impl ArtifactStore {
    pub fn new(state_path: &Path) -> Self {
        std::fs::create_dir_all(state_path).ok();
        let log_path = state_path.join("artifacts.jsonl");
        let (map, total) = load_jsonl::<Artifact>(&log_path, |a| a.id);
        if total > map.len() {
            rewrite_jsonl(&log_path, map.values().cloned());
        }
        Self {
            inner: RwLock::new(map),
            log_path,
        }
    }

    pub fn insert(&self, artifact: Artifact) -> Uuid {
        let id = artifact.id;
        append_jsonl(&self.log_path, &artifact);
        self.inner.write().insert(id, artifact);
        id
    }

    pub fn list_for_session(&self, session_id: &Uuid) -> Vec<Artifact> {
        let mut items: Vec<_> = self
            .inner
            .read()
            .values()
            .filter(|a| a.session_id == *session_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items
    }

    /// Sessions own their artifacts: cascade delete on terminate.
    pub fn remove_for_session(&self, session_id: &Uuid) {
        let mut inner = self.inner.write();
        inner.retain(|_, a| a.session_id != *session_id);
        let remaining: Vec<_> = inner.values().cloned().collect();
        drop(inner);
        rewrite_jsonl(&self.log_path, remaining.into_iter());
    }
}
