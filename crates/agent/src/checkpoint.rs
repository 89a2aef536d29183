//! Durable checkpointing for the graph driver.
//!
//! A checkpoint is the full serialized conversation state plus the next
//! node, written after every transition. `FallbackCheckpointer` degrades to
//! in-memory storage with a warning when the durable backend fails — the
//! driver never crashes because the checkpointer is down.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use uuid::Uuid;

use af_domain::{Error, Result};

use crate::state::AgentState;

pub trait Checkpointer: Send + Sync {
    fn save(&self, session_id: Uuid, state: &AgentState) -> Result<()>;
    fn load(&self, session_id: &Uuid) -> Result<Option<AgentState>>;
    fn remove(&self, session_id: &Uuid);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryCheckpointer {
    states: RwLock<HashMap<Uuid, AgentState>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Checkpointer for MemoryCheckpointer {
    fn save(&self, session_id: Uuid, state: &AgentState) -> Result<()> {
        self.states.write().insert(session_id, state.clone());
        Ok(())
    }

    fn load(&self, session_id: &Uuid) -> Result<Option<AgentState>> {
        Ok(self.states.read().get(session_id).cloned())
    }

    fn remove(&self, session_id: &Uuid) {
        self.states.write().remove(session_id);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File-backed
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct FileCheckpointer {
    dir: PathBuf,
}

impl FileCheckpointer {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::CheckpointUnavailable(format!("{}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn path_for(&self, session_id: &Uuid) -> PathBuf {
        self.dir.join(format!("checkpoint-{session_id}.json"))
    }
}

impl Checkpointer for FileCheckpointer {
    fn save(&self, session_id: Uuid, state: &AgentState) -> Result<()> {
        let path = self.path_for(&session_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(state)
            .map_err(|e| Error::CheckpointUnavailable(e.to_string()))?;
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .map_err(|e| Error::CheckpointUnavailable(e.to_string()))
    }

    fn load(&self, session_id: &Uuid) -> Result<Option<AgentState>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)
            .map_err(|e| Error::CheckpointUnavailable(e.to_string()))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::CheckpointUnavailable(e.to_string()))
    }

    fn remove(&self, session_id: &Uuid) {
        let _ = std::fs::remove_file(self.path_for(session_id));
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Degrading wrapper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wraps a durable checkpointer; after the first failure all traffic goes
/// to an in-memory secondary until the process restarts.
pub struct FallbackCheckpointer {
    primary: Box<dyn Checkpointer>,
    memory: MemoryCheckpointer,
    degraded: AtomicBool,
}

impl FallbackCheckpointer {
    pub fn new(primary: Box<dyn Checkpointer>) -> Self {
        Self {
            primary,
            memory: MemoryCheckpointer::new(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn degrade(&self, error: &Error) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(%error, "durable checkpointer unavailable, falling back to memory");
        }
    }
}

impl Checkpointer for FallbackCheckpointer {
    fn save(&self, session_id: Uuid, state: &AgentState) -> Result<()> {
        if !self.is_degraded() {
            match self.primary.save(session_id, state) {
                Ok(()) => return Ok(()),
                Err(e) => self.degrade(&e),
            }
        }
        self.memory.save(session_id, state)
    }

    fn load(&self, session_id: &Uuid) -> Result<Option<AgentState>> {
        if !self.is_degraded() {
            match self.primary.load(session_id) {
                Ok(state) => return Ok(state),
                Err(e) => self.degrade(&e),
            }
        }
        self.memory.load(session_id)
    }

    fn remove(&self, session_id: &Uuid) {
        if !self.is_degraded() {
            self.primary.remove(session_id);
        }
        self.memory.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::GraphNode;

    #[test]
    fn memory_round_trip() {
        let cp = MemoryCheckpointer::new();
        let id = Uuid::new_v4();
        assert!(cp.load(&id).unwrap().is_none());

        let mut state = AgentState::new("goal");
        state.next_node = GraphNode::Observer;
        cp.save(id, &state).unwrap();
        assert_eq!(cp.load(&id).unwrap().unwrap().next_node, GraphNode::Observer);

        cp.remove(&id);
        assert!(cp.load(&id).unwrap().is_none());
    }

    #[test]
    fn file_round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        {
            let cp = FileCheckpointer::new(dir.path()).unwrap();
            let mut state = AgentState::new("goal");
            state.summary = "half done".into();
            cp.save(id, &state).unwrap();
        }
        let cp = FileCheckpointer::new(dir.path()).unwrap();
        assert_eq!(cp.load(&id).unwrap().unwrap().summary, "half done");
    }

    struct BrokenCheckpointer;

    impl Checkpointer for BrokenCheckpointer {
        fn save(&self, _: Uuid, _: &AgentState) -> Result<()> {
            Err(Error::CheckpointUnavailable("backend down".into()))
        }
        fn load(&self, _: &Uuid) -> Result<Option<AgentState>> {
            Err(Error::CheckpointUnavailable("backend down".into()))
        }
        fn remove(&self, _: &Uuid) {}
    }

    #[test]
    fn fallback_degrades_instead_of_failing() {
        let cp = FallbackCheckpointer::new(Box::new(BrokenCheckpointer));
        let id = Uuid::new_v4();
        let state = AgentState::new("goal");

        cp.save(id, &state).unwrap();
        assert!(cp.is_degraded());
        // The state is still retrievable from the in-memory secondary.
        assert!(cp.load(&id).unwrap().is_some());
    }

    #[test]
    fn fallback_prefers_primary_when_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let primary = FileCheckpointer::new(dir.path()).unwrap();
        let cp = FallbackCheckpointer::new(Box::new(primary));
        let id = Uuid::new_v4();
        cp.save(id, &AgentState::new("goal")).unwrap();

        assert!(!cp.is_degraded());
        assert!(dir
            .path()
            .join(format!("checkpoint-{id}.json"))
            .exists());
    }
}
