//! Per-session run concurrency control.
//!
//! Within one session the graph driver is single-threaded cooperative; the
//! lock map enforces that across dispatches — a second run for the same
//! session waits until the first finishes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Maps each session id to a `Semaphore(1)`. Holding the permit is holding
/// the session's run slot; it auto-releases on drop.
pub struct SessionLockMap {
    locks: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

impl Default for SessionLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the run lock for a session, waiting if a run is in flight.
    pub async fn acquire(&self, session_id: Uuid) -> OwnedSemaphorePermit {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(session_id)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        // The semaphore is never closed, so acquire cannot fail.
        sem.acquire_owned().await.expect("session semaphore closed")
    }

    /// Whether a run currently holds the session's slot.
    pub fn is_running(&self, session_id: &Uuid) -> bool {
        self.locks
            .lock()
            .get(session_id)
            .map(|sem| sem.available_permits() == 0)
            .unwrap_or(false)
    }

    /// Drop entries whose slot is free (periodic cleanup).
    pub fn prune_idle(&self) {
        self.locks
            .lock()
            .retain(|_, sem| sem.available_permits() == 0);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sequential_acquire_release() {
        let map = SessionLockMap::new();
        let id = Uuid::new_v4();
        let permit = map.acquire(id).await;
        assert!(map.is_running(&id));
        drop(permit);
        assert!(!map.is_running(&id));
        let _again = map.acquire(id).await;
    }

    #[tokio::test]
    async fn different_sessions_do_not_contend() {
        let map = Arc::new(SessionLockMap::new());
        let _a = map.acquire(Uuid::new_v4()).await;
        let _b = map.acquire(Uuid::new_v4()).await;
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn same_session_serializes() {
        let map = Arc::new(SessionLockMap::new());
        let id = Uuid::new_v4();
        let permit = map.acquire(id).await;

        let map2 = map.clone();
        let waiter = tokio::spawn(async move {
            let _p = map2.acquire(id).await;
            7
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let map = SessionLockMap::new();
        let held = Uuid::new_v4();
        let idle = Uuid::new_v4();
        let _permit = map.acquire(held).await;
        let released = map.acquire(idle).await;
        drop(released);

        map.prune_idle();
        assert_eq!(map.len(), 1);
        assert!(map.is_running(&held));
    }
}
