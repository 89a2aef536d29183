//! Resume inbox — the blocking mailbox a paused agent run waits on.
//!
//! Controllers `push` operator input (a reply, `"user_done"`, or the
//! `"cancel"` sentinel); the graph driver `pop`s inside its interrupt node.
//! Pushing the cancel sentinel is what makes interrupt waits unblock in
//! bounded time when a session is cancelled.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

pub const CANCEL_SENTINEL: &str = "cancel";
pub const USER_DONE_SENTINEL: &str = "user_done";

struct Slot {
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
}

#[derive(Default)]
pub struct ResumeInbox {
    slots: Mutex<HashMap<Uuid, Arc<Slot>>>,
}

impl ResumeInbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, session_id: Uuid) -> Arc<Slot> {
        self.slots
            .lock()
            .entry(session_id)
            .or_insert_with(|| {
                Arc::new(Slot {
                    queue: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    /// Enqueue a message for the waiting driver (single producer at a time,
    /// but pushes before the driver arrives are retained).
    pub fn push(&self, session_id: Uuid, message: impl Into<String>) {
        let slot = self.slot(session_id);
        slot.queue.lock().push_back(message.into());
        slot.notify.notify_waiters();
    }

    /// Block until a message arrives for this session.
    pub async fn pop(&self, session_id: Uuid) -> String {
        let slot = self.slot(session_id);
        loop {
            // Register the waiter before checking so a concurrent push
            // cannot be missed.
            let notified = slot.notify.notified();
            if let Some(message) = slot.queue.lock().pop_front() {
                return message;
            }
            notified.await;
        }
    }

    /// Non-blocking variant, used when auto-resuming on document upload.
    pub fn try_pop(&self, session_id: Uuid) -> Option<String> {
        let slot = self.slot(session_id);
        let message = slot.queue.lock().pop_front();
        message
    }

    /// Drop a session's mailbox once its run reaches a terminal state.
    pub fn remove(&self, session_id: &Uuid) {
        self.slots.lock().remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn push_then_pop() {
        let inbox = ResumeInbox::new();
        let sid = Uuid::new_v4();
        inbox.push(sid, "PDF");
        assert_eq!(inbox.pop(sid).await, "PDF");
    }

    #[tokio::test]
    async fn pop_blocks_until_push() {
        let inbox = Arc::new(ResumeInbox::new());
        let sid = Uuid::new_v4();

        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.pop(sid).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        inbox.push(sid, CANCEL_SENTINEL);
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("pop unblocked")
            .unwrap();
        assert_eq!(got, CANCEL_SENTINEL);
    }

    #[tokio::test]
    async fn messages_are_fifo() {
        let inbox = ResumeInbox::new();
        let sid = Uuid::new_v4();
        inbox.push(sid, "first");
        inbox.push(sid, "second");
        assert_eq!(inbox.pop(sid).await, "first");
        assert_eq!(inbox.pop(sid).await, "second");
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let inbox = ResumeInbox::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        inbox.push(a, "for-a");
        inbox.push(b, "for-b");
        assert_eq!(inbox.pop(b).await, "for-b");
        assert_eq!(inbox.pop(a).await, "for-a");
    }

    #[test]
    fn try_pop_does_not_block() {
        let inbox = ResumeInbox::new();
        let sid = Uuid::new_v4();
        assert!(inbox.try_pop(sid).is_none());
        inbox.push(sid, "msg");
        assert_eq!(inbox.try_pop(sid).as_deref(), Some("msg"));
    }

    #[test]
    fn remove_clears_mailbox() {
        let inbox = ResumeInbox::new();
        let sid = Uuid::new_v4();
        inbox.push(sid, "stale");
        inbox.remove(&sid);
        assert!(inbox.is_empty());
    }
}
