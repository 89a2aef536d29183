//! Durable event bus backed by per-session JSONL stream logs.
//!
//! Each topic is a `stream-<session_id>.jsonl` file; publishing appends one
//! line and wakes tail-followers. Subscribers start from the backlog window
//! (last N lines) and then follow the file. Undecodable lines are logged
//! and skipped — a malformed entry never kills the stream. Files idle past
//! the retention window are swept.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use af_domain::event::Event;

use crate::bus::{EventBus, EventSubscription};

struct LogTopic {
    path: PathBuf,
    notify: Notify,
    /// Serializes appends so lines are never interleaved.
    write: Mutex<()>,
}

pub struct LogBus {
    dir: PathBuf,
    topics: Mutex<HashMap<Uuid, Arc<LogTopic>>>,
    backlog_cap: usize,
    retention: Duration,
}

impl LogBus {
    pub fn new(dir: impl Into<PathBuf>, backlog_cap: usize, retention: Duration) -> Self {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).ok();
        Self {
            dir,
            topics: Mutex::new(HashMap::new()),
            backlog_cap: backlog_cap.max(1),
            retention,
        }
    }

    fn topic(&self, session_id: Uuid) -> Arc<LogTopic> {
        let mut topics = self.topics.lock();
        topics
            .entry(session_id)
            .or_insert_with(|| {
                Arc::new(LogTopic {
                    path: self.dir.join(format!("stream-{session_id}.jsonl")),
                    notify: Notify::new(),
                    write: Mutex::new(()),
                })
            })
            .clone()
    }

}

impl EventBus for LogBus {
    fn publish(&self, event: Event) {
        let topic = self.topic(event.session_id);
        let Ok(json) = serde_json::to_string(&event) else {
            tracing::warn!(session_id = %event.session_id, "unserializable event dropped");
            return;
        };
        {
            let _guard = topic.write.lock();
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&topic.path)
            {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{json}") {
                        tracing::warn!(error = %e, "event log append failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "event log open failed"),
            }
        }
        topic.notify.notify_waiters();
    }

    fn subscribe(&self, session_id: Uuid) -> Box<dyn EventSubscription> {
        let topic = self.topic(session_id);
        let total = count_lines(&topic.path);
        Box::new(LogSubscription {
            topic,
            // Start inside the backlog window.
            offset: total.saturating_sub(self.backlog_cap),
            done: false,
        })
    }

    /// Remove stream files whose last write is older than the retention
    /// window.
    fn sweep(&self) -> usize {
        let mut removed = 0;
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            let stale = modified
                .elapsed()
                .map(|age| age >= self.retention)
                .unwrap_or(false);
            if stale && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            self.topics.lock().retain(|_, t| t.path.exists());
        }
        removed
    }
}

fn count_lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|content| content.lines().count())
        .unwrap_or(0)
}

struct LogSubscription {
    topic: Arc<LogTopic>,
    offset: usize,
    done: bool,
}

impl LogSubscription {
    /// Read the next decodable line at or after the current offset.
    fn read_next(&mut self) -> Option<Event> {
        let content = std::fs::read_to_string(&self.topic.path).ok()?;
        for line in content.lines().skip(self.offset) {
            self.offset += 1;
            match serde_json::from_str::<Event>(line) {
                Ok(event) => return Some(event),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable stream entry");
                }
            }
        }
        None
    }
}

#[async_trait]
impl EventSubscription for LogSubscription {
    async fn next(&mut self) -> Option<Event> {
        if self.done {
            return None;
        }
        loop {
            // Register before re-reading so a publish between the read and
            // the await still wakes us.
            let topic = self.topic.clone();
            let notified = topic.notify.notified();
            if let Some(event) = self.read_next() {
                if event.is_terminal() {
                    self.done = true;
                }
                return Some(event);
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_domain::event::EventKind;

    fn bus(dir: &Path) -> LogBus {
        LogBus::new(dir, 512, Duration::from_secs(6 * 60 * 60))
    }

    #[tokio::test]
    async fn publish_then_subscribe_replays_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        let sid = Uuid::new_v4();

        bus.publish(Event::log(sid, "one"));
        bus.publish(Event::log(sid, "two"));

        let mut sub = bus.subscribe(sid);
        assert_eq!(sub.next().await.unwrap().message.unwrap(), "one");
        assert_eq!(sub.next().await.unwrap().message.unwrap(), "two");
    }

    #[tokio::test]
    async fn live_follow_wakes_on_publish() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(bus(dir.path()));
        let sid = Uuid::new_v4();
        let mut sub = bus.subscribe(sid);

        let bus2 = bus.clone();
        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bus2.publish(Event::log(sid, "late"));
        });

        let event = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("follower woke up")
            .unwrap();
        assert_eq!(event.message.unwrap(), "late");
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn backlog_window_bounds_replay() {
        let dir = tempfile::tempdir().unwrap();
        let bus = LogBus::new(dir.path(), 3, Duration::from_secs(60));
        let sid = Uuid::new_v4();
        for i in 0..10 {
            bus.publish(Event::log(sid, format!("e{i}")));
        }

        let mut sub = bus.subscribe(sid);
        assert_eq!(sub.next().await.unwrap().message.unwrap(), "e7");
        assert_eq!(sub.next().await.unwrap().message.unwrap(), "e8");
        assert_eq!(sub.next().await.unwrap().message.unwrap(), "e9");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        let sid = Uuid::new_v4();

        bus.publish(Event::log(sid, "good"));
        // Corrupt the stream by hand.
        let path = dir.path().join(format!("stream-{sid}.jsonl"));
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "this is not json").unwrap();
        bus.publish(Event::completed(sid, "done"));

        let mut sub = bus.subscribe(sid);
        assert_eq!(sub.next().await.unwrap().message.unwrap(), "good");
        assert_eq!(sub.next().await.unwrap().kind, EventKind::Completed);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn terminal_event_ends_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        let sid = Uuid::new_v4();
        bus.publish(Event::status(sid, "completed"));

        let mut sub = bus.subscribe(sid);
        assert!(sub.next().await.unwrap().is_terminal());
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn sweep_removes_stale_streams() {
        let dir = tempfile::tempdir().unwrap();
        let bus = LogBus::new(dir.path(), 8, Duration::from_secs(0));
        let sid = Uuid::new_v4();
        bus.publish(Event::log(sid, "x"));
        assert_eq!(bus.sweep(), 1);
        assert!(!dir.path().join(format!("stream-{sid}.jsonl")).exists());
    }
}
