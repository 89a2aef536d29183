//! In-memory event bus — per-session topics with a bounded backlog and
//! broadcast fan-out.
//!
//! Guarantees: events reach every subscriber in publish order; a new
//! subscriber first drains the last N events, then switches to live
//! delivery with no gap (backlog snapshot and broadcast attach happen in
//! one critical section); subscriptions end after delivering a terminal
//! event. Topics idle past the retention window are swept.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use af_domain::event::Event;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub trait EventBus: Send + Sync {
    /// Append an event to the session topic and fan it out.
    fn publish(&self, event: Event);

    /// Attach a subscriber: backlog first, then live events, ending after
    /// a terminal event.
    fn subscribe(&self, session_id: Uuid) -> Box<dyn EventSubscription>;

    /// Discard topics idle past the retention window. Returns how many
    /// were dropped.
    fn sweep(&self) -> usize {
        0
    }
}

#[async_trait]
pub trait EventSubscription: Send {
    /// The next event, or `None` once the stream has ended.
    async fn next(&mut self) -> Option<Event>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Topic {
    backlog: VecDeque<Event>,
    tx: broadcast::Sender<Event>,
    last_publish: Instant,
}

pub struct MemoryBus {
    topics: Mutex<HashMap<Uuid, Topic>>,
    backlog_cap: usize,
    retention: Duration,
}

impl MemoryBus {
    pub fn new(backlog_cap: usize, retention: Duration) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            backlog_cap: backlog_cap.max(1),
            retention,
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }

    fn with_topic<R>(&self, session_id: Uuid, f: impl FnOnce(&mut Topic) -> R) -> R {
        let mut topics = self.topics.lock();
        let capacity = self.backlog_cap.max(16);
        let topic = topics.entry(session_id).or_insert_with(|| Topic {
            backlog: VecDeque::new(),
            tx: broadcast::channel(capacity).0,
            last_publish: Instant::now(),
        });
        f(topic)
    }
}

impl EventBus for MemoryBus {
    fn publish(&self, event: Event) {
        self.with_topic(event.session_id, |topic| {
            topic.backlog.push_back(event.clone());
            while topic.backlog.len() > self.backlog_cap {
                topic.backlog.pop_front();
            }
            topic.last_publish = Instant::now();
            // No receivers is fine — the backlog still records the event.
            let _ = topic.tx.send(event);
        });
    }

    fn subscribe(&self, session_id: Uuid) -> Box<dyn EventSubscription> {
        // Snapshot + attach under the topic lock so no event can slip
        // between the backlog and the live receiver.
        let (backlog, rx) = self.with_topic(session_id, |topic| {
            (topic.backlog.clone(), topic.tx.subscribe())
        });
        Box::new(MemorySubscription {
            backlog,
            rx,
            done: false,
        })
    }

    fn sweep(&self) -> usize {
        let mut topics = self.topics.lock();
        let before = topics.len();
        let retention = self.retention;
        topics.retain(|_, topic| topic.last_publish.elapsed() < retention);
        before - topics.len()
    }
}

struct MemorySubscription {
    backlog: VecDeque<Event>,
    rx: broadcast::Receiver<Event>,
    done: bool,
}

#[async_trait]
impl EventSubscription for MemorySubscription {
    async fn next(&mut self) -> Option<Event> {
        if self.done {
            return None;
        }
        if let Some(event) = self.backlog.pop_front() {
            if event.is_terminal() {
                self.done = true;
            }
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.is_terminal() {
                        self.done = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Backlog trimming is the only lossy operation; a slow
                    // subscriber skips ahead rather than killing the stream.
                    tracing::warn!(missed = n, "subscriber lagged, skipping events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_domain::event::EventKind;

    fn bus() -> MemoryBus {
        MemoryBus::new(512, Duration::from_secs(6 * 60 * 60))
    }

    #[tokio::test]
    async fn backlog_then_live_in_publish_order() {
        let bus = bus();
        let sid = Uuid::new_v4();

        bus.publish(Event::log(sid, "one"));
        bus.publish(Event::log(sid, "two"));

        let mut sub = bus.subscribe(sid);
        assert_eq!(sub.next().await.unwrap().message.unwrap(), "one");
        assert_eq!(sub.next().await.unwrap().message.unwrap(), "two");

        bus.publish(Event::log(sid, "three"));
        assert_eq!(sub.next().await.unwrap().message.unwrap(), "three");
    }

    #[tokio::test]
    async fn fan_out_delivers_to_every_subscriber() {
        let bus = bus();
        let sid = Uuid::new_v4();
        let mut a = bus.subscribe(sid);
        let mut b = bus.subscribe(sid);

        bus.publish(Event::log(sid, "shared"));
        assert_eq!(a.next().await.unwrap().message.unwrap(), "shared");
        assert_eq!(b.next().await.unwrap().message.unwrap(), "shared");
    }

    #[tokio::test]
    async fn late_subscriber_sees_a_suffix() {
        let bus = MemoryBus::new(2, Duration::from_secs(60));
        let sid = Uuid::new_v4();
        for i in 0..5 {
            bus.publish(Event::log(sid, format!("e{i}")));
        }
        // Backlog cap 2 keeps the most recent events only.
        let mut sub = bus.subscribe(sid);
        assert_eq!(sub.next().await.unwrap().message.unwrap(), "e3");
        assert_eq!(sub.next().await.unwrap().message.unwrap(), "e4");
    }

    #[tokio::test]
    async fn stream_ends_after_terminal_event() {
        let bus = bus();
        let sid = Uuid::new_v4();
        bus.publish(Event::log(sid, "work"));
        bus.publish(Event::completed(sid, "done"));

        let mut sub = bus.subscribe(sid);
        assert_eq!(sub.next().await.unwrap().kind, EventKind::Log);
        assert_eq!(sub.next().await.unwrap().kind, EventKind::Completed);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn terminal_status_event_also_ends_stream() {
        let bus = bus();
        let sid = Uuid::new_v4();
        bus.publish(Event::status(sid, "failed"));

        let mut sub = bus.subscribe(sid);
        assert!(sub.next().await.unwrap().is_terminal());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = bus();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        bus.publish(Event::log(a, "for-a"));

        let mut sub_b = bus.subscribe(b);
        bus.publish(Event::log(b, "for-b"));
        assert_eq!(sub_b.next().await.unwrap().message.unwrap(), "for-b");
    }

    #[test]
    fn sweep_discards_idle_topics() {
        let bus = MemoryBus::new(8, Duration::from_secs(0));
        let sid = Uuid::new_v4();
        bus.publish(Event::log(sid, "x"));
        assert_eq!(bus.topic_count(), 1);
        // Zero retention: everything is already expired.
        assert_eq!(bus.sweep(), 1);
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn two_subscribers_see_identical_order() {
        let bus = bus();
        let sid = Uuid::new_v4();
        let mut early = bus.subscribe(sid);

        for i in 0..20 {
            bus.publish(Event::log(sid, format!("e{i}")));
        }
        let mut late = bus.subscribe(sid);

        let mut seen_early = Vec::new();
        for _ in 0..20 {
            seen_early.push(early.next().await.unwrap().message.unwrap());
        }
        let mut seen_late = Vec::new();
        for _ in 0..20 {
            seen_late.push(late.next().await.unwrap().message.unwrap());
        }
        assert_eq!(seen_early, seen_late);
    }
}
