//! Per-session event fan-out: ordered pub/sub topics with bounded backlog
//! (memory or durable JSONL log) and the blocking resume inbox that
//! human-in-the-loop interrupts wait on.

pub mod bus;
pub mod inbox;
pub mod log;

pub use bus::{EventBus, EventSubscription, MemoryBus};
pub use inbox::{ResumeInbox, CANCEL_SENTINEL, USER_DONE_SENTINEL};
pub use log::LogBus;
