//! Reaper — terminates sessions past their idle or lifetime deadlines.
//!
//! Each pass scans `ready` sessions, computes the termination reason (max
//! lifetime first, then idle timeout), and terminates the stale ones. The
//! deadline is re-checked inside the session row lock immediately before
//! the terminate commits, so a concurrent `execute` that refreshed
//! `last_activity_at` wins the race.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use af_domain::session::{SandboxSession, SessionStatus};

use crate::lifecycle::SandboxManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ReapReport {
    pub checked: usize,
    pub terminated: usize,
}

pub struct Reaper {
    manager: Arc<SandboxManager>,
    interval: Duration,
}

/// Why a session is due for termination, if it is.
fn termination_reason(session: &SandboxSession, now: DateTime<Utc>) -> Option<&'static str> {
    if session.max_lifetime_sec.is_some() {
        if let Some(expires_at) = session.expires_at {
            if expires_at <= now {
                return Some("max_lifetime");
            }
        }
    }
    if let Some(idle) = session.idle_timeout_sec {
        let deadline = session.last_seen() + chrono::Duration::seconds(idle as i64);
        if deadline <= now {
            return Some("idle_timeout");
        }
    }
    None
}

impl Reaper {
    pub fn new(manager: Arc<SandboxManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// One scan over the ready sessions. Returns `{checked, terminated}`.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> ReapReport {
        let candidates = self
            .manager
            .sessions()
            .list_by_status(SessionStatus::Ready);
        let checked = candidates.len();
        let mut terminated = 0;

        for session in candidates {
            let Some(reason) = termination_reason(&session, now) else {
                continue;
            };

            // Atomic re-check under the row lock: the candidate set was a
            // snapshot and the session may have seen activity since.
            let still_due = self
                .manager
                .sessions()
                .update_with(&session.id, |s| {
                    s.status == SessionStatus::Ready && termination_reason(s, now).is_some()
                })
                .map(|(due, _)| due)
                .unwrap_or(false);
            if !still_due {
                continue;
            }

            tracing::info!(
                session_id = %session.id,
                reason,
                "terminating stale sandbox session"
            );
            match self.manager.terminate(&session.id, Some(reason)).await {
                Ok(_) => terminated += 1,
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "reaper terminate failed")
                }
            }
        }

        ReapReport {
            checked,
            terminated,
        }
    }

    /// Long-lived loop, one pass per interval.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            let report = self.run_pass(Utc::now()).await;
            if report.terminated > 0 {
                tracing::info!(
                    checked = report.checked,
                    terminated = report.terminated,
                    "reaper pass complete"
                );
            }
        }
    }
}
