//! Shared application state passed to all API handlers.

use std::sync::Arc;

use af_agent::{Checkpointer, GraphDriver};
use af_domain::config::Config;
use af_events::{EventBus, ResumeInbox};
use af_sandbox::{ConversationStore, SandboxManager};

use crate::quota::QuotaLedger;
use crate::runtime::session_lock::SessionLockMap;

/// Shared application state.
///
/// Fields are grouped by concern:
/// - **Core services** — config, lifecycle manager, event bus
/// - **Runtime** — graph driver, resume inbox, per-session run locks
/// - **Security** — API-key hash computed once at startup
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub manager: Arc<SandboxManager>,
    pub conversations: Arc<ConversationStore>,
    pub bus: Arc<dyn EventBus>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub driver: Arc<GraphDriver>,
    pub inbox: Arc<ResumeInbox>,
    pub checkpointer: Arc<dyn Checkpointer>,
    pub session_locks: Arc<SessionLockMap>,
    pub quotas: Arc<QuotaLedger>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the API key (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_key_hash: Option<Vec<u8>>,
}
