//! Service construction — wires the runner, runtime adapters, stores, bus,
//! checkpointer and driver into one `AppState`. Built once at startup and
//! reused by the integration tests.

use std::sync::Arc;

use anyhow::Context;

use af_agent::{
    Checkpointer, FallbackCheckpointer, FileCheckpointer, GraphDriver, LanguageModel,
    MemoryCheckpointer, OpenAiCompatModel, ScriptedModel, ToolRegistry,
};
use af_domain::config::Config;
use af_domain::session::SandboxBackend;
use af_events::{EventBus, LogBus, MemoryBus, ResumeInbox};
use af_sandbox::lifecycle::SandboxExecutor;
use af_sandbox::runner::CommandRunner;
use af_sandbox::runtime::cluster::ClusterAdapter;
use af_sandbox::runtime::docker::DockerAdapter;
use af_sandbox::runtime::RuntimeAdapter;
use af_sandbox::snapshot::{object_store_from_config, SnapshotStore};
use af_sandbox::store::{ArtifactStore, ConversationStore, SessionStore};
use af_sandbox::SandboxManager;

use crate::api::auth;
use crate::quota::QuotaLedger;
use crate::runtime::session_lock::SessionLockMap;
use crate::state::AppState;

/// Build the full application state from a resolved config.
pub async fn build_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let state_path = config.workspace.state_path.clone();

    // ── Command runner (dry-run gate) ────────────────────────────────
    let runner = Arc::new(CommandRunner::new(!config.sandbox.execute_commands));
    if runner.is_dry_run() {
        tracing::warn!(
            "command execution disabled — sandbox commands run in dry-run mode \
             (set ASTRAFORGE_EXECUTE_COMMANDS=1 for real sandboxes)"
        );
    }

    // ── Runtime adapters ─────────────────────────────────────────────
    let docker = Arc::new(DockerAdapter::new(
        runner.clone(),
        config.sandbox.docker.clone(),
        config.sandbox.workspace_path.clone(),
    ));
    let cluster: Option<Arc<dyn RuntimeAdapter>> =
        if config.sandbox.backend == SandboxBackend::Cluster {
            let adapter = ClusterAdapter::connect(
                config.sandbox.cluster.clone(),
                config.sandbox.workspace_path.clone(),
                runner.clone(),
            )
            .await
            .context("connecting to the cluster runtime")?;
            tracing::info!(
                namespace = %config.sandbox.cluster.namespace,
                "cluster runtime adapter ready"
            );
            Some(Arc::new(adapter))
        } else {
            None
        };
    let executor = Arc::new(SandboxExecutor::new(runner, docker, cluster));

    // ── Stores ───────────────────────────────────────────────────────
    let sessions = Arc::new(SessionStore::new(&state_path));
    let conversations = Arc::new(ConversationStore::new(&state_path));
    let artifacts = Arc::new(ArtifactStore::new(&state_path));
    let object_store = object_store_from_config(&config.snapshots.object_store)
        .context("building the snapshot object store")?;
    if object_store.is_some() {
        tracing::info!("snapshot object-store offload enabled");
    }
    let snapshots = Arc::new(SnapshotStore::new(
        &state_path,
        executor.clone(),
        sessions.clone(),
        object_store,
    ));
    tracing::info!(path = %state_path.display(), "stores ready");

    // ── Lifecycle manager ────────────────────────────────────────────
    let manager = Arc::new(SandboxManager::new(
        executor,
        sessions,
        snapshots,
        artifacts,
        config.sandbox.clone(),
    ));

    // ── Event bus ────────────────────────────────────────────────────
    let retention = std::time::Duration::from_secs(config.events.retention_sec);
    let bus: Arc<dyn EventBus> = match &config.events.log_dir {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "durable event log enabled");
            Arc::new(LogBus::new(dir, config.events.backlog, retention))
        }
        None => Arc::new(MemoryBus::new(config.events.backlog, retention)),
    };

    // ── Checkpointer (durable with in-memory degradation) ────────────
    let checkpointer: Arc<dyn Checkpointer> =
        match FileCheckpointer::new(state_path.join("checkpoints")) {
            Ok(file) => Arc::new(FallbackCheckpointer::new(Box::new(file))),
            Err(e) => {
                tracing::warn!(error = %e, "file checkpointer unavailable, using memory only");
                Arc::new(MemoryCheckpointer::new())
            }
        };

    // ── Language model ───────────────────────────────────────────────
    let model: Arc<dyn LanguageModel> = if config.agent.base_url.is_some() {
        Arc::new(OpenAiCompatModel::from_config(&config.agent).context("building LLM provider")?)
    } else {
        tracing::warn!(
            "no LLM endpoint configured (agent.base_url) — agent runs will \
             complete immediately without model calls"
        );
        ScriptedModel::new(Vec::new())
    };

    // ── Tools + driver ───────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::sandbox_defaults(
        std::env::var("ASTRAFORGE_SEARCH_URL").ok(),
    ));
    let inbox = Arc::new(ResumeInbox::new());
    let driver = Arc::new(GraphDriver::new(
        model,
        tools,
        manager.clone(),
        conversations.clone(),
        bus.clone(),
        inbox.clone(),
        checkpointer.clone(),
        config.agent.max_steps,
    ));

    let quotas = Arc::new(QuotaLedger::new(config.quotas.clone()));
    Ok(AppState {
        config,
        manager,
        conversations,
        bus,
        driver,
        inbox,
        checkpointer,
        session_locks: Arc::new(SessionLockMap::new()),
        quotas,
        api_key_hash: auth::api_key_hash_from_env(),
    })
}

/// Apply the quota section after `build_state` (kept separate so tests can
/// inject tighter limits).
pub fn with_quotas(mut state: AppState, quotas: QuotaLedger) -> AppState {
    state.quotas = Arc::new(quotas);
    state
}
