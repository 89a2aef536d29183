//! Sandbox lifecycle manager — the aggregate root for sessions.
//!
//! `SandboxExecutor` is the thin layer that runs a shell script inside a
//! session's workload (adapter exec wrapping + command runner).
//! `SandboxManager` builds the public operations on top of it: provision,
//! execute, upload, export, screenshot, snapshot/restore, heartbeat and
//! terminate. Provisioning is idempotent; execution against a session that
//! is no longer ready triggers exactly one auto-reprovision attempt,
//! restoring the latest snapshot when one exists.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use uuid::Uuid;

use af_domain::config::SandboxConfig;
use af_domain::session::{
    Artifact, SandboxBackend, SandboxSession, SessionStatus, Snapshot,
    METADATA_TERMINATED_REASON,
};
use af_domain::{Error, Result};

use crate::runner::{CommandOutput, CommandRunner, RunOptions, StreamSink};
use crate::runtime::RuntimeAdapter;
use crate::snapshot::{SnapshotOptions, SnapshotStore};
use crate::store::{ArtifactStore, SessionStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SandboxExecutor {
    runner: Arc<CommandRunner>,
    local: Arc<dyn RuntimeAdapter>,
    cluster: Option<Arc<dyn RuntimeAdapter>>,
}

impl SandboxExecutor {
    pub fn new(
        runner: Arc<CommandRunner>,
        local: Arc<dyn RuntimeAdapter>,
        cluster: Option<Arc<dyn RuntimeAdapter>>,
    ) -> Self {
        Self {
            runner,
            local,
            cluster,
        }
    }

    pub fn runner(&self) -> &Arc<CommandRunner> {
        &self.runner
    }

    pub fn adapter_for(&self, backend: SandboxBackend) -> Result<&Arc<dyn RuntimeAdapter>> {
        match backend {
            SandboxBackend::Local => Ok(&self.local),
            SandboxBackend::Cluster => self.cluster.as_ref().ok_or_else(|| {
                Error::Config("cluster backend requested but not configured".into())
            }),
        }
    }

    /// Run a script inside the session's workload with `allow_failure` —
    /// non-zero exits come back in the output, never as errors.
    pub async fn exec(
        &self,
        session: &SandboxSession,
        script: &str,
        cwd: Option<&str>,
    ) -> Result<CommandOutput> {
        self.exec_streamed(session, script, cwd, None).await
    }

    pub async fn exec_streamed(
        &self,
        session: &SandboxSession,
        script: &str,
        cwd: Option<&str>,
        stream: Option<StreamSink>,
    ) -> Result<CommandOutput> {
        let adapter = self.adapter_for(session.backend)?;
        let argv = adapter.exec_in(&session.backend_ref, script, cwd)?;
        let opts = RunOptions {
            stream,
            allow_failure: true,
            ..RunOptions::default()
        };
        self.runner.run(&argv, opts).await
    }

    /// Write bytes to a path inside the sandbox (base64 ship + decode,
    /// parent directory created).
    pub async fn upload(&self, session: &SandboxSession, path: &str, bytes: &[u8]) -> Result<()> {
        let adapter = self.adapter_for(session.backend)?;
        adapter.copy_in(&session.backend_ref, path, bytes).await
    }

    /// Read a file from inside the sandbox.
    pub async fn read_file(&self, session: &SandboxSession, path: &str) -> Result<Vec<u8>> {
        let adapter = self.adapter_for(session.backend)?;
        adapter.read_file(&session.backend_ref, path).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SandboxManager {
    executor: Arc<SandboxExecutor>,
    sessions: Arc<SessionStore>,
    snapshots: Arc<SnapshotStore>,
    artifacts: Arc<ArtifactStore>,
    config: SandboxConfig,
}

impl SandboxManager {
    pub fn new(
        executor: Arc<SandboxExecutor>,
        sessions: Arc<SessionStore>,
        snapshots: Arc<SnapshotStore>,
        artifacts: Arc<ArtifactStore>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            executor,
            sessions,
            snapshots,
            artifacts,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    pub fn executor(&self) -> &Arc<SandboxExecutor> {
        &self.executor
    }

    /// Build and persist a new session from config defaults.
    pub fn create_session(
        &self,
        user_id: &str,
        workspace_id: Option<String>,
        backend: Option<SandboxBackend>,
        image: Option<String>,
        restore_snapshot_id: Option<Uuid>,
    ) -> SandboxSession {
        let mut session = SandboxSession::new(
            user_id,
            backend.unwrap_or(self.config.backend),
            image.unwrap_or_else(|| self.config.image.clone()),
        );
        session.workspace_id = workspace_id;
        session.workspace_path = self.config.workspace_path.clone();
        session.idle_timeout_sec = Some(self.config.idle_timeout_sec);
        session.max_lifetime_sec = Some(self.config.max_lifetime_sec);
        session.restore_snapshot_id = restore_snapshot_id;
        session.ensure_expiry();
        self.sessions.insert(session.clone());
        session
    }

    /// Provision the session's workload. Re-entrant: a ready session whose
    /// workload still answers the liveness probe is left alone.
    pub async fn provision(&self, session_id: &Uuid) -> Result<SandboxSession> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        if session.status == SessionStatus::Terminated {
            return Err(Error::Provision(format!(
                "session {session_id} is terminated"
            )));
        }

        let adapter = self.executor.adapter_for(session.backend)?;

        if session.status == SessionStatus::Ready && !session.backend_ref.is_empty() {
            let probe = adapter.inspect(&session.backend_ref).await?;
            if probe.running {
                return Ok(session);
            }
            tracing::info!(session_id = %session_id, "ready session is not live, respawning");
        }

        let spawned = match adapter.spawn(&session).await {
            Ok(spawned) => spawned,
            Err(e) => {
                let message = e.to_string();
                self.sessions.update(&session.id, |s| {
                    if s.status.can_transition_to(SessionStatus::Failed) {
                        s.status = SessionStatus::Failed;
                    }
                    s.error_message = message.clone();
                });
                return Err(Error::Provision(message));
            }
        };

        let now = Utc::now();
        let updated = self
            .sessions
            .update(&session.id, |s| {
                if s.status.can_transition_to(SessionStatus::Ready) {
                    s.status = SessionStatus::Ready;
                }
                s.backend_ref = spawned.backend_ref.clone();
                s.control_endpoint = spawned.control_endpoint.clone();
                s.workspace_path = spawned.workspace_path.clone();
                s.error_message.clear();
                s.mark_activity(now);
                s.ensure_expiry();
            })
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        if let Some(snapshot_id) = updated.restore_snapshot_id {
            if let Some(snapshot) = self.snapshots.get(&snapshot_id) {
                if let Err(e) = self.snapshots.restore(&updated, &snapshot).await {
                    let message = format!("restore of snapshot {snapshot_id} failed: {e}");
                    self.sessions.update(&session.id, |s| {
                        if s.status.can_transition_to(SessionStatus::Failed) {
                            s.status = SessionStatus::Failed;
                        }
                        s.error_message = message.clone();
                    });
                    return Err(Error::Provision(message));
                }
            } else {
                tracing::warn!(
                    session_id = %session_id,
                    snapshot_id = %snapshot_id,
                    "restore snapshot not found, provisioning without it"
                );
            }
        }

        tracing::info!(
            session_id = %session_id,
            backend_ref = %updated.backend_ref,
            "session provisioned"
        );
        self.sessions
            .get(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
    }

    /// Execute a command in the session, with an optional `timeout` prefix.
    /// Exit codes are surfaced verbatim; a session that is not ready gets
    /// exactly one auto-reprovision attempt (restoring the latest snapshot)
    /// before the call fails with `SandboxNotReady`.
    pub async fn execute(
        &self,
        session_id: &Uuid,
        command: &str,
        cwd: Option<&str>,
        timeout_sec: Option<u64>,
        stream: Option<StreamSink>,
    ) -> Result<CommandOutput> {
        let mut session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        if session.status != SessionStatus::Ready {
            tracing::info!(
                session_id = %session_id,
                status = ?session.status,
                "session not ready, attempting auto-reprovision"
            );
            if let Some(latest) = session.latest_snapshot_id() {
                self.sessions.update(session_id, |s| {
                    s.restore_snapshot_id = Some(latest);
                });
            }
            session = self
                .provision(session_id)
                .await
                .map_err(|_| Error::SandboxNotReady(*session_id))?;
        }

        let rendered = match timeout_sec {
            Some(sec) => format!("timeout {sec} {command}"),
            None => command.to_string(),
        };
        let workdir = cwd.unwrap_or(&session.workspace_path).to_string();
        let out = self
            .executor
            .exec_streamed(&session, &rendered, Some(workdir.as_str()), stream)
            .await?;

        let duration = out.duration_sec;
        self.sessions.update(session_id, |s| {
            s.mark_activity(Utc::now());
            s.cpu_seconds += duration;
        });
        Ok(out)
    }

    /// Write a file into the session workspace.
    pub async fn upload(&self, session_id: &Uuid, path: &str, bytes: &[u8]) -> Result<()> {
        let session = self.ready_session(session_id)?;
        validate_workspace_path(&session.workspace_path, path)?;
        self.executor.upload(&session, path, bytes).await?;
        self.sessions.update(session_id, |s| {
            s.mark_activity(Utc::now());
        });
        Ok(())
    }

    /// Read file bytes out of the session workspace.
    pub async fn read_file(&self, session_id: &Uuid, path: &str) -> Result<Vec<u8>> {
        let session = self.ready_session(session_id)?;
        validate_workspace_path(&session.workspace_path, path)?;
        self.executor.read_file(&session, path).await
    }

    /// Promote a sandbox file into an artifact with a download URL.
    pub async fn export_file(
        &self,
        session_id: &Uuid,
        path: &str,
        filename: &str,
        content_type: Option<&str>,
    ) -> Result<Artifact> {
        let session = self.ready_session(session_id)?;
        validate_workspace_path(&session.workspace_path, path)?;
        let content = self.executor.read_file(&session, path).await?;

        let download_url = match &session.artifact_base_url {
            Some(base) if !base.is_empty() => {
                format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
            }
            _ => format!(
                "/sandbox/sessions/{}/files/content?path={}",
                session.id, path
            ),
        };

        let artifact = Artifact {
            id: Uuid::new_v4(),
            session_id: session.id,
            filename: filename.to_string(),
            content_type: content_type
                .filter(|c| !c.is_empty())
                .unwrap_or("application/octet-stream")
                .to_string(),
            size_bytes: content.len() as u64,
            storage_path: path.to_string(),
            download_url: Some(download_url),
            created_at: Utc::now(),
        };
        self.artifacts.insert(artifact.clone());
        self.sessions.update(session_id, |s| {
            s.mark_activity(Utc::now());
        });
        Ok(artifact)
    }

    /// Capture a PNG of the sandbox X root window. Probes for ImageMagick
    /// `import` first, then `xwd` + `convert`, and fails cleanly when
    /// neither is present.
    pub async fn capture_screenshot(&self, session_id: &Uuid) -> Result<Vec<u8>> {
        if self.executor.runner().is_dry_run() {
            return Err(Error::Config(
                "screenshot capture disabled when command execution is off".into(),
            ));
        }
        let session = self.ready_session(session_id)?;

        let script = r#"set -e
DISPLAY=${DISPLAY:-:99}
TMPFILE=${TMPDIR:-/tmp}/sandbox-screenshot.png
if command -v import >/dev/null 2>&1; then
  DISPLAY="$DISPLAY" import -window root "$TMPFILE"
elif command -v xwd >/dev/null 2>&1 && command -v convert >/dev/null 2>&1; then
  DISPLAY="$DISPLAY" xwd -root -silent | convert xwd:- png:"$TMPFILE"
else
  echo "NO_CAPTURE_TOOL" >&2
  exit 3
fi
base64 "$TMPFILE""#;

        let out = self
            .execute(
                session_id,
                script,
                Some(session.workspace_path.as_str()),
                Some(30),
                None,
            )
            .await?;
        if out.exit_code == 124 {
            return Err(Error::Timeout {
                argv: vec!["screenshot".into()],
                timeout_sec: 30,
            });
        }
        if out.exit_code != 0 {
            let message = out.combined();
            if message.contains("NO_CAPTURE_TOOL") {
                return Err(Error::Other(
                    "screenshot tooling is not available in the sandbox image".into(),
                ));
            }
            return Err(Error::Other(format!(
                "screenshot command failed: {}",
                message.trim()
            )));
        }
        let raw: String = out.stdout.chars().filter(|c| !c.is_whitespace()).collect();
        if raw.is_empty() {
            return Err(Error::Other("screenshot command produced no output".into()));
        }
        BASE64
            .decode(raw.as_bytes())
            .map_err(|e| Error::Other(format!("unable to decode screenshot output: {e}")))
    }

    /// Create a snapshot of the session workspace.
    pub async fn snapshot(&self, session_id: &Uuid, opts: SnapshotOptions) -> Result<Snapshot> {
        let session = self.ready_session(session_id)?;
        self.snapshots.create(&session, opts).await
    }

    /// Restore a snapshot into the session.
    pub async fn restore(&self, session_id: &Uuid, snapshot_id: &Uuid) -> Result<()> {
        let session = self.ready_session(session_id)?;
        let snapshot = self
            .snapshots
            .get(snapshot_id)
            .ok_or_else(|| Error::NotFound(format!("snapshot {snapshot_id}")))?;
        self.snapshots.restore(&session, &snapshot).await
    }

    pub fn heartbeat(&self, session_id: &Uuid) -> Result<SandboxSession> {
        self.sessions
            .update(session_id, |s| s.mark_heartbeat(Utc::now()))
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
    }

    /// Best-effort teardown: destroy the workload, then mark the session
    /// terminated with the reason recorded in its metadata. Idempotent.
    pub async fn terminate(&self, session_id: &Uuid, reason: Option<&str>) -> Result<SandboxSession> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        if session.status == SessionStatus::Terminated {
            return Ok(session);
        }

        if !session.backend_ref.is_empty() {
            if let Ok(adapter) = self.executor.adapter_for(session.backend) {
                if let Err(e) = adapter.destroy(&session.backend_ref).await {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "workload destroy failed, terminating anyway"
                    );
                }
            }
        }

        let reason = reason.unwrap_or("terminated").to_string();
        let updated = self
            .sessions
            .update(session_id, |s| {
                if s.status.can_transition_to(SessionStatus::Terminated) {
                    s.status = SessionStatus::Terminated;
                }
                s.metadata.insert(
                    METADATA_TERMINATED_REASON.into(),
                    serde_json::Value::String(reason.clone()),
                );
            })
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        tracing::info!(session_id = %session_id, reason = %reason, "session terminated");
        Ok(updated)
    }

    fn ready_session(&self, session_id: &Uuid) -> Result<SandboxSession> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        if session.status != SessionStatus::Ready {
            return Err(Error::SandboxNotReady(*session_id));
        }
        Ok(session)
    }
}

/// Reject paths outside the session workspace (and relative or
/// dot-dot-traversing ones).
pub fn validate_workspace_path(workspace: &str, path: &str) -> Result<()> {
    let root = workspace.trim_end_matches('/');
    let ok = path.starts_with('/')
        && !path.split('/').any(|seg| seg == "..")
        && (path == root || path.starts_with(&format!("{root}/")));
    if ok {
        Ok(())
    } else {
        Err(Error::Other(format!(
            "path {path:?} is outside the session workspace {workspace:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CommandRunner;
    use crate::runtime::docker::DockerAdapter;
    use af_domain::config::DockerConfig;

    fn manager() -> (Arc<CommandRunner>, tempfile::TempDir, SandboxManager) {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(CommandRunner::new(true));
        let docker = Arc::new(DockerAdapter::new(
            runner.clone(),
            DockerConfig::default(),
            "/workspace".into(),
        ));
        let executor = Arc::new(SandboxExecutor::new(runner.clone(), docker, None));
        let sessions = Arc::new(SessionStore::new(dir.path()));
        let snapshots = Arc::new(SnapshotStore::new(
            dir.path(),
            executor.clone(),
            sessions.clone(),
            None,
        ));
        let artifacts = Arc::new(ArtifactStore::new(dir.path()));
        let manager = SandboxManager::new(
            executor,
            sessions,
            snapshots,
            artifacts,
            SandboxConfig::default(),
        );
        (runner, dir, manager)
    }

    #[tokio::test]
    async fn provision_moves_starting_to_ready() {
        let (_runner, _dir, manager) = manager();
        let session = manager.create_session("u1", None, None, None, None);
        assert_eq!(session.status, SessionStatus::Starting);

        let provisioned = manager.provision(&session.id).await.unwrap();
        assert_eq!(provisioned.status, SessionStatus::Ready);
        assert!(provisioned.backend_ref.starts_with("local://sandbox-"));
        assert!(provisioned.expires_at.is_some());
        assert!(provisioned.last_activity_at.is_some());
    }

    #[tokio::test]
    async fn provision_is_idempotent() {
        let (runner, _dir, manager) = manager();
        let session = manager.create_session("u1", None, None, None, None);

        let first = manager.provision(&session.id).await.unwrap();
        let spawns_after_first = runner
            .recorded()
            .iter()
            .filter(|argv| argv.get(1).map(String::as_str) == Some("run"))
            .count();

        let second = manager.provision(&session.id).await.unwrap();
        let spawns_after_second = runner
            .recorded()
            .iter()
            .filter(|argv| argv.get(1).map(String::as_str) == Some("run"))
            .count();

        assert_eq!(first.backend_ref, second.backend_ref);
        assert_eq!(spawns_after_first, 1);
        assert_eq!(spawns_after_second, 1, "second provision must be a no-op");
    }

    #[tokio::test]
    async fn provision_of_terminated_session_fails() {
        let (_runner, _dir, manager) = manager();
        let session = manager.create_session("u1", None, None, None, None);
        manager.provision(&session.id).await.unwrap();
        manager.terminate(&session.id, None).await.unwrap();
        assert!(manager.provision(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn execute_wraps_timeout_and_marks_activity() {
        let (runner, _dir, manager) = manager();
        let session = manager.create_session("u1", None, None, None, None);
        manager.provision(&session.id).await.unwrap();

        let before = manager.sessions().get(&session.id).unwrap().last_activity_at;
        manager
            .execute(&session.id, "echo hello", None, Some(30), None)
            .await
            .unwrap();

        let script = runner
            .recorded()
            .last()
            .unwrap()
            .last()
            .unwrap()
            .clone();
        assert!(script.contains("timeout 30 echo hello"));
        assert!(script.starts_with("cd /workspace &&"));

        let after = manager.sessions().get(&session.id).unwrap().last_activity_at;
        assert!(after >= before);
    }

    #[tokio::test]
    async fn execute_auto_reprovisions_non_ready_session() {
        let (runner, _dir, manager) = manager();
        let session = manager.create_session("u1", None, None, None, None);
        // Never provisioned: status is still `starting`.
        manager
            .execute(&session.id, "echo hi", None, None, None)
            .await
            .unwrap();

        let state = manager.sessions().get(&session.id).unwrap();
        assert_eq!(state.status, SessionStatus::Ready);
        assert!(runner
            .recorded()
            .iter()
            .any(|argv| argv.get(1).map(String::as_str) == Some("run")));
    }

    #[tokio::test]
    async fn execute_auto_restore_uses_latest_snapshot() {
        let (runner, _dir, manager) = manager();
        let session = manager.create_session("u1", None, None, None, None);
        manager.provision(&session.id).await.unwrap();
        let snapshot = manager
            .snapshot(&session.id, SnapshotOptions::default())
            .await
            .unwrap();

        // Simulate a worker restart that lost the workload: force `failed`.
        manager.sessions().update(&session.id, |s| {
            s.status = SessionStatus::Failed;
        });

        manager
            .execute(&session.id, "cat /workspace/foo.txt", None, None, None)
            .await
            .unwrap();

        // The restore tar ran against the snapshot's archive.
        let restored = runner.recorded().iter().any(|argv| {
            argv.last()
                .map(|s| s.contains("tar -xzf") && s.contains(&snapshot.id.to_string()))
                .unwrap_or(false)
        });
        assert!(restored, "auto-reprovision should restore the latest snapshot");
    }

    #[tokio::test]
    async fn upload_validates_workspace_paths() {
        let (_runner, _dir, manager) = manager();
        let session = manager.create_session("u1", None, None, None, None);
        manager.provision(&session.id).await.unwrap();

        manager
            .upload(&session.id, "/workspace/uploads/a.txt", b"hi")
            .await
            .unwrap();
        assert!(manager
            .upload(&session.id, "/etc/passwd", b"nope")
            .await
            .is_err());
        assert!(manager
            .upload(&session.id, "/workspace/../etc/shadow", b"nope")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn export_file_builds_canonical_download_url() {
        let (_runner, _dir, manager) = manager();
        let session = manager.create_session("u1", None, None, None, None);
        manager.provision(&session.id).await.unwrap();

        let artifact = manager
            .export_file(&session.id, "/workspace/out.csv", "out.csv", None)
            .await
            .unwrap();
        assert_eq!(artifact.content_type, "application/octet-stream");
        assert_eq!(
            artifact.download_url.as_deref().unwrap(),
            &format!(
                "/sandbox/sessions/{}/files/content?path=/workspace/out.csv",
                session.id
            )
        );
        assert_eq!(manager.artifacts().list_for_session(&session.id).len(), 1);
    }

    #[tokio::test]
    async fn export_file_prefers_artifact_base_url() {
        let (_runner, _dir, manager) = manager();
        let session = manager.create_session("u1", None, None, None, None);
        manager.provision(&session.id).await.unwrap();
        manager.sessions().update(&session.id, |s| {
            s.artifact_base_url = Some("https://files.example.com/".into());
        });

        let artifact = manager
            .export_file(&session.id, "/workspace/out.csv", "out.csv", Some("text/csv"))
            .await
            .unwrap();
        assert_eq!(
            artifact.download_url.as_deref().unwrap(),
            "https://files.example.com/workspace/out.csv"
        );
        assert_eq!(artifact.content_type, "text/csv");
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_records_reason() {
        let (_runner, _dir, manager) = manager();
        let session = manager.create_session("u1", None, None, None, None);
        manager.provision(&session.id).await.unwrap();

        let terminated = manager
            .terminate(&session.id, Some("idle_timeout"))
            .await
            .unwrap();
        assert_eq!(terminated.status, SessionStatus::Terminated);
        assert_eq!(
            terminated.metadata.get(METADATA_TERMINATED_REASON).unwrap(),
            "idle_timeout"
        );

        // Second terminate is a no-op.
        let again = manager.terminate(&session.id, Some("other")).await.unwrap();
        assert_eq!(
            again.metadata.get(METADATA_TERMINATED_REASON).unwrap(),
            "idle_timeout"
        );
    }

    #[tokio::test]
    async fn screenshot_refuses_dry_run() {
        let (_runner, _dir, manager) = manager();
        let session = manager.create_session("u1", None, None, None, None);
        manager.provision(&session.id).await.unwrap();
        assert!(matches!(
            manager.capture_screenshot(&session.id).await,
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn workspace_path_validation() {
        assert!(validate_workspace_path("/workspace", "/workspace/a.txt").is_ok());
        assert!(validate_workspace_path("/workspace", "/workspace").is_ok());
        assert!(validate_workspace_path("/workspace", "/workspaces/a.txt").is_err());
        assert!(validate_workspace_path("/workspace", "relative.txt").is_err());
        assert!(validate_workspace_path("/workspace", "/workspace/../etc").is_err());
    }
}
