//! Local container backend — drives the docker CLI through the command
//! runner.
//!
//! Container names are derived deterministically from the session id
//! (`sandbox-<12 hex>`), so retrying a spawn converges on the same
//! workload. A name conflict is resolved by removing the stale container
//! once and retrying; if the name is still taken, the existing container is
//! adopted when its `session` label matches this session, otherwise the
//! spawn fails.

use std::sync::Arc;

use async_trait::async_trait;

use af_domain::config::DockerConfig;
use af_domain::session::SandboxSession;
use af_domain::{Error, Result};

use crate::runner::{CommandRunner, RunOptions};
use crate::runtime::{
    decode_file_output, read_file_script, short_id, split_ref, with_cwd, write_file_script,
    RuntimeAdapter, RuntimeProbe, SpawnedRuntime, LOCAL_SCHEME,
};

pub struct DockerAdapter {
    runner: Arc<CommandRunner>,
    config: DockerConfig,
    workspace_path: String,
}

impl DockerAdapter {
    pub fn new(runner: Arc<CommandRunner>, config: DockerConfig, workspace_path: String) -> Self {
        Self {
            runner,
            config,
            workspace_path,
        }
    }

    pub fn container_name(session: &SandboxSession) -> String {
        format!("sandbox-{}", short_id(session))
    }

    fn run_args(&self, session: &SandboxSession, name: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "docker".into(),
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "--hostname".into(),
            name.into(),
            "--add-host".into(),
            "host.docker.internal:host-gateway".into(),
            "--label".into(),
            format!("session={}", session.id),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
        ];
        if let Some(cpu) = &session.limits.cpu {
            args.push("--cpus".into());
            args.push(cpu.clone());
        }
        if let Some(memory) = &session.limits.memory {
            args.push("-m".into());
            args.push(memory.clone());
        }
        if let Some(network) = &self.config.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        if let Some(user) = &self.config.user {
            args.push("--user".into());
            args.push(user.clone());
        }
        if let Some(pids) = self.config.pids_limit {
            args.push("--pids-limit".into());
            args.push(pids.to_string());
        }
        if self.config.read_only {
            args.push("--read-only".into());
            args.push("--tmpfs".into());
            args.push(self.workspace_path.clone());
        }
        args.push(session.image.clone());
        args.push("sleep".into());
        args.push("infinity".into());
        args
    }

    async fn try_run(&self, args: &[String]) -> Result<CommandOutcome> {
        let out = self.runner.run(args, RunOptions::allow_failure()).await?;
        if out.exit_code == 0 {
            return Ok(CommandOutcome::Ok);
        }
        let captured = out.combined();
        if captured.contains("Conflict") || captured.contains("already in use") {
            Ok(CommandOutcome::Conflict)
        } else {
            Ok(CommandOutcome::Failed(captured))
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.runner
            .run(
                &[
                    "docker".into(),
                    "rm".into(),
                    "-f".into(),
                    name.to_string(),
                ],
                RunOptions::allow_failure(),
            )
            .await?;
        Ok(())
    }

    /// Read the `session` label of an existing container.
    async fn session_label(&self, name: &str) -> Result<Option<String>> {
        let out = self
            .runner
            .run(
                &[
                    "docker".into(),
                    "inspect".into(),
                    "-f".into(),
                    r#"{{index .Config.Labels "session"}}"#.into(),
                    name.to_string(),
                ],
                RunOptions::allow_failure(),
            )
            .await?;
        if out.exit_code != 0 {
            return Ok(None);
        }
        let label = out.stdout.trim().to_string();
        Ok((!label.is_empty()).then_some(label))
    }

    fn spawned(&self, name: &str) -> SpawnedRuntime {
        let backend_ref = format!("{LOCAL_SCHEME}://{name}");
        SpawnedRuntime {
            control_endpoint: backend_ref.clone(),
            backend_ref,
            workspace_path: self.workspace_path.clone(),
        }
    }
}

enum CommandOutcome {
    Ok,
    Conflict,
    Failed(String),
}

#[async_trait]
impl RuntimeAdapter for DockerAdapter {
    async fn spawn(&self, session: &SandboxSession) -> Result<SpawnedRuntime> {
        let name = Self::container_name(session);
        let args = self.run_args(session, &name);

        match self.try_run(&args).await? {
            CommandOutcome::Ok => return Ok(self.spawned(&name)),
            CommandOutcome::Failed(captured) => {
                return Err(Error::Provision(format!(
                    "docker run failed: {}",
                    captured.trim()
                )))
            }
            CommandOutcome::Conflict => {}
        }

        // Name in use: remove the stale container once and retry.
        tracing::info!(container = %name, "container name conflict, removing and retrying");
        self.remove(&name).await?;
        match self.try_run(&args).await? {
            CommandOutcome::Ok => Ok(self.spawned(&name)),
            CommandOutcome::Failed(captured) => Err(Error::Provision(format!(
                "docker run failed: {}",
                captured.trim()
            ))),
            CommandOutcome::Conflict => {
                // Still conflicting — adopt only if the container belongs to
                // this session.
                match self.session_label(&name).await? {
                    Some(label) if label == session.id.to_string() => {
                        tracing::info!(container = %name, "adopting existing container");
                        Ok(self.spawned(&name))
                    }
                    other => Err(Error::Provision(format!(
                        "container {name} exists but belongs to session {other:?}"
                    ))),
                }
            }
        }
    }

    fn exec_in(&self, backend_ref: &str, script: &str, cwd: Option<&str>) -> Result<Vec<String>> {
        let (_, name) = split_ref(backend_ref);
        Ok(vec![
            "docker".into(),
            "exec".into(),
            name.to_string(),
            "sh".into(),
            "-c".into(),
            with_cwd(script, cwd),
        ])
    }

    async fn copy_in(&self, backend_ref: &str, path: &str, bytes: &[u8]) -> Result<()> {
        let argv = self.exec_in(backend_ref, &write_file_script(path, bytes), None)?;
        let out = self.runner.run(&argv, RunOptions::allow_failure()).await?;
        if out.exit_code != 0 {
            return Err(Error::Other(format!(
                "copy into {path} failed: {}",
                out.combined().trim()
            )));
        }
        Ok(())
    }

    async fn read_file(&self, backend_ref: &str, path: &str) -> Result<Vec<u8>> {
        let argv = self.exec_in(backend_ref, &read_file_script(path), None)?;
        let out = self.runner.run(&argv, RunOptions::allow_failure()).await?;
        if out.exit_code != 0 {
            return Err(Error::NotFound(format!(
                "failed to read {path}: {}",
                out.combined().trim()
            )));
        }
        decode_file_output(path, &out.stdout)
    }

    async fn destroy(&self, backend_ref: &str) -> Result<()> {
        let (_, name) = split_ref(backend_ref);
        self.remove(name).await
    }

    async fn inspect(&self, backend_ref: &str) -> Result<RuntimeProbe> {
        let (_, name) = split_ref(backend_ref);
        // Dry-run mode has no containers to probe; report healthy so the
        // rest of the lifecycle behaves as if the spawn had succeeded.
        if self.runner.is_dry_run() {
            return Ok(RuntimeProbe {
                exists: true,
                running: true,
            });
        }
        let out = self
            .runner
            .run(
                &[
                    "docker".into(),
                    "inspect".into(),
                    "-f".into(),
                    "{{.State.Running}}".into(),
                    name.to_string(),
                ],
                RunOptions::allow_failure(),
            )
            .await?;
        if out.exit_code != 0 {
            return Ok(RuntimeProbe {
                exists: false,
                running: false,
            });
        }
        Ok(RuntimeProbe {
            exists: true,
            running: out.stdout.trim() == "true",
        })
    }
}
