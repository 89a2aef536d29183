//! Command runner — executes an argv against the host runtime CLI.
//!
//! Honors a process-wide dry-run switch (`ASTRAFORGE_EXECUTE_COMMANDS`
//! unset/false): in dry-run every command succeeds immediately without
//! touching the host, and the argv is recorded for inspection. In real mode
//! the child is spawned with piped output; each line is forwarded to the
//! optional stream sink as it arrives.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use af_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Entries pushed into the optional stream sink while a command runs.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    Log { message: String },
    Error { message: String },
}

pub type StreamSink = Arc<dyn Fn(RunnerEvent) + Send + Sync>;

#[derive(Default, Clone)]
pub struct RunOptions {
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub stream: Option<StreamSink>,
    pub allow_failure: bool,
}

impl RunOptions {
    pub fn allow_failure() -> Self {
        Self {
            allow_failure: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_sec: f64,
}

impl CommandOutput {
    /// Combined output, stderr appended after stdout — used when callers
    /// only care about "what did the command print".
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}{}", self.stdout, self.stderr)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CommandRunner {
    dry_run: bool,
    /// Argvs observed in dry-run mode, oldest first.
    recorded: Mutex<Vec<Vec<String>>>,
}

impl CommandRunner {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Dry-run unless `ASTRAFORGE_EXECUTE_COMMANDS` is truthy.
    pub fn from_env() -> Self {
        let execute = std::env::var("ASTRAFORGE_EXECUTE_COMMANDS")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self::new(!execute)
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Argvs recorded while in dry-run mode (test/introspection hook).
    pub fn recorded(&self) -> Vec<Vec<String>> {
        self.recorded.lock().clone()
    }

    /// Execute an argv. With `allow_failure` a non-zero exit is returned in
    /// the output; without it the call fails with `CommandFailed` after
    /// pushing a final error entry into the sink.
    pub async fn run(&self, argv: &[String], opts: RunOptions) -> Result<CommandOutput> {
        if argv.is_empty() {
            return Err(Error::Other("empty argv".into()));
        }

        if self.dry_run {
            self.recorded.lock().push(argv.to_vec());
            tracing::debug!(argv = ?argv, "dry-run command");
            return Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration_sec: 0.0,
            });
        }

        let start = Instant::now();
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        if let Some(ref cwd) = opts.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Other(format!("failed to spawn {:?}: {e}", argv[0])))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let sink = opts.stream.clone();
        let stdout_task = tokio::spawn(read_lines(stdout, sink.clone()));
        let stderr_task = tokio::spawn(read_lines(stderr, sink.clone()));

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Other(format!("wait failed: {e}")))?;

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let exit_code = status.code().unwrap_or(-1);

        let output = CommandOutput {
            exit_code,
            stdout,
            stderr,
            duration_sec: start.elapsed().as_secs_f64(),
        };

        if !opts.allow_failure && exit_code != 0 {
            if let Some(sink) = &sink {
                sink(RunnerEvent::Error {
                    message: format!("command exited with code {exit_code}"),
                });
            }
            return Err(Error::CommandFailed {
                argv: argv.to_vec(),
                exit_code,
                captured: output.combined(),
            });
        }

        Ok(output)
    }
}

/// Drain a child pipe line by line, forwarding each line to the sink and
/// returning the accumulated text.
async fn read_lines(
    pipe: Option<impl tokio::io::AsyncRead + Unpin>,
    sink: Option<StreamSink>,
) -> String {
    let mut captured = String::new();
    if let Some(pipe) = pipe {
        let mut reader = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if let Some(sink) = &sink {
                sink(RunnerEvent::Log {
                    message: line.clone(),
                });
            }
            captured.push_str(&line);
            captured.push('\n');
        }
    }
    captured
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn dry_run_succeeds_and_records() {
        let runner = CommandRunner::new(true);
        let out = runner
            .run(&argv(&["docker", "run", "x"]), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(runner.recorded(), vec![argv(&["docker", "run", "x"])]);
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let runner = CommandRunner::new(true);
        assert!(runner.run(&[], RunOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn real_run_captures_stdout() {
        let runner = CommandRunner::new(false);
        let out = runner
            .run(&argv(&["echo", "hello"]), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "");
    }

    #[tokio::test]
    async fn failure_without_allow_failure_is_error() {
        let runner = CommandRunner::new(false);
        let err = runner
            .run(&argv(&["sh", "-c", "exit 3"]), RunOptions::default())
            .await
            .unwrap_err();
        match err {
            af_domain::Error::CommandFailed { exit_code, .. } => assert_eq!(exit_code, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failure_with_allow_failure_returns_output() {
        let runner = CommandRunner::new(false);
        let out = runner
            .run(
                &argv(&["sh", "-c", "echo oops >&2; exit 7"]),
                RunOptions::allow_failure(),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 7);
        assert_eq!(out.stderr, "oops\n");
    }

    #[tokio::test]
    async fn stream_sink_sees_each_line() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = lines.clone();
        let sink: StreamSink = Arc::new(move |event| {
            if let RunnerEvent::Log { message } = event {
                sink_lines.lock().push(message);
            }
        });

        let runner = CommandRunner::new(false);
        let opts = RunOptions {
            stream: Some(sink),
            ..RunOptions::default()
        };
        runner
            .run(&argv(&["sh", "-c", "echo one; echo two"]), opts)
            .await
            .unwrap();

        let seen = lines.lock().clone();
        assert_eq!(seen, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn cwd_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CommandRunner::new(false);
        let opts = RunOptions {
            cwd: Some(dir.path().to_string_lossy().into_owned()),
            ..RunOptions::default()
        };
        let out = runner.run(&argv(&["pwd"]), opts).await.unwrap();
        assert!(out.stdout.trim().ends_with(
            dir.path()
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
        ));
    }
}
