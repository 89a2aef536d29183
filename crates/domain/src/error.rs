use uuid::Uuid;

/// Shared error type used across all AstraForge crates.
///
/// Kinds map one-to-one onto the failure modes of the orchestrator:
/// configuration problems surface synchronously and are never retried;
/// provision failures move the session to `failed`; command failures carry
/// the exit code and captured output verbatim.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("config: {0}")]
    Config(String),

    #[error("provision failed: {0}")]
    Provision(String),

    #[error("sandbox {0} is not ready")]
    SandboxNotReady(Uuid),

    #[error("command {argv:?} exited with code {exit_code}")]
    CommandFailed {
        argv: Vec<String>,
        exit_code: i32,
        captured: String,
    },

    #[error("command {argv:?} timed out after {timeout_sec}s")]
    Timeout { argv: Vec<String>, timeout_sec: u64 },

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("blocked by policy: {0}")]
    PolicyBlock(String),

    #[error("requires operator acknowledgement: {0}")]
    PolicyRequireAck(String),

    #[error("malformed stream entry: {0}")]
    StreamMalformed(String),

    #[error("checkpointer unavailable: {0}")]
    CheckpointUnavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("auth: {0}")]
    Auth(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the caller may retry the failed operation. Provision errors
    /// are retriable (the controller retries once with a restore); command
    /// failures and config errors are not.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Provision(_) | Self::Http(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_display_includes_argv_and_code() {
        let err = Error::CommandFailed {
            argv: vec!["echo".into(), "hi".into()],
            exit_code: 2,
            captured: "boom".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("echo"));
        assert!(msg.contains('2'));
    }

    #[test]
    fn provision_is_retriable_command_is_not() {
        assert!(Error::Provision("image pull".into()).is_retriable());
        assert!(!Error::CommandFailed {
            argv: vec![],
            exit_code: 1,
            captured: String::new(),
        }
        .is_retriable());
        assert!(!Error::Config("missing image".into()).is_retriable());
    }
}
