//! Runtime adapters — translate logical sandbox operations into
//! runtime-specific command vectors (docker CLI) or API calls (kubernetes).
//!
//! Both backends honor the same idempotency contract: spawning with the
//! same session identity is a no-op when the prior workload is healthy.

pub mod cluster;
pub mod docker;

use async_trait::async_trait;

use af_domain::session::SandboxSession;
use af_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct SpawnedRuntime {
    /// `local://<name>` or `cluster://<namespace>/<pod>`.
    pub backend_ref: String,
    pub control_endpoint: String,
    pub workspace_path: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeProbe {
    pub exists: bool,
    pub running: bool,
}

#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Provision (or adopt) the workload for a session.
    async fn spawn(&self, session: &SandboxSession) -> Result<SpawnedRuntime>;

    /// Pure argv wrapping: the returned vector is suitable for the command
    /// runner and executes `script` inside the workload (with an optional
    /// `cd` prefix).
    fn exec_in(&self, backend_ref: &str, script: &str, cwd: Option<&str>) -> Result<Vec<String>>;

    /// Write bytes to a path inside the workload.
    async fn copy_in(&self, backend_ref: &str, path: &str, bytes: &[u8]) -> Result<()>;

    /// Read file bytes out of the workload.
    async fn read_file(&self, backend_ref: &str, path: &str) -> Result<Vec<u8>>;

    /// Best-effort teardown. Missing workloads are not an error.
    async fn destroy(&self, backend_ref: &str) -> Result<()>;

    async fn inspect(&self, backend_ref: &str) -> Result<RuntimeProbe>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ref parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const LOCAL_SCHEME: &str = "local";
pub const CLUSTER_SCHEME: &str = "cluster";

/// Split a backend ref into `(scheme, identifier)`. A bare identifier is
/// treated as a local container name.
pub fn split_ref(backend_ref: &str) -> (&str, &str) {
    match backend_ref.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => (LOCAL_SCHEME, backend_ref),
    }
}

/// Split a cluster identifier into `(namespace, pod)`.
pub fn split_cluster_ident(ident: &str) -> Result<(&str, &str)> {
    ident
        .split_once('/')
        .filter(|(ns, pod)| !ns.is_empty() && !pod.is_empty())
        .ok_or_else(|| Error::Other(format!("malformed cluster ref {ident:?}")))
}

/// Deterministic short identifier derived from the session id. The same
/// session always maps to the same workload name, which is what makes
/// spawn idempotent across retries.
pub fn short_id(session: &SandboxSession) -> String {
    session.id.simple().to_string()[..12].to_string()
}

/// Quote a string for safe interpolation into `sh -c`.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Prefix a script with a `cd` when a working directory is given.
pub fn with_cwd(script: &str, cwd: Option<&str>) -> String {
    match cwd {
        Some(dir) => format!("cd {} && {}", shell_quote(dir), script),
        None => script.to_string(),
    }
}

/// Script that writes base64-shipped bytes to a path, creating the parent
/// directory first.
pub(crate) fn write_file_script(path: &str, bytes: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    let directory = match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    };
    format!(
        "mkdir -p {} && echo '{}' | base64 -d > {}",
        shell_quote(&directory),
        BASE64.encode(bytes),
        shell_quote(path)
    )
}

/// Script that prints a file as base64.
pub(crate) fn read_file_script(path: &str) -> String {
    format!("base64 < {}", shell_quote(path))
}

/// Decode the output of [`read_file_script`], tolerating line wrapping.
pub(crate) fn decode_file_output(path: &str, stdout: &str) -> Result<Vec<u8>> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    let raw: String = stdout.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64
        .decode(raw.as_bytes())
        .map_err(|e| Error::Other(format!("undecodable file payload for {path}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_domain::session::SandboxBackend;

    #[test]
    fn split_ref_handles_schemes() {
        assert_eq!(split_ref("local://sandbox-abc"), ("local", "sandbox-abc"));
        assert_eq!(
            split_ref("cluster://sandboxes/af-sandbox-abc"),
            ("cluster", "sandboxes/af-sandbox-abc")
        );
        assert_eq!(split_ref("sandbox-abc"), ("local", "sandbox-abc"));
    }

    #[test]
    fn split_cluster_ident_requires_namespace_and_pod() {
        assert_eq!(
            split_cluster_ident("ns/pod-1").unwrap(),
            ("ns", "pod-1")
        );
        assert!(split_cluster_ident("pod-only").is_err());
        assert!(split_cluster_ident("/pod").is_err());
    }

    #[test]
    fn short_id_is_stable() {
        let session = SandboxSession::new("u", SandboxBackend::Local, "img");
        assert_eq!(short_id(&session), short_id(&session));
        assert_eq!(short_id(&session).len(), 12);
    }

    #[test]
    fn shell_quote_leaves_safe_strings() {
        assert_eq!(shell_quote("/workspace/foo.txt"), "/workspace/foo.txt");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn with_cwd_prefixes_cd() {
        assert_eq!(
            with_cwd("ls", Some("/workspace")),
            "cd /workspace && ls"
        );
        assert_eq!(with_cwd("ls", None), "ls");
    }

    #[test]
    fn write_script_creates_parent_and_decodes() {
        let script = write_file_script("/workspace/uploads/a.txt", b"hi");
        assert!(script.starts_with("mkdir -p /workspace/uploads && "));
        assert!(script.contains("base64 -d > /workspace/uploads/a.txt"));
    }

    #[test]
    fn file_output_round_trip() {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;
        // `base64` inside the sandbox wraps lines; decoding tolerates it.
        let encoded = BASE64.encode(b"alpha\n");
        let wrapped = format!("{}\n{}\n", &encoded[..4], &encoded[4..]);
        assert_eq!(decode_file_output("/f", &wrapped).unwrap(), b"alpha\n");
        assert!(decode_file_output("/f", "!!!").is_err());
    }
}
