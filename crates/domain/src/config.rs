//! Configuration for the AstraForge core.
//!
//! Loaded from `astraforge.toml` with serde defaults for every field, then
//! overridden by the contractual environment variables (`SANDBOX_*`,
//! `COMPUTER_USE_*`, `ASTRAFORGE_EXECUTE_COMMANDS`, `RUN_LOG_*`).
//! `Config::validate()` reports issues without aborting — the caller decides
//! whether errors are fatal.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::session::SandboxBackend;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub snapshots: SnapshotConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub computer_use: ComputerUseConfig,
    #[serde(default)]
    pub quotas: QuotaConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Per-IP rate limiting. `None` disables it.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default = "d_256")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            cors: CorsConfig::default(),
            rate_limit: None,
            max_concurrent_requests: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed for CORS. Use `["*"]` for permissive (NOT recommended).
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: u64,
    pub burst_size: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace / state paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root for durable state (session/conversation JSONL, checkpoints,
    /// event logs).
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Default runtime backend for new sessions.
    #[serde(default)]
    pub backend: SandboxBackend,
    #[serde(default = "d_image")]
    pub image: String,
    #[serde(default = "d_workspace_path")]
    pub workspace_path: String,
    /// Whether commands actually reach the host runtime. `false` is the
    /// development default: every command reports success without running.
    #[serde(default)]
    pub execute_commands: bool,
    #[serde(default = "d_idle_timeout")]
    pub idle_timeout_sec: u64,
    #[serde(default = "d_max_lifetime")]
    pub max_lifetime_sec: u64,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Local,
            image: d_image(),
            workspace_path: d_workspace_path(),
            execute_commands: false,
            idle_timeout_sec: d_idle_timeout(),
            max_lifetime_sec: d_max_lifetime(),
            docker: DockerConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DockerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "d_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default = "d_180")]
    pub startup_timeout_sec: u64,
    #[serde(default = "d_2")]
    pub poll_interval_sec: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: d_namespace(),
            service_account: None,
            startup_timeout_sec: 180,
            poll_interval_sec: 2,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshots / object store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SnapshotConfig {
    /// Object-store offload. `None` keeps archives in-sandbox only.
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    /// S3-compatible HTTP endpoint. Absent means a local directory store
    /// rooted at `local_dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_dir: Option<PathBuf>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Backlog size replayed to newly attached subscribers.
    #[serde(default = "d_backlog")]
    pub backlog: usize,
    /// Topic retention after the last publish.
    #[serde(default = "d_retention")]
    pub retention_sec: u64,
    /// SSE idle heartbeat interval.
    #[serde(default = "d_15")]
    pub heartbeat_sec: u64,
    /// Durable stream log directory. `None` keeps topics memory-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            backlog: d_backlog(),
            retention_sec: d_retention(),
            heartbeat_sec: 15,
            log_dir: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent / LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// OpenAI-compatible base URL for the model endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Env var holding the provider API key (read at startup, never stored).
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_model")]
    pub model: String,
    /// Hard cap on graph iterations per dispatch.
    #[serde(default = "d_100")]
    pub max_steps: u32,
    #[serde(default = "d_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: d_api_key_env(),
            model: d_model(),
            max_steps: 100,
            request_timeout_ms: d_timeout_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Computer use
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    Auto,
    OnRisk,
    Always,
}

impl Default for ApprovalMode {
    fn default() -> Self {
        Self::Auto
    }
}

impl ApprovalMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "on_risk" => Some(Self::OnRisk),
            "always" => Some(Self::Always),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputerUseConfig {
    #[serde(default = "d_trace_dir")]
    pub trace_dir: PathBuf,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    #[serde(default)]
    pub allow_login: bool,
    #[serde(default)]
    pub allow_payments: bool,
    #[serde(default)]
    pub allow_irreversible: bool,
    #[serde(default)]
    pub allow_credentials: bool,
    /// Unknown schemes and empty allowlists deny by default.
    #[serde(default = "d_true")]
    pub default_deny: bool,
    #[serde(default = "d_true")]
    pub prompt_injection_detection: bool,
}

impl Default for ComputerUseConfig {
    fn default() -> Self {
        Self {
            trace_dir: d_trace_dir(),
            approval_mode: ApprovalMode::Auto,
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            allow_login: false,
            allow_payments: false,
            allow_irreversible: false,
            allow_credentials: false,
            default_deny: true,
            prompt_injection_detection: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Quotas & reaper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// `None` = unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_month: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrent_sandboxes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandboxes_per_month: Option<u64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            requests_per_month: None,
            concurrent_sandboxes: Some(5),
            sandboxes_per_month: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "d_60")]
    pub interval_sec: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self { interval_sec: 60 }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    pub fn from_toml(text: &str) -> crate::Result<Self> {
        toml::from_str(text).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Apply the contractual environment overrides on top of the file
    /// config. Unknown or unparsable values are ignored with the file value
    /// left in place.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("SANDBOX_IMAGE") {
            if !v.is_empty() {
                self.sandbox.image = v;
            }
        }
        if let Ok(v) = std::env::var("SANDBOX_DOCKER_NETWORK") {
            if !v.is_empty() {
                self.sandbox.docker.network = Some(v);
            }
        }
        if let Ok(v) = std::env::var("SANDBOX_DOCKER_USER") {
            if !v.is_empty() {
                self.sandbox.docker.user = Some(v);
            }
        }
        if let Ok(v) = std::env::var("SANDBOX_DOCKER_READ_ONLY") {
            self.sandbox.docker.read_only = env_truthy(&v);
        }
        if let Ok(v) = std::env::var("SANDBOX_DOCKER_PIDS_LIMIT") {
            if let Ok(n) = v.parse() {
                self.sandbox.docker.pids_limit = Some(n);
            }
        }
        if let Ok(v) = std::env::var("ASTRAFORGE_EXECUTE_COMMANDS") {
            self.sandbox.execute_commands = env_truthy(&v);
        }
        if let Ok(bucket) = std::env::var("SANDBOX_S3_BUCKET") {
            if !bucket.is_empty() {
                self.snapshots.object_store = Some(ObjectStoreConfig {
                    bucket,
                    endpoint: std::env::var("SANDBOX_S3_ENDPOINT").ok().filter(|s| !s.is_empty()),
                    access_key: std::env::var("SANDBOX_S3_ACCESS_KEY").ok(),
                    secret_key: std::env::var("SANDBOX_S3_SECRET_KEY").ok(),
                    local_dir: None,
                });
            }
        }
        if let Ok(v) = std::env::var("RUN_LOG_STREAM_MAXLEN") {
            if let Ok(n) = v.parse() {
                self.events.backlog = n;
            }
        }
        if let Ok(v) = std::env::var("RUN_LOG_RETENTION_SECONDS") {
            if let Ok(n) = v.parse() {
                self.events.retention_sec = n;
            }
        }
        if let Ok(v) = std::env::var("COMPUTER_USE_TRACE_DIR") {
            if !v.is_empty() {
                self.computer_use.trace_dir = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("COMPUTER_USE_APPROVAL_MODE") {
            if let Some(mode) = ApprovalMode::parse(&v) {
                self.computer_use.approval_mode = mode;
            }
        }
        if let Ok(v) = std::env::var("COMPUTER_USE_ALLOWED_DOMAINS") {
            self.computer_use.allowed_domains = split_csv(&v);
        }
        if let Ok(v) = std::env::var("COMPUTER_USE_BLOCKED_DOMAINS") {
            self.computer_use.blocked_domains = split_csv(&v);
        }
        if let Ok(v) = std::env::var("COMPUTER_USE_ALLOW_LOGIN") {
            self.computer_use.allow_login = env_truthy(&v);
        }
        if let Ok(v) = std::env::var("COMPUTER_USE_ALLOW_PAYMENTS") {
            self.computer_use.allow_payments = env_truthy(&v);
        }
        if let Ok(v) = std::env::var("COMPUTER_USE_ALLOW_IRREVERSIBLE") {
            self.computer_use.allow_irreversible = env_truthy(&v);
        }
        if let Ok(v) = std::env::var("COMPUTER_USE_ALLOW_CREDENTIALS") {
            self.computer_use.allow_credentials = env_truthy(&v);
        }
    }

    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.sandbox.image.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "sandbox.image must not be empty".into(),
            });
        }
        if !self.sandbox.workspace_path.starts_with('/') {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: format!(
                    "sandbox.workspace_path must be absolute, got {:?}",
                    self.sandbox.workspace_path
                ),
            });
        }
        if self.events.backlog == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "events.backlog must be > 0".into(),
            });
        }
        if !self.sandbox.execute_commands {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "command execution is disabled (dry-run) — set \
                          ASTRAFORGE_EXECUTE_COMMANDS=1 for real sandboxes"
                    .into(),
            });
        }
        if let Some(store) = &self.snapshots.object_store {
            if store.endpoint.is_none() && store.local_dir.is_none() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    message: "snapshots.object_store needs an endpoint or a local_dir".into(),
                });
            }
        }
        if self.computer_use.allowed_domains.is_empty() && self.computer_use.default_deny {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "computer_use.allowed_domains is empty — every external \
                          navigation will be blocked"
                    .into(),
            });
        }
        issues
    }
}

fn env_truthy(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn split_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ── Serde default helpers ──────────────────────────────────────────

fn d_port() -> u16 {
    8040
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:*".into(),
        "http://127.0.0.1:*".into(),
    ]
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data/state")
}
fn d_image() -> String {
    "astraforge/sandbox:latest".into()
}
fn d_workspace_path() -> String {
    "/workspace".into()
}
fn d_idle_timeout() -> u64 {
    300
}
fn d_max_lifetime() -> u64 {
    3600
}
fn d_namespace() -> String {
    "default".into()
}
fn d_backlog() -> usize {
    512
}
fn d_retention() -> u64 {
    6 * 60 * 60
}
fn d_trace_dir() -> PathBuf {
    PathBuf::from("./data/computer-use")
}
fn d_api_key_env() -> String {
    "ASTRAFORGE_LLM_API_KEY".into()
}
fn d_model() -> String {
    "gpt-4o".into()
}
fn d_timeout_ms() -> u64 {
    120_000
}
fn d_true() -> bool {
    true
}
fn d_2() -> u64 {
    2
}
fn d_15() -> u64 {
    15
}
fn d_60() -> u64 {
    60
}
fn d_100() -> u32 {
    100
}
fn d_180() -> u64 {
    180
}
fn d_256() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.events.backlog, 512);
        assert_eq!(config.events.retention_sec, 6 * 60 * 60);
        assert_eq!(config.sandbox.workspace_path, "/workspace");
        assert_eq!(config.sandbox.idle_timeout_sec, 300);
        assert!(!config.sandbox.execute_commands);
        assert_eq!(config.computer_use.approval_mode, ApprovalMode::Auto);
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.port, 8040);
    }

    #[test]
    fn toml_sections_override_defaults() {
        let config = Config::from_toml(
            r#"
            [sandbox]
            backend = "cluster"
            image = "demo-sandbox:latest"

            [events]
            backlog = 64

            [server.rate_limit]
            requests_per_second = 10
            burst_size = 20
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.image, "demo-sandbox:latest");
        assert_eq!(
            config.sandbox.backend,
            crate::session::SandboxBackend::Cluster
        );
        assert_eq!(config.events.backlog, 64);
        assert_eq!(config.server.rate_limit.unwrap().requests_per_second, 10);
    }

    #[test]
    fn validate_flags_empty_image() {
        let mut config = Config::default();
        config.sandbox.image.clear();
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("image")));
    }

    #[test]
    fn validate_flags_relative_workspace() {
        let mut config = Config::default();
        config.sandbox.workspace_path = "workspace".into();
        assert!(config
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn approval_mode_parsing() {
        assert_eq!(ApprovalMode::parse("auto"), Some(ApprovalMode::Auto));
        assert_eq!(ApprovalMode::parse("ON_RISK"), Some(ApprovalMode::OnRisk));
        assert_eq!(ApprovalMode::parse("always"), Some(ApprovalMode::Always));
        assert_eq!(ApprovalMode::parse("sometimes"), None);
    }

    #[test]
    fn csv_splitting_trims_and_drops_empties() {
        assert_eq!(
            split_csv("example.com, foo.dev ,,bar.io"),
            vec!["example.com", "foo.dev", "bar.io"]
        );
    }

    #[test]
    fn truthy_values() {
        assert!(env_truthy("1"));
        assert!(env_truthy("true"));
        assert!(env_truthy("YES"));
        assert!(!env_truthy("0"));
        assert!(!env_truthy(""));
    }
}
