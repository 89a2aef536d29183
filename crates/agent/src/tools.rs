//! LLM-callable tools over the sandbox lifecycle manager.
//!
//! Every tool presents a fixed name, description and JSON-schema parameter
//! block to the model, and returns a string outcome capped at a per-tool
//! byte limit. Contract failures (missing file, bad arguments) come back as
//! structured error content inside the result so the agent can react —
//! they are never raised.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use uuid::Uuid;

use af_sandbox::SandboxManager;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct ToolContext {
    pub session_id: Uuid,
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub extras: HashMap<String, String>,
    pub manager: Arc<SandboxManager>,
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub content: String,
    pub artifacts: Option<Value>,
    /// Set by the interactive tools: the run suspends with this
    /// description and waits on the resume inbox.
    pub interrupt: Option<String>,
}

impl ToolOutcome {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Structured tool-contract failure, returned as data.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: serde_json::json!({ "error": message.into() }).to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn parameters(&self) -> Value;
    async fn invoke(&self, ctx: &ToolContext, args: Value) -> ToolOutcome;
}

/// Clamp tool output to its byte budget, marking the cut.
fn cap_output(content: String, cap: usize) -> String {
    if content.len() <= cap {
        return content;
    }
    let mut cut = cap;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[output truncated]", &content[..cut])
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const INTERACTIVE_TOOLS: &[&str] = &["ask_user", "request_takeover"];

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full sandbox tool set bound to a lifecycle manager.
    pub fn sandbox_defaults(search_endpoint: Option<String>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RunShellTool));
        registry.register(Arc::new(ReadFileTool));
        registry.register(Arc::new(WriteFileTool));
        registry.register(Arc::new(ListFilesTool));
        registry.register(Arc::new(BrowserOpenTool));
        registry.register(Arc::new(PythonExecTool));
        registry.register(Arc::new(ViewImageTool));
        registry.register(Arc::new(WebSearchTool::new(search_endpoint)));
        registry.register(Arc::new(AskUserTool));
        registry.register(Arc::new(RequestTakeoverTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.by_name.insert(tool.name().to_string(), self.tools.len());
        self.tools.push(tool);
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }

    pub fn is_interactive(name: &str) -> bool {
        INTERACTIVE_TOOLS.contains(&name)
    }

    pub async fn invoke(&self, ctx: &ToolContext, name: &str, args: Value) -> ToolOutcome {
        match self.by_name.get(name) {
            Some(&idx) => self.tools[idx].invoke(ctx, args).await,
            None => ToolOutcome::error(format!("unknown tool '{name}'")),
        }
    }
}

/// Flat file listing for the observer node (bounded, non-recursive caps).
pub async fn list_files_flat(ctx: &ToolContext) -> Vec<String> {
    let session = match ctx.manager.sessions().get(&ctx.session_id) {
        Some(session) => session,
        None => return Vec::new(),
    };
    let script = format!(
        "find {} -maxdepth 4 -type f 2>/dev/null | head -200",
        session.workspace_path
    );
    match ctx
        .manager
        .execute(&ctx.session_id, &script, None, Some(15), None)
        .await
    {
        Ok(out) if out.exit_code == 0 => out
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shell / files
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RunShellTool;

#[async_trait]
impl Tool for RunShellTool {
    fn name(&self) -> &'static str {
        "run_shell"
    }
    fn description(&self) -> &'static str {
        "Execute a shell command in the sandbox environment."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" },
                "cwd": { "type": "string" },
                "timeout_sec": { "type": "integer" }
            },
            "required": ["command"]
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: Value) -> ToolOutcome {
        let Some(command) = str_arg(&args, "command") else {
            return ToolOutcome::error("run_shell requires a 'command' argument");
        };
        let cwd = str_arg(&args, "cwd");
        let timeout = args
            .get("timeout_sec")
            .and_then(|t| t.as_u64())
            .unwrap_or(120);
        match ctx
            .manager
            .execute(&ctx.session_id, command, cwd, Some(timeout), None)
            .await
        {
            Ok(out) if out.exit_code == 124 => {
                ToolOutcome::error(format!("command timed out after {timeout}s"))
            }
            Ok(out) => ToolOutcome::text(cap_output(
                format!(
                    "Exit Code: {}\nStdout: {}\nStderr: {}",
                    out.exit_code, out.stdout, out.stderr
                ),
                16 * 1024,
            )),
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }
    fn description(&self) -> &'static str {
        "Read the content of a file in the sandbox workspace."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: Value) -> ToolOutcome {
        let Some(path) = str_arg(&args, "path") else {
            return ToolOutcome::error("read_file requires a 'path' argument");
        };
        match ctx.manager.read_file(&ctx.session_id, path).await {
            Ok(bytes) => {
                ToolOutcome::text(cap_output(String::from_utf8_lossy(&bytes).into_owned(), 64 * 1024))
            }
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_file"
    }
    fn description(&self) -> &'static str {
        "Write content to a file in the sandbox workspace."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: Value) -> ToolOutcome {
        let Some(path) = str_arg(&args, "path") else {
            return ToolOutcome::error("write_file requires a 'path' argument");
        };
        let content = args
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        match ctx
            .manager
            .upload(&ctx.session_id, path, content.as_bytes())
            .await
        {
            Ok(()) => ToolOutcome::text(format!("Successfully wrote to {path}")),
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &'static str {
        "list_files"
    }
    fn description(&self) -> &'static str {
        "List files under a directory in the sandbox workspace."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } }
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: Value) -> ToolOutcome {
        let path = str_arg(&args, "path").unwrap_or(".").to_string();
        match ctx
            .manager
            .execute(
                &ctx.session_id,
                &format!("ls -R {path}"),
                None,
                Some(15),
                None,
            )
            .await
        {
            Ok(out) => ToolOutcome::text(cap_output(
                format!(
                    "Exit Code: {}\nStdout: {}\nStderr: {}",
                    out.exit_code, out.stdout, out.stderr
                ),
                16 * 1024,
            )),
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Browser / search / python
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct BrowserOpenTool;

#[async_trait]
impl Tool for BrowserOpenTool {
    fn name(&self) -> &'static str {
        "browser_open"
    }
    fn description(&self) -> &'static str {
        "Fetch a URL from inside the sandbox and return the page text."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "url": { "type": "string" } },
            "required": ["url"]
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: Value) -> ToolOutcome {
        let Some(url) = str_arg(&args, "url") else {
            return ToolOutcome::error("browser_open requires a 'url' argument");
        };
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return ToolOutcome::error(format!("unsupported URL scheme in {url:?}"));
        }
        let script = format!(
            "curl -sL --max-time 20 {} | head -c 32768",
            af_sandbox::runtime::shell_quote(url)
        );
        match ctx
            .manager
            .execute(&ctx.session_id, &script, None, Some(30), None)
            .await
        {
            Ok(out) if out.exit_code == 0 => ToolOutcome::text(cap_output(out.stdout, 32 * 1024)),
            Ok(out) => ToolOutcome::error(format!("fetch failed: {}", out.combined().trim())),
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

struct PythonExecTool;

#[async_trait]
impl Tool for PythonExecTool {
    fn name(&self) -> &'static str {
        "python_exec"
    }
    fn description(&self) -> &'static str {
        "Run a Python snippet in the sandbox and return its output."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "code": { "type": "string" } },
            "required": ["code"]
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: Value) -> ToolOutcome {
        let Some(code) = str_arg(&args, "code") else {
            return ToolOutcome::error("python_exec requires a 'code' argument");
        };
        // Ship the snippet base64-encoded so quoting never breaks it.
        let encoded = BASE64.encode(code.as_bytes());
        let script = format!("echo '{encoded}' | base64 -d | python3 -");
        match ctx
            .manager
            .execute(&ctx.session_id, &script, None, Some(120), None)
            .await
        {
            Ok(out) => ToolOutcome::text(cap_output(
                format!(
                    "Exit Code: {}\nStdout: {}\nStderr: {}",
                    out.exit_code, out.stdout, out.stderr
                ),
                16 * 1024,
            )),
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

struct WebSearchTool {
    endpoint: Option<String>,
    client: reqwest::Client,
}

impl WebSearchTool {
    fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        "web_search"
    }
    fn description(&self) -> &'static str {
        "Search the web and return the top results."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: Value) -> ToolOutcome {
        let Some(query) = str_arg(&args, "query") else {
            return ToolOutcome::error("web_search requires a 'query' argument");
        };
        let Some(endpoint) = &self.endpoint else {
            return ToolOutcome::error("no search provider is configured");
        };
        let api_key = ctx.extras.get("search_api_key").cloned().unwrap_or_default();
        let body = serde_json::json!({ "query": query, "max_results": 5, "api_key": api_key });
        match self.client.post(endpoint).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(payload) => ToolOutcome::text(cap_output(payload.to_string(), 16 * 1024)),
                Err(e) => ToolOutcome::error(format!("search response undecodable: {e}")),
            },
            Ok(resp) => ToolOutcome::error(format!("search returned {}", resp.status())),
            Err(e) => ToolOutcome::error(format!("search request failed: {e}")),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Images
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn mime_for(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

struct ViewImageTool;

#[async_trait]
impl Tool for ViewImageTool {
    fn name(&self) -> &'static str {
        "view_image"
    }
    fn description(&self) -> &'static str {
        "Load an image from the sandbox so the model can inspect it."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: Value) -> ToolOutcome {
        let Some(path) = str_arg(&args, "path") else {
            return ToolOutcome::error("view_image requires a 'path' argument");
        };
        let mime = mime_for(path);
        if mime == "application/octet-stream" {
            return ToolOutcome::error(format!("{path} does not look like an image"));
        }
        match ctx.manager.read_file(&ctx.session_id, path).await {
            Ok(bytes) => {
                let data_url = format!("data:{mime};base64,{}", BASE64.encode(&bytes));
                let payload = serde_json::json!([
                    { "type": "text", "text": format!("Image loaded from {path}") },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ]);
                ToolOutcome::text(payload.to_string())
            }
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Interactive tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct AskUserTool;

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &'static str {
        "ask_user"
    }
    fn description(&self) -> &'static str {
        "Ask the user a question and wait for their reply. Optionally offer choices."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "question": { "type": "string" },
                "choices": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["question"]
        })
    }

    async fn invoke(&self, _ctx: &ToolContext, args: Value) -> ToolOutcome {
        let question = str_arg(&args, "question").unwrap_or("Agent is waiting for your response.");
        let mut description = question.to_string();
        if let Some(choices) = args.get("choices").and_then(|c| c.as_array()) {
            let rendered: Vec<&str> = choices.iter().filter_map(|c| c.as_str()).collect();
            if !rendered.is_empty() {
                description.push_str(&format!(" Choices: {}", rendered.join(", ")));
            }
        }
        ToolOutcome {
            content: description.clone(),
            artifacts: None,
            interrupt: Some(description),
        }
    }
}

struct RequestTakeoverTool;

#[async_trait]
impl Tool for RequestTakeoverTool {
    fn name(&self) -> &'static str {
        "request_takeover"
    }
    fn description(&self) -> &'static str {
        "Request the user to take control when facing a login, CAPTCHA, or an interaction the agent cannot handle."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "reason": { "type": "string" } },
            "required": ["reason"]
        })
    }

    async fn invoke(&self, _ctx: &ToolContext, args: Value) -> ToolOutcome {
        let reason = str_arg(&args, "reason").unwrap_or("manual intervention required");
        let description = format!("TAKEOVER_REQUESTED: {reason}");
        ToolOutcome {
            content: description.clone(),
            artifacts: None,
            interrupt: Some(description),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_domain::config::{DockerConfig, SandboxConfig};
    use af_sandbox::lifecycle::SandboxExecutor;
    use af_sandbox::runner::CommandRunner;
    use af_sandbox::runtime::docker::DockerAdapter;
    use af_sandbox::snapshot::SnapshotStore;
    use af_sandbox::store::{ArtifactStore, SessionStore};

    fn context() -> (tempfile::TempDir, Arc<CommandRunner>, ToolContext) {
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
        let manager = Arc::new(SandboxManager::new(
            executor,
            sessions,
            snapshots,
            artifacts,
            SandboxConfig::default(),
        ));
        let session = manager.create_session("u1", None, None, None, None);
        let ctx = ToolContext {
            session_id: session.id,
            user_id: "u1".into(),
            workspace_id: None,
            extras: HashMap::new(),
            manager,
        };
        (dir, runner, ctx)
    }

    #[tokio::test]
    async fn registry_exposes_all_tools() {
        let registry = ToolRegistry::sandbox_defaults(None);
        let names: Vec<String> = registry
            .definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        for expected in [
            "run_shell",
            "read_file",
            "write_file",
            "list_files",
            "browser_open",
            "python_exec",
            "view_image",
            "web_search",
            "ask_user",
            "request_takeover",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_structured_error() {
        let registry = ToolRegistry::sandbox_defaults(None);
        let (_dir, _runner, ctx) = context();
        let outcome = registry.invoke(&ctx, "no_such_tool", Value::Null).await;
        assert!(outcome.content.contains("unknown tool"));
        assert!(outcome.interrupt.is_none());
    }

    #[tokio::test]
    async fn run_shell_formats_exit_and_streams() {
        let registry = ToolRegistry::sandbox_defaults(None);
        let (_dir, runner, ctx) = context();
        let outcome = registry
            .invoke(
                &ctx,
                "run_shell",
                serde_json::json!({"command": "echo hello"}),
            )
            .await;
        assert!(outcome.content.starts_with("Exit Code: 0"));
        // The command went through the sandbox exec wrapper with a timeout.
        let script = runner.recorded().last().unwrap().last().unwrap().clone();
        assert!(script.contains("timeout 120 echo hello"));
    }

    #[tokio::test]
    async fn run_shell_requires_command() {
        let registry = ToolRegistry::sandbox_defaults(None);
        let (_dir, _runner, ctx) = context();
        let outcome = registry
            .invoke(&ctx, "run_shell", serde_json::json!({}))
            .await;
        assert!(outcome.content.contains("error"));
    }

    #[tokio::test]
    async fn write_file_rejects_paths_outside_workspace() {
        let registry = ToolRegistry::sandbox_defaults(None);
        let (_dir, _runner, ctx) = context();
        let outcome = registry
            .invoke(
                &ctx,
                "write_file",
                serde_json::json!({"path": "/etc/passwd", "content": "x"}),
            )
            .await;
        assert!(outcome.content.contains("error"));
    }

    #[tokio::test]
    async fn ask_user_raises_an_interrupt_with_choices() {
        let registry = ToolRegistry::sandbox_defaults(None);
        let (_dir, _runner, ctx) = context();
        let outcome = registry
            .invoke(
                &ctx,
                "ask_user",
                serde_json::json!({"question": "PDF or PowerPoint?", "choices": ["PDF", "PowerPoint"]}),
            )
            .await;
        let description = outcome.interrupt.expect("interactive tool interrupts");
        assert!(description.contains("PDF or PowerPoint?"));
        assert!(description.contains("Choices: PDF, PowerPoint"));
    }

    #[tokio::test]
    async fn request_takeover_marks_reason() {
        let registry = ToolRegistry::sandbox_defaults(None);
        let (_dir, _runner, ctx) = context();
        let outcome = registry
            .invoke(
                &ctx,
                "request_takeover",
                serde_json::json!({"reason": "CAPTCHA on checkout page"}),
            )
            .await;
        assert_eq!(
            outcome.interrupt.as_deref(),
            Some("TAKEOVER_REQUESTED: CAPTCHA on checkout page")
        );
    }

    #[tokio::test]
    async fn browser_open_rejects_non_http() {
        let registry = ToolRegistry::sandbox_defaults(None);
        let (_dir, _runner, ctx) = context();
        let outcome = registry
            .invoke(
                &ctx,
                "browser_open",
                serde_json::json!({"url": "file:///etc/passwd"}),
            )
            .await;
        assert!(outcome.content.contains("error"));
    }

    #[tokio::test]
    async fn view_image_rejects_non_image_paths() {
        let registry = ToolRegistry::sandbox_defaults(None);
        let (_dir, _runner, ctx) = context();
        let outcome = registry
            .invoke(
                &ctx,
                "view_image",
                serde_json::json!({"path": "/workspace/report.txt"}),
            )
            .await;
        assert!(outcome.content.contains("error"));
    }

    #[test]
    fn interactive_detection() {
        assert!(ToolRegistry::is_interactive("ask_user"));
        assert!(ToolRegistry::is_interactive("request_takeover"));
        assert!(!ToolRegistry::is_interactive("run_shell"));
    }

    #[test]
    fn cap_output_truncates_on_char_boundary() {
        let long = "é".repeat(100);
        let capped = cap_output(long, 11);
        assert!(capped.ends_with("[output truncated]"));
        // 11 bytes would split an 'é'; the cut backs up to a boundary.
        assert!(capped.starts_with(&"é".repeat(5)));
    }

    #[test]
    fn mime_detection() {
        assert_eq!(mime_for("/a/b.PNG"), "image/png");
        assert_eq!(mime_for("shot.jpeg"), "image/jpeg");
        assert_eq!(mime_for("notes.txt"), "application/octet-stream");
    }
}
