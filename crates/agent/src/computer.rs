//! Computer-use runner — executes browser-automation decisions under the
//! policy gate, tracing every step.
//!
//! Each loop turn asks the decision provider for the next [`ComputerCall`],
//! evaluates policy, and either executes it against the browser adapter,
//! suspends the run (`awaiting_ack`, pending call persisted for the
//! operator), or ends it (`blocked_policy`). Observations, calls and policy
//! decisions all land on the run's timeline.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use af_domain::computer::{
    ComputerAction, ComputerCall, ExecutionResult, Observation, Viewport,
};
use af_domain::config::ComputerUseConfig;
use af_domain::{Error, Result};
use af_sandbox::SandboxManager;

use crate::policy::{evaluate_policy, is_domain_allowed, Decision};
use crate::trace::TraceWriter;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Browser adapters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait BrowserAdapter: Send + Sync {
    /// Current page state without acting.
    async fn observe(&self) -> Observation;

    /// Execute one action; failures come back inside the observation's
    /// execution result.
    async fn act(&self, call: &ComputerCall) -> Observation;
}

/// In-memory browser for tests and dry runs: tracks the current URL and
/// answers every action with an empty screenshot.
pub struct StubBrowser {
    last_url: Mutex<String>,
}

impl StubBrowser {
    pub fn new() -> Self {
        Self {
            last_url: Mutex::new("about:blank".into()),
        }
    }

    fn observation(&self, call_id: &str) -> Observation {
        Observation {
            call_id: call_id.into(),
            url: self.last_url.lock().clone(),
            viewport: Viewport { w: 1280, h: 720 },
            screenshot_b64: String::new(),
            execution: ExecutionResult::ok(),
        }
    }
}

impl Default for StubBrowser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserAdapter for StubBrowser {
    async fn observe(&self) -> Observation {
        self.observation("observe")
    }

    async fn act(&self, call: &ComputerCall) -> Observation {
        if let ComputerAction::VisitUrl { url } = &call.action {
            *self.last_url.lock() = url.clone();
        }
        self.observation(&call.call_id)
    }
}

/// Browser adapter backed by the automation helper inside the sandbox.
/// Actions are shipped as JSON on stdin; the helper prints one JSON
/// observation line.
pub struct SandboxBrowser {
    manager: Arc<SandboxManager>,
    session_id: Uuid,
    helper: String,
    timeout_sec: u64,
}

impl SandboxBrowser {
    pub fn new(manager: Arc<SandboxManager>, session_id: Uuid) -> Self {
        Self {
            manager,
            session_id,
            helper: "/opt/astraforge/browser_driver.py".into(),
            timeout_sec: 120,
        }
    }

    async fn dispatch(&self, payload: Value, call_id: &str) -> Observation {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        let encoded = BASE64.encode(payload.to_string().as_bytes());
        let script = format!(
            "echo '{encoded}' | base64 -d | python3 {}",
            self.helper
        );
        let out = match self
            .manager
            .execute(&self.session_id, &script, None, Some(self.timeout_sec), None)
            .await
        {
            Ok(out) => out,
            Err(e) => return self.error_observation(call_id, "dispatch", &e.to_string()),
        };
        if out.exit_code != 0 {
            return self.error_observation(call_id, "driver", out.combined().trim());
        }
        match serde_json::from_str::<Observation>(out.stdout.trim()) {
            Ok(observation) => observation,
            Err(e) => self.error_observation(call_id, "decode", &e.to_string()),
        }
    }

    fn error_observation(&self, call_id: &str, error_type: &str, message: &str) -> Observation {
        Observation {
            call_id: call_id.into(),
            url: String::new(),
            viewport: Viewport { w: 0, h: 0 },
            screenshot_b64: String::new(),
            execution: ExecutionResult::error(error_type, message),
        }
    }
}

#[async_trait]
impl BrowserAdapter for SandboxBrowser {
    async fn observe(&self) -> Observation {
        self.dispatch(serde_json::json!({"op": "observe"}), "observe")
            .await
    }

    async fn act(&self, call: &ComputerCall) -> Observation {
        let payload = serde_json::json!({
            "op": "act",
            "call_id": call.call_id,
            "action": serde_json::to_value(&call.action).unwrap_or(Value::Null),
        });
        self.dispatch(payload, &call.call_id).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decision providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DecisionRequest {
    pub goal: String,
    pub observation: Observation,
    pub history: Vec<Value>,
    pub policy_summary: Value,
    pub previous_response_id: Option<String>,
    pub step_index: u32,
}

pub struct DecisionResponse {
    pub response_id: String,
    pub call: ComputerCall,
    pub reasoning_summary: Option<String>,
}

#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn decide(&self, request: DecisionRequest) -> Result<DecisionResponse>;
}

pub fn build_policy_summary(config: &ComputerUseConfig) -> Value {
    serde_json::json!({
        "allowed_domains": config.allowed_domains,
        "blocked_domains": config.blocked_domains,
        "approval_mode": config.approval_mode,
        "allow_login": config.allow_login,
        "allow_payments": config.allow_payments,
        "allow_irreversible": config.allow_irreversible,
        "allow_credentials": config.allow_credentials,
    })
}

/// Replays a fixed action script; past the end it terminates. Caller-set
/// call ids in the script survive verbatim.
pub struct ScriptedDecisions {
    script: Vec<Value>,
}

impl ScriptedDecisions {
    pub fn new(script: Vec<Value>) -> Self {
        Self { script }
    }
}

#[async_trait]
impl DecisionProvider for ScriptedDecisions {
    async fn decide(&self, request: DecisionRequest) -> Result<DecisionResponse> {
        let entry = self
            .script
            .get(request.step_index as usize)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({"action": {"type": "terminate"}}));

        let action: ComputerAction =
            serde_json::from_value(entry.get("action").cloned().unwrap_or(Value::Null))
                .map_err(|e| Error::Other(format!("invalid scripted action: {e}")))?;

        let mut call = ComputerCall::new(action);
        if let Some(id) = entry.get("call_id").and_then(|v| v.as_str()) {
            if !id.is_empty() {
                call.call_id = id.to_string();
            }
        }
        let mut reasoning_summary = None;
        if let Some(meta) = entry.get("meta") {
            call.meta.done = meta.get("done").and_then(|v| v.as_bool()).unwrap_or(false);
            call.meta.critical_point = meta
                .get("critical_point")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            reasoning_summary = meta
                .get("reasoning_summary")
                .and_then(|v| v.as_str())
                .map(String::from);
            call.meta.reasoning_summary = reasoning_summary.clone();
        }

        let response_id = entry
            .get("response_id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| format!("resp_{}", Uuid::new_v4().simple()));

        Ok(DecisionResponse {
            response_id,
            call,
            reasoning_summary,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run state & results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    BlockedPolicy,
    AwaitingAck,
    ExecutionError,
    MaxSteps,
    TimedOut,
    DeniedApproval,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: RunStatus,
    pub stop_reason: Option<String>,
    pub pending_checks: Vec<Value>,
}

impl RunResult {
    fn terminal(status: RunStatus, reason: &str) -> Self {
        Self {
            status,
            stop_reason: Some(reason.to_string()),
            pending_checks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub step_index: u32,
    #[serde(default)]
    pub previous_response_id: Option<String>,
    #[serde(default)]
    pub pending_call: Option<Value>,
    #[serde(default)]
    pub pending_checks: Vec<Value>,
    #[serde(default)]
    pub pending_step_id: Option<String>,
    #[serde(default)]
    pub pending_response_id: Option<String>,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_url: Option<String>,
}

impl RunState {
    fn clear_pending(&mut self) {
        self.pending_call = None;
        self.pending_checks.clear();
        self.pending_step_id = None;
        self.pending_response_id = None;
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_steps: u32,
    pub max_runtime_sec: u64,
    pub failure_threshold: u32,
    pub redact_typed_text: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            max_runtime_sec: 300,
            failure_threshold: 3,
            redact_typed_text: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ComputerUseRunner<'a> {
    pub provider: &'a dyn DecisionProvider,
    pub browser: &'a dyn BrowserAdapter,
    pub policy: &'a ComputerUseConfig,
    pub config: RunnerConfig,
    pub trace: &'a mut TraceWriter,
}

impl<'a> ComputerUseRunner<'a> {
    /// Drive the run until it completes, blocks, suspends for approval, or
    /// errors out. The updated state is always returned for persistence.
    pub async fn run(&mut self, goal: &str, mut state: RunState) -> Result<(RunResult, RunState)> {
        let start = Instant::now();

        let mut observation = match state.pending_call.take() {
            Some(pending) => {
                let Some(observation) = self.resume_pending(pending, &mut state).await? else {
                    return Ok((
                        RunResult::terminal(RunStatus::ExecutionError, "execution_error"),
                        state,
                    ));
                };
                if state.failure_count >= self.config.failure_threshold {
                    return Ok((
                        RunResult::terminal(RunStatus::ExecutionError, "execution_error"),
                        state,
                    ));
                }
                observation
            }
            None => self.browser.observe().await,
        };

        loop {
            if self.config.max_steps > 0 && state.step_index >= self.config.max_steps {
                return Ok((RunResult::terminal(RunStatus::MaxSteps, "max_steps"), state));
            }
            if self.config.max_runtime_sec > 0
                && start.elapsed().as_secs() > self.config.max_runtime_sec
            {
                return Ok((RunResult::terminal(RunStatus::TimedOut, "timed_out"), state));
            }

            let decision = self
                .provider
                .decide(DecisionRequest {
                    goal: goal.to_string(),
                    observation: observation.clone(),
                    history: self.trace.recent_history(),
                    policy_summary: build_policy_summary(self.policy),
                    previous_response_id: state.previous_response_id.clone(),
                    step_index: state.step_index,
                })
                .await?;

            let response_id = decision.response_id;
            let mut call = decision.call;
            call.ensure_call_id();
            if call.meta.reasoning_summary.is_none() {
                call.meta.reasoning_summary = decision.reasoning_summary;
            }

            let call_item = if self.config.redact_typed_text {
                call.to_redacted_json()
            } else {
                full_call_json(&call)?
            };
            self.trace.append_item(call_item)?;

            let policy = evaluate_policy(&call, self.policy);
            self.trace.append_item(policy.to_item())?;

            match policy.decision {
                Decision::Block => {
                    return Ok((
                        RunResult::terminal(RunStatus::BlockedPolicy, "blocked_policy"),
                        state,
                    ));
                }
                Decision::RequireAck => {
                    state.pending_call = Some(full_call_json(&call)?);
                    state.pending_checks = policy
                        .checks
                        .iter()
                        .map(|c| serde_json::to_value(c).unwrap_or(Value::Null))
                        .collect();
                    state.pending_step_id = Some(format!("step_{}", Uuid::new_v4().simple()));
                    state.pending_response_id = Some(response_id);
                    let pending_checks = state.pending_checks.clone();
                    return Ok((
                        RunResult {
                            status: RunStatus::AwaitingAck,
                            stop_reason: None,
                            pending_checks,
                        },
                        state,
                    ));
                }
                Decision::Allow => {}
            }

            let output = self.execute_step(&call, &response_id, &mut state).await?;

            if state.failure_count >= self.config.failure_threshold {
                return Ok((
                    RunResult::terminal(RunStatus::ExecutionError, "execution_error"),
                    state,
                ));
            }

            if call.action.kind() == "terminate" || call.meta.done {
                return Ok((RunResult::terminal(RunStatus::Completed, "completed"), state));
            }

            // A navigation that landed off-policy ends the run even when the
            // action itself was allowed.
            if !output.url.is_empty() && !is_domain_allowed(&output.url, self.policy) {
                return Ok((
                    RunResult::terminal(RunStatus::BlockedPolicy, "blocked_policy"),
                    state,
                ));
            }

            observation = output;
        }
    }

    async fn execute_step(
        &mut self,
        call: &ComputerCall,
        response_id: &str,
        state: &mut RunState,
    ) -> Result<Observation> {
        let output = self.browser.act(call).await;
        self.trace.append_item(observation_item(&output))?;
        let step_id = format!("step_{}", Uuid::new_v4().simple());
        self.trace.write_step(
            state.step_index + 1,
            &step_id,
            call,
            &output,
            response_id,
            self.config.redact_typed_text,
        )?;

        state.step_index += 1;
        state.previous_response_id = Some(response_id.to_string());
        state.last_url = (!output.url.is_empty()).then(|| output.url.clone());
        if output.execution.status == af_domain::computer::ExecutionStatus::Ok {
            state.failure_count = 0;
        } else {
            state.failure_count += 1;
        }
        Ok(output)
    }

    /// Re-execute the acknowledged pending call after operator approval.
    async fn resume_pending(
        &mut self,
        pending: Value,
        state: &mut RunState,
    ) -> Result<Option<Observation>> {
        let Ok(call) = serde_json::from_value::<ComputerCall>(pending) else {
            return Ok(None);
        };
        let response_id = state
            .pending_response_id
            .take()
            .unwrap_or_else(|| format!("resp_{}", Uuid::new_v4().simple()));
        let output = self.execute_step(&call, &response_id, state).await?;
        state.clear_pending();
        Ok(Some(output))
    }
}

fn full_call_json(call: &ComputerCall) -> Result<Value> {
    Ok(serde_json::json!({
        "type": "computer_call",
        "call_id": call.call_id,
        "action": serde_json::to_value(&call.action)?,
        "meta": serde_json::to_value(&call.meta)?,
        "pending_safety_checks": serde_json::to_value(&call.pending_safety_checks)?,
    }))
}

fn observation_item(output: &Observation) -> Value {
    serde_json::json!({
        "type": "computer_call_output",
        "call_id": output.call_id,
        "output": {
            "url": output.url,
            "viewport": serde_json::to_value(output.viewport).unwrap_or(Value::Null),
            "screenshot_b64": output.screenshot_b64,
            "execution": serde_json::to_value(&output.execution).unwrap_or(Value::Null),
        },
    })
}

/// Record an operator decision on pending safety checks. `deny` ends the
/// run; `approve` returns `None` and the caller re-runs (which resumes the
/// pending call).
pub fn apply_acknowledgement(
    trace: &mut TraceWriter,
    state: &mut RunState,
    acknowledged: &[String],
    decision: &str,
) -> Result<Option<RunResult>> {
    trace.append_item(serde_json::json!({
        "type": "acknowledged_safety_checks",
        "acknowledged": acknowledged,
        "decision": decision,
    }))?;

    if decision == "deny" {
        state.clear_pending();
        return Ok(Some(RunResult::terminal(
            RunStatus::DeniedApproval,
            "denied_approval",
        )));
    }
    Ok(None)
}
