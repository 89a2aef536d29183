//! The agent execution graph driver.
//!
//! A cooperatively-scheduled state machine running on one logical thread
//! per session: `planner → agent → tools | interrupt | observer →
//! summarizer → planner`, with a `check_completion` arbiter guarding the
//! terminal transition. After every node the full state is checkpointed;
//! before every node the conversation status is probed so cancellation
//! lands within one node step. Interrupts block on the resume inbox until
//! an operator replies or pushes the cancel sentinel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

use af_domain::event::{Event, EventKind};
use af_domain::session::ConversationStatus;
use af_domain::{Error, Result};
use af_events::{EventBus, ResumeInbox, CANCEL_SENTINEL, USER_DONE_SENTINEL};
use af_sandbox::snapshot::SnapshotOptions;
use af_sandbox::{ConversationStore, SandboxManager};

use crate::checkpoint::Checkpointer;
use crate::llm::{AgentReply, LanguageModel, PlanRequest, StepRequest};
use crate::state::{AgentState, ChatMessage, GraphNode, ToolCall};
use crate::tools::{list_files_flat, ToolContext, ToolRegistry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Typed per-run context threaded through the driver and tools.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub session_id: Uuid,
    pub workspace_id: Option<String>,
    pub user_id: String,
    pub extras: HashMap<String, String>,
}

impl RuntimeContext {
    pub fn new(session_id: Uuid, user_id: impl Into<String>) -> Self {
        Self {
            session_id,
            workspace_id: None,
            user_id: user_id.into(),
            extras: HashMap::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct GraphDriver {
    model: Arc<dyn LanguageModel>,
    tools: Arc<ToolRegistry>,
    manager: Arc<SandboxManager>,
    conversations: Arc<ConversationStore>,
    bus: Arc<dyn EventBus>,
    inbox: Arc<ResumeInbox>,
    checkpointer: Arc<dyn Checkpointer>,
    max_steps: u32,
}

/// How one driver invocation ended.
enum Outcome {
    Finished,
    Cancelled,
}

impl GraphDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Arc<dyn LanguageModel>,
        tools: Arc<ToolRegistry>,
        manager: Arc<SandboxManager>,
        conversations: Arc<ConversationStore>,
        bus: Arc<dyn EventBus>,
        inbox: Arc<ResumeInbox>,
        checkpointer: Arc<dyn Checkpointer>,
        max_steps: u32,
    ) -> Self {
        Self {
            model,
            tools,
            manager,
            conversations,
            bus,
            inbox,
            checkpointer,
            max_steps,
        }
    }

    /// Execute (or resume) the graph for one session until a terminal
    /// transition. `is_resume` re-enters a terminal conversation with a new
    /// goal appended to the checkpointed history.
    pub async fn run(&self, ctx: RuntimeContext, goal: &str, is_resume: bool) -> Result<()> {
        let session_id = ctx.session_id;

        if let Err(e) = self.manager.provision(&session_id).await {
            self.conversations.update(&session_id, |c| {
                c.status = ConversationStatus::Failed;
            });
            self.bus
                .publish(Event::error(session_id, "provision", e.to_string()));
            self.bus.publish(Event::status(session_id, "failed"));
            return Err(e);
        }

        let mut state = self.initial_state(&session_id, goal, is_resume);
        if let Some(conversation) = self.conversations.get(&session_id) {
            state.documents = conversation.documents.clone();
        }

        self.conversations.update(&session_id, |c| {
            c.status = ConversationStatus::Running;
        });
        self.bus.publish(Event::status(session_id, "running"));

        let mut steps = 0u32;
        let outcome = loop {
            if state.is_finished {
                break Outcome::Finished;
            }
            if steps >= self.max_steps {
                let message = format!("graph exceeded {} node steps", self.max_steps);
                self.fail(&ctx, &state, &message).await;
                return Err(Error::Other(message));
            }
            steps += 1;

            // Cooperative cancellation probe before each node.
            match self.conversations.get(&session_id).map(|c| c.status) {
                Some(ConversationStatus::Cancelled) => break Outcome::Cancelled,
                Some(ConversationStatus::Failed) => {
                    // Failed externally; whoever failed it already emitted
                    // the terminal event.
                    self.inbox.remove(&session_id);
                    return Ok(());
                }
                _ => {}
            }

            match self.run_node(&ctx, &mut state).await {
                Ok(None) => {}
                Ok(Some(outcome)) => break outcome,
                Err(e) => {
                    self.fail(&ctx, &state, &e.to_string()).await;
                    return Err(e);
                }
            }

            if let Err(e) = self.checkpointer.save(session_id, &state) {
                tracing::warn!(session_id = %session_id, error = %e, "checkpoint save failed");
            }
        };

        match outcome {
            Outcome::Cancelled => {
                self.conversations.update(&session_id, |c| {
                    if !c.status.is_terminal() {
                        c.status = ConversationStatus::Cancelled;
                    }
                });
                self.bus.publish(Event::status(session_id, "cancelled"));
                self.inbox.remove(&session_id);
                Ok(())
            }
            Outcome::Finished => {
                self.finish(&ctx, &state).await;
                Ok(())
            }
        }
    }

    fn initial_state(&self, session_id: &Uuid, goal: &str, is_resume: bool) -> AgentState {
        match self.checkpointer.load(session_id) {
            Ok(Some(mut state)) if is_resume => {
                state.messages.push(ChatMessage::user(goal));
                state.is_finished = false;
                state.next_node = GraphNode::Planner;
                state
            }
            // Crash recovery: an unfinished checkpoint resumes at its last
            // committed node without re-executing completed tool calls.
            Ok(Some(state)) if !state.is_finished => state,
            _ => AgentState::new(goal),
        }
    }

    /// Execute the current node and advance `next_node`. Returns a terminal
    /// outcome when the run should stop without being an error.
    async fn run_node(&self, ctx: &RuntimeContext, state: &mut AgentState) -> Result<Option<Outcome>> {
        let session_id = ctx.session_id;
        match state.next_node {
            GraphNode::Planner => {
                let output = self
                    .model
                    .plan(PlanRequest {
                        messages: &state.messages,
                        plan: &state.plan,
                        summary: &state.summary,
                        documents: &state.documents,
                    })
                    .await?;
                state.plan = output.plan_markdown;
                state.plan_steps = output.steps;
                self.bus.publish(
                    Event::new(session_id, EventKind::Status)
                        .with_stage("planner")
                        .with_payload(serde_json::json!({
                            "plan": state.plan,
                            "plan_steps": state.plan_steps,
                        })),
                );
                state.next_node = GraphNode::Agent;
            }

            GraphNode::Agent => {
                let reply = self
                    .model
                    .step(StepRequest {
                        goal: state.goal(),
                        plan: &state.plan,
                        messages: &state.messages,
                        documents: &state.documents,
                        tools: &self.tools,
                    })
                    .await?;
                match reply {
                    AgentReply::ToolCall(mut call) => {
                        // Caller-supplied ids are preserved; empty ids get a
                        // server-generated one, assigned exactly once.
                        if call.id.is_empty() {
                            call.id = af_domain::computer::new_call_id();
                        }
                        let interactive = ToolRegistry::is_interactive(&call.name);
                        state.messages.push(ChatMessage::Assistant {
                            content: String::new(),
                            tool_call: Some(call),
                        });
                        state.next_node = if interactive {
                            GraphNode::Interrupt
                        } else {
                            GraphNode::Tools
                        };
                    }
                    AgentReply::Text(content) => {
                        state.messages.push(ChatMessage::assistant(content.clone()));
                        self.bus.publish(
                            Event::new(session_id, EventKind::AssistantMessage)
                                .with_message(strip_final_answer_tags(&content)),
                        );
                        let terminal_marker = content.to_lowercase().contains("<final_answer>")
                            || content.to_uppercase().contains("TASK COMPLETED");
                        state.next_node = if terminal_marker {
                            GraphNode::CheckCompletion
                        } else {
                            GraphNode::Observer
                        };
                    }
                }
            }

            GraphNode::Tools => {
                let Some(call) = pending_tool_call(state) else {
                    state.next_node = GraphNode::Observer;
                    return Ok(None);
                };
                self.bus.publish(Event::tool_start(
                    session_id,
                    &call.id,
                    &call.name,
                    call.arguments.clone(),
                ));
                let tool_ctx = self.tool_context(ctx);
                let outcome = self
                    .tools
                    .invoke(&tool_ctx, &call.name, call.arguments.clone())
                    .await;
                self.bus.publish(Event::tool_result(
                    session_id,
                    &call.id,
                    &call.name,
                    &outcome.content,
                    outcome.artifacts.clone(),
                ));
                state.messages.push(ChatMessage::Tool {
                    tool_call_id: call.id,
                    tool_name: call.name,
                    content: outcome.content,
                });
                state.next_node = GraphNode::Observer;
            }

            GraphNode::Interrupt => {
                let call = pending_tool_call(state);
                let description = match &call {
                    Some(call) => {
                        let tool_ctx = self.tool_context(ctx);
                        let outcome = self
                            .tools
                            .invoke(&tool_ctx, &call.name, call.arguments.clone())
                            .await;
                        outcome.interrupt.unwrap_or(outcome.content)
                    }
                    None => truncate_chars(
                        state
                            .last_assistant()
                            .map(|m| m.content())
                            .filter(|c| !c.is_empty())
                            .unwrap_or("Agent is waiting for your response."),
                        200,
                    ),
                };

                self.bus.publish(Event::interrupt(session_id, &description));
                self.conversations.update(&session_id, |c| {
                    c.status = ConversationStatus::Paused;
                });

                let answer = self.inbox.pop(session_id).await;
                if answer == CANCEL_SENTINEL {
                    return Ok(Some(Outcome::Cancelled));
                }
                let user_msg = if answer == USER_DONE_SENTINEL {
                    "User approved.".to_string()
                } else {
                    answer
                };

                // Answer the pending tool call, then append the reply as a
                // synthetic human turn so the next agent step sees it.
                if let Some(call) = call {
                    state.messages.push(ChatMessage::Tool {
                        tool_call_id: call.id,
                        tool_name: call.name,
                        content: user_msg.clone(),
                    });
                }
                state.messages.push(ChatMessage::user(user_msg));

                self.conversations.update(&session_id, |c| {
                    c.status = ConversationStatus::Running;
                });
                self.bus.publish(Event::status(session_id, "running"));
                state.next_node = GraphNode::Observer;
            }

            GraphNode::Observer => {
                state.terminal_output = state.last_tool_output().map(String::from);
                let tool_ctx = self.tool_context(ctx);
                state.file_tree = list_files_flat(&tool_ctx).await;
                self.bus.publish(
                    Event::new(session_id, EventKind::Status)
                        .with_stage("observer")
                        .with_message("observing environment")
                        .with_payload(serde_json::json!({
                            "file_count": state.file_tree.len(),
                        })),
                );
                state.next_node = GraphNode::Summarizer;
            }

            GraphNode::Summarizer => {
                state.summary = self
                    .model
                    .summarize(&state.messages, &state.summary)
                    .await?;
                state.next_node = GraphNode::Planner;
            }

            GraphNode::CheckCompletion => {
                let outstanding: Vec<String> = state
                    .outstanding_steps()
                    .iter()
                    .map(|s| s.title.clone())
                    .collect();
                if outstanding.is_empty() {
                    state.is_finished = true;
                    state.next_node = GraphNode::Done;
                } else {
                    state.messages.push(ChatMessage::user(format!(
                        "You attempted to finish the task, but the following plan steps are \
                         still not marked as 'completed': {}. Please complete them or update \
                         the plan if they are no longer relevant.",
                        outstanding.join(", ")
                    )));
                    state.next_node = GraphNode::Observer;
                }
            }

            GraphNode::Done => {
                state.is_finished = true;
            }
        }
        Ok(None)
    }

    fn tool_context(&self, ctx: &RuntimeContext) -> ToolContext {
        ToolContext {
            session_id: ctx.session_id,
            user_id: ctx.user_id.clone(),
            workspace_id: ctx.workspace_id.clone(),
            extras: ctx.extras.clone(),
            manager: self.manager.clone(),
        }
    }

    /// Terminal success path: best-effort auto-snapshot, final-answer
    /// extraction, terminal event.
    async fn finish(&self, ctx: &RuntimeContext, state: &AgentState) {
        let session_id = ctx.session_id;
        let goal: String = state.goal().chars().take(50).collect();

        match self
            .manager
            .snapshot(
                &session_id,
                SnapshotOptions {
                    label: format!("Auto-save: {goal}"),
                    ..SnapshotOptions::default()
                },
            )
            .await
        {
            Ok(snapshot) => {
                self.conversations.update(&session_id, |c| {
                    c.last_snapshot_id = Some(snapshot.id);
                });
            }
            Err(e) => {
                // Auto-snapshot is best-effort: report as a non-terminal
                // status event, never as an error.
                tracing::warn!(session_id = %session_id, error = %e, "terminal auto-snapshot failed");
                self.bus.publish(
                    Event::new(session_id, EventKind::Status)
                        .with_stage("snapshot")
                        .with_message(format!("auto-snapshot failed: {e}")),
                );
            }
        }

        let summary = state
            .last_assistant()
            .and_then(|m| extract_final_answer(m.content()))
            .unwrap_or_else(|| "Task completed successfully.".to_string());

        self.conversations.update(&session_id, |c| {
            c.status = ConversationStatus::Completed;
            c.plan = state.plan.clone();
            c.plan_steps = state.plan_steps.clone();
            c.summary = summary.clone();
        });
        self.bus.publish(Event::completed(session_id, summary));
        self.inbox.remove(&session_id);
    }

    /// Terminal failure path: best-effort failure snapshot, error event,
    /// terminal status event.
    async fn fail(&self, ctx: &RuntimeContext, state: &AgentState, message: &str) {
        let session_id = ctx.session_id;
        let goal: String = state.goal().chars().take(50).collect();

        self.conversations.update(&session_id, |c| {
            c.status = ConversationStatus::Failed;
        });
        match self
            .manager
            .snapshot(
                &session_id,
                SnapshotOptions {
                    label: format!("Failure-snapshot: {goal}"),
                    ..SnapshotOptions::default()
                },
            )
            .await
        {
            Ok(snapshot) => {
                self.conversations.update(&session_id, |c| {
                    c.last_snapshot_id = Some(snapshot.id);
                });
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "failure snapshot failed");
            }
        }
        self.bus
            .publish(Event::error(session_id, "graph", message.to_string()));
        self.bus.publish(Event::status(session_id, "failed"));
        self.inbox.remove(&session_id);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn pending_tool_call(state: &AgentState) -> Option<ToolCall> {
    match state.last_assistant() {
        Some(ChatMessage::Assistant {
            tool_call: Some(call),
            ..
        }) => Some(call.clone()),
        _ => None,
    }
}

fn final_answer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<final_answer>(.*?)</final_answer>").unwrap())
}

/// Extract the final answer from the last assistant message.
pub fn extract_final_answer(content: &str) -> Option<String> {
    final_answer_re()
        .captures(content)
        .map(|caps| caps[1].trim().to_string())
}

fn strip_final_answer_tags(content: &str) -> String {
    content
        .replace("<final_answer>", "")
        .replace("</final_answer>", "")
        .trim()
        .to_string()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
