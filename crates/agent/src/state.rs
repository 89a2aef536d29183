//! Serializable conversation state for the graph driver.
//!
//! The whole tuple — messages, plan, summary, observer data and the next
//! node — is what the checkpointer persists after every transition, so a
//! restarted worker resumes exactly where the previous one stopped.

use serde::{Deserialize, Serialize};

use af_domain::session::{PlanStep, UploadedDocument};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call: Option<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        tool_name: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
            tool_call: None,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::System { content }
            | Self::User { content }
            | Self::Assistant { content, .. }
            | Self::Tool { content, .. } => content,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Graph nodes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphNode {
    Planner,
    Agent,
    Tools,
    Interrupt,
    Observer,
    Summarizer,
    CheckCompletion,
    Done,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub plan_steps: Vec<PlanStep>,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_output: Option<String>,
    #[serde(default)]
    pub file_tree: Vec<String>,
    #[serde(default)]
    pub documents: Vec<UploadedDocument>,
    #[serde(default)]
    pub is_finished: bool,
    pub next_node: GraphNode,
}

impl AgentState {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(goal)],
            plan: String::new(),
            plan_steps: Vec::new(),
            summary: String::new(),
            terminal_output: None,
            file_tree: Vec::new(),
            documents: Vec::new(),
            is_finished: false,
            next_node: GraphNode::Planner,
        }
    }

    pub fn goal(&self) -> &str {
        self.messages
            .iter()
            .find_map(|m| match m {
                ChatMessage::User { content } => Some(content.as_str()),
                _ => None,
            })
            .unwrap_or("")
    }

    pub fn last_assistant(&self) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .rev()
            .find(|m| matches!(m, ChatMessage::Assistant { .. }))
    }

    pub fn last_tool_output(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match m {
            ChatMessage::Tool { content, .. } => Some(content.as_str()),
            _ => None,
        })
    }

    /// Plan steps not yet marked `completed`.
    pub fn outstanding_steps(&self) -> Vec<&PlanStep> {
        self.plan_steps
            .iter()
            .filter(|s| s.status != af_domain::session::PlanStepStatus::Completed)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_domain::session::PlanStepStatus;

    #[test]
    fn new_state_enters_at_planner() {
        let state = AgentState::new("build a website");
        assert_eq!(state.next_node, GraphNode::Planner);
        assert_eq!(state.goal(), "build a website");
        assert!(!state.is_finished);
    }

    #[test]
    fn last_tool_output_finds_most_recent() {
        let mut state = AgentState::new("goal");
        state.messages.push(ChatMessage::Tool {
            tool_call_id: "c1".into(),
            tool_name: "run_shell".into(),
            content: "first".into(),
        });
        state.messages.push(ChatMessage::assistant("thinking"));
        state.messages.push(ChatMessage::Tool {
            tool_call_id: "c2".into(),
            tool_name: "run_shell".into(),
            content: "second".into(),
        });
        assert_eq!(state.last_tool_output(), Some("second"));
    }

    #[test]
    fn outstanding_steps_excludes_completed() {
        let mut state = AgentState::new("goal");
        state.plan_steps = vec![
            PlanStep {
                title: "a".into(),
                description: String::new(),
                status: PlanStepStatus::Completed,
            },
            PlanStep {
                title: "b".into(),
                description: String::new(),
                status: PlanStepStatus::InProgress,
            },
        ];
        let outstanding = state.outstanding_steps();
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].title, "b");
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = AgentState::new("goal");
        state.messages.push(ChatMessage::Assistant {
            content: String::new(),
            tool_call: Some(ToolCall {
                id: "call_1".into(),
                name: "run_shell".into(),
                arguments: serde_json::json!({"command": "ls"}),
            }),
        });
        state.next_node = GraphNode::Tools;

        let json = serde_json::to_string(&state).unwrap();
        let back: AgentState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.next_node, GraphNode::Tools);
        match back.messages.last().unwrap() {
            ChatMessage::Assistant {
                tool_call: Some(call),
                ..
            } => assert_eq!(call.name, "run_shell"),
            other => panic!("unexpected message {other:?}"),
        }
    }
}
