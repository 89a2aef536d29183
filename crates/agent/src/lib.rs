//! The agent execution layer: the conversational state graph driver with
//! durable checkpoints, the LLM-callable tool registry, and the
//! computer-use runner with its policy gate and trace store.

pub mod checkpoint;
pub mod computer;
pub mod graph;
pub mod llm;
pub mod policy;
pub mod state;
pub mod tools;
pub mod trace;

pub use checkpoint::{Checkpointer, FallbackCheckpointer, FileCheckpointer, MemoryCheckpointer};
pub use graph::{GraphDriver, RuntimeContext};
pub use llm::{LanguageModel, OpenAiCompatModel, ScriptedModel};
pub use state::{AgentState, ChatMessage, GraphNode, ToolCall};
pub use tools::{Tool, ToolContext, ToolOutcome, ToolRegistry};
