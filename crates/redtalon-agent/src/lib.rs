//! # redtalon-agent
//!
//! The agent execution fabric of RedTalon: the LLM failover router, the
//! ReAct runtime that drives a single agent through observe→think→act→
//! evaluate cycles, and the tool bridge that routes every tool call through
//! the Guardian before any execution.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   chat    ┌──────────────┐  POST   ┌────────────┐
//! │ AgentRuntime  │──────────>│  LlmRouter   │────────>│ provider 1 │
//! │  (ReAct loop) │           │ (failover,   │  ...    │ provider N │
//! └──────┬────────┘           │  rate limit, │         └────────────┘
//!        │ tool calls         │  compaction) │
//!        v                    └──────────────┘
//! ┌───────────────┐  validate  ┌──────────┐
//! │  ToolBridge   │───────────>│ Guardian │
//! │  (dispatch)   │            └──────────┘
//! └──────┬────────┘
//!        v
//!   ToolServer impls (terminal, nmap, ...)
//! ```

pub mod bridge;
pub mod error;
pub mod llm;
pub mod runtime;
pub mod terminal;

// Re-export the most commonly used types at the crate root.
pub use bridge::{
    BridgeStats, ToolBridge, ToolCallRequest, ToolResult, ToolServer,
};
pub use error::{AgentError, Result};
pub use llm::{
    ChatMessage, ChatOutcome, ChatTransport, HttpReply, HttpTransport, LlmRouter, ProviderConfig,
    ProviderHealth, Role, RouterStats, ToolCall, ToolSchema, Usage,
};
pub use runtime::{
    AgentEvent, AgentRuntime, EventKind, HealthStatus, RuntimeConfig, RuntimeStatus, TaskContext,
    compress_output,
};
pub use terminal::TerminalServer;
