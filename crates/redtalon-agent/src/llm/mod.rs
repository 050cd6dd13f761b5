//! LLM access layer: wire types, conversation hygiene, and the failover
//! router.
//!
//! - [`types`] -- provider-agnostic chat/tool types and provider config.
//! - [`limits`] -- token estimation and per-family context limits.
//! - [`consistency`] -- tool-call/response pairing repair.
//! - [`compaction`] -- context auto-compaction near the window limit.
//! - [`prompt_tools`] -- prompt-based tool calling for endpoints without
//!   native support.
//! - [`router`] -- the ordered, retrying, rate-limited provider chain.

pub mod compaction;
pub mod consistency;
pub mod limits;
pub mod prompt_tools;
pub mod router;
pub mod types;

pub use compaction::{COMPACTION_THRESHOLD, auto_compact, auto_compact_with_threshold};
pub use consistency::fix_message_list;
pub use limits::{context_limit, estimate_conversation_tokens, estimate_tokens};
pub use router::{
    CallMetrics, ChatTransport, HttpReply, HttpTransport, LlmRouter, ProviderHealth, RouterStats,
    extract_retry_delay,
};
pub use types::{
    ChatMessage, ChatOutcome, ProviderConfig, Role, ToolCall, ToolSchema, Usage,
};
