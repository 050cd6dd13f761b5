//! Core types for LLM interaction.
//!
//! These model the data flowing between the agent runtime and LLM
//! providers.  The wire format is the OpenAI chat-completions schema, which
//! every provider in the failover chain speaks (natively or via a
//! compatibility endpoint).

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the operator or orchestrator.
    User,
    /// Output from the LLM.
    Assistant,
    /// Result of a tool invocation, fed back to the model.
    Tool,
}

impl Role {
    /// The lowercase wire-format name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A single message in a conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who produced this message.
    pub role: Role,

    /// Textual content.  For [`Role::Tool`] messages this is the
    /// (compressed) tool output; for assistant messages that only carry
    /// tool calls it may be empty.
    #[serde(default)]
    pub content: String,

    /// Tool calls requested by the assistant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Which tool call this message answers (tool role only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant text message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant message that carries tool calls.
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Create a tool result message answering `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// A tool definition exposed to the LLM (OpenAI function-calling format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON Schema describing the tool's parameters.
    pub parameters: Value,
}

impl ToolSchema {
    /// Wire form: `{"type": "function", "function": {...}}`.
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            },
        })
    }
}

/// A tool invocation requested by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier correlating the call with its result.
    pub id: String,
    /// The tool to invoke.
    pub name: String,
    /// Arguments as a JSON object.
    pub arguments: Value,
}

// ---------------------------------------------------------------------------
// Provider configuration
// ---------------------------------------------------------------------------

/// Configuration for one endpoint in the failover chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Short name used in logs and health reports.
    pub name: String,
    /// Base URL of the OpenAI-style API (no trailing slash needed).
    pub endpoint: String,
    /// Model identifier sent in requests.
    pub model: String,
    /// Optional bearer token.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Failover order — lower tries first.
    pub priority: u32,
    /// Requests per minute for the token-bucket limiter.
    pub rpm_limit: u32,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Attempts per provider before failing over.
    pub retry_count: u32,
}

impl ProviderConfig {
    /// A localhost Ollama-style provider, used as a default fallback and in
    /// tests.
    pub fn local(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: "http://localhost:11434/v1".to_string(),
            model: model.into(),
            api_key: None,
            priority: 10,
            rpm_limit: 100,
            max_tokens: 4096,
            temperature: 0.1,
            timeout_secs: 120,
            retry_count: 3,
        }
    }

    /// Endpoint with trailing slashes stripped so path joins cannot produce
    /// `//`.
    pub fn normalized_endpoint(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }
}

// ---------------------------------------------------------------------------
// Chat outcome
// ---------------------------------------------------------------------------

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// The parsed result of one successful chat call.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// Assistant text (cleaned of tool-call JSON in prompt-tools mode).
    pub content: String,
    /// Tool invocations the model requested, possibly empty.
    pub tool_calls: Vec<ToolCall>,
    /// Provider-reported finish reason.
    pub finish_reason: String,
    pub usage: Usage,
    /// Model that produced the response.
    pub model: String,
    /// Wall-clock latency in seconds.
    pub latency: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, Role::System);
        assert_eq!(ChatMessage::user("u").role, Role::User);
        assert_eq!(ChatMessage::assistant("a").role, Role::Assistant);
        let t = ChatMessage::tool_result("tc_1", "out");
        assert_eq!(t.role, Role::Tool);
        assert_eq!(t.tool_call_id.as_deref(), Some("tc_1"));
    }

    #[test]
    fn tool_schema_wire_format() {
        let schema = ToolSchema {
            name: "nmap_scan".into(),
            description: "Scan a host".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"target": {"type": "string"}},
                "required": ["target"],
            }),
        };
        let wire = schema.to_wire();
        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["name"], "nmap_scan");
        assert_eq!(wire["function"]["parameters"]["required"][0], "target");
    }

    #[test]
    fn serialization_skips_empty_tool_fields() {
        let msg = ChatMessage::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
    }

    #[test]
    fn endpoint_normalization_strips_slashes() {
        let mut p = ProviderConfig::local("x", "m");
        p.endpoint = "https://api.example.com/v1///".into();
        assert_eq!(p.normalized_endpoint(), "https://api.example.com/v1");
    }
}
