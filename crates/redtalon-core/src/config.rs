//! Engagement configuration.
//!
//! A static TOML record supplying everything the orchestrator needs for one
//! engagement: target scope, safety constraints, the LLM provider chain, and
//! agent runtime limits.
//!
//! ```toml
//! [engagement]
//! name = "Acme external"
//!
//! [scope]
//! include = ["10.10.10.0/24", "example.com"]
//! exclude = ["10.10.10.1"]
//!
//! [safety]
//! rate_limit = 100
//! require_approval = ["exploitation", "post_exploitation"]
//!
//! [[llm.providers]]
//! name = "primary"
//! endpoint = "https://openrouter.ai/api/v1"
//! model = "openai/gpt-4o-mini"
//! api_key_env = "REDTALON_LLM_KEY"
//! priority = 1
//! rpm_limit = 20
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Top-level `[engagement]` metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementMeta {
    /// Human-readable engagement name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Directory for durable stores and report artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

fn default_name() -> String {
    "Unnamed Engagement".to_string()
}

fn default_output_dir() -> String {
    "./output".to_string()
}

impl Default for EngagementMeta {
    fn default() -> Self {
        Self {
            name: default_name(),
            output_dir: default_output_dir(),
        }
    }
}

/// `[scope]` — in-scope and excluded targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// IPv4 addresses, CIDR ranges, or domain fragments that may be touched.
    #[serde(default)]
    pub include: Vec<String>,
    /// Targets that must never be touched, even inside an included range.
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// `[safety]` — Guardian constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Maximum allowed commands per sliding minute.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,
    /// Engagement phases whose commands need operator approval.
    #[serde(default = "default_require_approval")]
    pub require_approval: Vec<String>,
    /// Optional override of the built-in destructive-command blocklist.
    #[serde(default)]
    pub blocked_commands: Option<Vec<String>>,
}

fn default_rate_limit() -> usize {
    100
}

fn default_require_approval() -> Vec<String> {
    vec!["exploitation".to_string(), "post_exploitation".to_string()]
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            require_approval: default_require_approval(),
            blocked_commands: None,
        }
    }
}

/// One `[[llm.providers]]` entry.  Ordered by `priority` ascending when
/// building the failover chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    /// Base URL of an OpenAI-style chat-completions API.
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key, resolved at load time.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Inline API key; prefer `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_rpm_limit")]
    pub rpm_limit: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

fn default_priority() -> u32 {
    1
}

fn default_rpm_limit() -> u32 {
    20
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.1
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_retry_count() -> u32 {
    3
}

impl ProviderEntry {
    /// The API key for this provider: the inline value, or the contents of
    /// the environment variable named by `api_key_env`.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(ref key) = self.api_key {
            return Some(key.clone());
        }
        self.api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
    }
}

/// `[llm]` — the provider chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

/// `[agent]` — ReAct runtime limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLimits {
    /// Maximum LLM↔tool cycles per task.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Wall-clock budget per task.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    /// Per-tool execution timeout.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// Maximum characters of tool output fed back into the conversation.
    #[serde(default = "default_output_max_chars")]
    pub output_max_chars: usize,
}

fn default_max_iterations() -> u32 {
    30
}

fn default_task_timeout() -> u64 {
    600
}

fn default_tool_timeout() -> u64 {
    300
}

fn default_output_max_chars() -> usize {
    3000
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            task_timeout_secs: default_task_timeout(),
            tool_timeout_secs: default_tool_timeout(),
            output_max_chars: default_output_max_chars(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// The full engagement configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngagementConfig {
    #[serde(default)]
    pub engagement: EngagementMeta,
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub agent: AgentLimits,
}

impl EngagementConfig {
    /// Parse from TOML text and validate.
    pub fn from_str(raw: &str) -> CoreResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate.
    pub fn from_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_str(&raw)
    }

    /// A loopback-only configuration for tests and dry runs.
    pub fn default_local() -> Self {
        Self {
            engagement: EngagementMeta {
                name: "Local Test Engagement".to_string(),
                output_dir: default_output_dir(),
            },
            scope: ScopeConfig {
                include: vec!["127.0.0.1".to_string()],
                exclude: Vec::new(),
            },
            llm: LlmSection {
                providers: vec![ProviderEntry {
                    name: "local".to_string(),
                    endpoint: "http://localhost:11434/v1".to_string(),
                    model: "llama3.1".to_string(),
                    api_key_env: None,
                    api_key: None,
                    priority: 1,
                    rpm_limit: 100,
                    max_tokens: default_max_tokens(),
                    temperature: default_temperature(),
                    timeout_secs: default_timeout_secs(),
                    retry_count: default_retry_count(),
                }],
            },
            ..Self::default()
        }
    }

    fn validate(&self) -> CoreResult<()> {
        if self.scope.include.is_empty() {
            return Err(CoreError::Config {
                reason: "at least one target must be listed in [scope] include".to_string(),
            });
        }
        if self.llm.providers.is_empty() {
            return Err(CoreError::Config {
                reason: "at least one [[llm.providers]] entry is required".to_string(),
            });
        }
        Ok(())
    }

    /// Whether commands in a phase need operator approval.
    pub fn requires_approval(&self, phase: &str) -> bool {
        self.safety.require_approval.iter().any(|p| p == phase)
    }

    /// Providers sorted ascending by priority, ready for the failover chain.
    pub fn providers_by_priority(&self) -> Vec<ProviderEntry> {
        let mut providers = self.llm.providers.clone();
        providers.sort_by_key(|p| p.priority);
        providers
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
