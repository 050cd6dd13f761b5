//! Agent error types.
//!
//! All agent subsystems surface errors through [`AgentError`].  Each variant
//! carries enough context for callers to decide how to handle the failure;
//! user-facing surfaces (runtime events, conversation messages) never see
//! these raw — the runtime synthesizes short reasons instead.

use thiserror::Error;

/// Unified error type for the agent runtime.
#[derive(Debug, Error)]
pub enum AgentError {
    // -- Transport errors ----------------------------------------------------
    /// An HTTP request to an LLM endpoint failed before yielding a status.
    #[error("http request failed: {reason}")]
    Http { reason: String },

    /// An HTTP request exceeded the provider timeout.
    #[error("http request timed out after {seconds}s")]
    HttpTimeout { seconds: u64 },

    // -- Provider errors -----------------------------------------------------
    /// A provider returned an unrecoverable response for this call.
    #[error("provider {provider} rejected the request: {reason}")]
    ProviderRejected { provider: String, reason: String },

    /// Every provider in the failover chain was exhausted.
    #[error("all {count} LLM providers failed:\n{details}")]
    AllProvidersFailed { count: usize, details: String },

    /// The router has no providers configured.
    #[error("no LLM providers configured")]
    NoProviders,

    /// The LLM response could not be parsed into the expected format.
    #[error("llm response parse error: {reason}")]
    ParseFailed { reason: String },

    // -- Tool errors ---------------------------------------------------------
    /// A tool invocation failed inside a tool server.
    #[error("tool execution failed for `{tool_name}`: {reason}")]
    ToolExecutionFailed { tool_name: String, reason: String },

    // -- Serialization -------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.
    #[error("internal agent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::HttpTimeout { seconds: 0 }
        } else {
            Self::Http {
                reason: err.to_string(),
            }
        }
    }
}
