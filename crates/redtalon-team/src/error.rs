//! Error types for the redtalon-team crate.

use thiserror::Error;

/// Alias for `Result<T, TeamError>`.
pub type TeamResult<T> = Result<T, TeamError>;

/// Errors from orchestration.
///
/// Store failures are fatal to the engagement; agent failures are normally
/// absorbed into task results and only surface here when orchestration
/// itself cannot continue.
#[derive(Debug, Error)]
pub enum TeamError {
    /// A durable store operation failed.
    #[error("store error: {0}")]
    Store(#[from] redtalon_store::StoreError),

    /// An agent-layer call failed outside a worker context.
    #[error("agent error: {0}")]
    Agent(#[from] redtalon_agent::AgentError),

    /// Core configuration or policy error.
    #[error("core error: {0}")]
    Core(#[from] redtalon_core::CoreError),

    /// Catch-all for unexpected internal errors.
    #[error("internal team error: {0}")]
    Internal(String),
}
