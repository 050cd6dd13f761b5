//! Error types for the redtalon-core crate.

use thiserror::Error;

/// Alias for `Result<T, CoreError>`.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors from configuration loading and policy construction.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Engagement configuration is missing or invalid.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// TOML parsing failed.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Reading a configuration file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocklist or pattern set failed to compile.
    #[error("pattern compilation failed: {reason}")]
    Pattern { reason: String },

    /// JSON serialization failed (audit export).
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(String),
}
