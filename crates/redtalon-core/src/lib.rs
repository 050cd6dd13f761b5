//! # redtalon-core
//!
//! Shared foundations for the RedTalon orchestrator: the engagement
//! configuration record, the Guardian safety-policy engine, and the finding
//! model accumulated over an engagement.
//!
//! Everything here is I/O-free (aside from config file loading) so the
//! higher crates — stores, agent runtime, team orchestration — can depend on
//! it without pulling in the async stack.

pub mod config;
pub mod error;
pub mod finding;
pub mod guardian;

// ── re-exports ───────────────────────────────────────────────────────

pub use config::{
    AgentLimits, EngagementConfig, EngagementMeta, LlmSection, ProviderEntry, SafetyConfig,
    ScopeConfig,
};
pub use error::{CoreError, CoreResult};
pub use finding::{Finding, Severity};
pub use guardian::{
    AuditRecord, Guardian, GuardianConfig, GuardianStats, RiskLevel, SessionKind, Validation,
};
