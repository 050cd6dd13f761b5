//! # redtalon-team
//!
//! Multi-agent orchestration for RedTalon.  The [`TeamLead`] decomposes an
//! objective into a dependency graph of subtasks, spawns one worker agent
//! per subtask, and coordinates them exclusively through the durable
//! primitives in `redtalon-store`: the task queue (who does what, and
//! when), the mailbox (worker→lead reporting, lead→worker termination),
//! and the lock manager (exclusive access to shared targets).
//!
//! Each worker drives a `redtalon-agent` ReAct runtime; the lead
//! synthesizes completed results into an executive summary and returns an
//! [`EngagementReport`].

pub mod decompose;
pub mod error;
pub mod team_lead;
pub mod worker;

// ── re-exports ───────────────────────────────────────────────────────

pub use decompose::{TaskSpec, TaskType, decompose, default_decomposition, parse_decomposition};
pub use error::{TeamError, TeamResult};
pub use team_lead::{EngagementReport, TeamLead, TeamLeadConfig, unsatisfiable_tasks};
pub use worker::{TEAM_LEAD_ID, WorkerContext, run_worker};
