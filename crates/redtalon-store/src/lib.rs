//! # redtalon-store
//!
//! Durable coordination primitives for RedTalon agent teams, all backed by
//! one SQLite engagement database:
//!
//! - [`TaskQueue`] — dependency-gated subtask queue with atomic claiming;
//! - [`Mailbox`] — typed inter-agent messages, delivered exactly once;
//! - [`LockManager`] — advisory resource locks with stale reclamation;
//! - [`FindingStore`] — append-only finding log for the final report.
//!
//! The stores survive a Team Lead crash: on restart, tasks still marked
//! running can be re-pended and unread messages are still waiting.

pub mod db;
pub mod error;
pub mod finding_store;
pub mod lock_manager;
pub mod mailbox;
pub mod migration;
pub mod task_queue;

// ── re-exports ───────────────────────────────────────────────────────

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use finding_store::FindingStore;
pub use lock_manager::{DEFAULT_STALE_THRESHOLD, LockManager};
pub use mailbox::{AgentMessage, Mailbox, MessageKind};
pub use task_queue::{Task, TaskQueue, TaskStatus};
