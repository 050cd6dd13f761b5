//! Shared task queue for agent-team coordination.
//!
//! The Team Lead writes subtasks here; worker agents claim them, execute,
//! and report back.  Tasks carry dependency lists so dependent work only
//! becomes claimable after its prerequisites complete.  A failed task never
//! satisfies a dependency — its dependents stay pending until a recovery
//! pass intervenes.
//!
//! Claiming is atomic: the select-and-update runs in a single transaction
//! over the shared connection, so at most one agent ever claims a task.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single unit of work in the shared queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier (assigned by the decomposition).
    pub id: String,
    /// What must be done, in natural language.
    pub description: String,
    /// Task ids that must be `complete` before this one is claimable.
    pub dependencies: Vec<String>,
    /// Scheduling priority — higher claims first.
    pub priority: i64,
    pub status: TaskStatus,
    /// Agent currently (or last) assigned.
    pub assignee: Option<String>,
    /// Serialized result blob, recorded verbatim on completion.
    pub result: Option<String>,
    /// Failure reason.
    pub error: Option<String>,
    /// Unix timestamps (seconds).
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Task {
    /// Create a pending task with no dependencies.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            dependencies: Vec::new(),
            priority: 0,
            status: TaskStatus::Pending,
            assignee: None,
            result: None,
            error: None,
            created_at: Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: add dependencies.
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = String>) -> Self {
        self.dependencies.extend(deps);
        self
    }
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

/// SQLite-backed task queue shared by the Team Lead and its workers.
#[derive(Clone)]
pub struct TaskQueue {
    db: Database,
}

impl TaskQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a task, replacing any existing task with the same id.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn add(&self, task: &Task) -> StoreResult<()> {
        let task = task.clone();
        let deps = serde_json::to_string(&task.dependencies)?;
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO tasks
                     (id, description, status, assignee, dependencies, priority,
                      result, error, created_at, started_at, completed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        task.id,
                        task.description,
                        task.status.as_str(),
                        task.assignee,
                        deps,
                        task.priority,
                        task.result,
                        task.error,
                        task.created_at,
                        task.started_at,
                        task.completed_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        debug!("task added");
        Ok(())
    }

    /// Atomically claim the best available task for `agent_id`.
    ///
    /// A task is claimable when it is pending and every dependency is
    /// complete.  Among claimable tasks, the highest priority wins; ties
    /// break on creation time.  Returns `None` when nothing is claimable.
    #[instrument(skip(self))]
    pub async fn claim(&self, agent_id: &str) -> StoreResult<Option<Task>> {
        let agent_id = agent_id.to_string();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let claimed = {
                    let mut stmt = tx.prepare(
                        "SELECT id, dependencies FROM tasks
                         WHERE status = 'pending'
                         ORDER BY priority DESC, created_at ASC, id ASC",
                    )?;
                    let candidates: Vec<(String, String)> = stmt
                        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                        .collect::<Result<_, _>>()?;
                    drop(stmt);

                    let mut claimed: Option<String> = None;
                    for (id, deps_json) in candidates {
                        let deps: Vec<String> = serde_json::from_str(&deps_json)?;
                        if dependencies_complete(&tx, &deps)? {
                            claimed = Some(id);
                            break;
                        }
                    }
                    claimed
                };

                let Some(id) = claimed else {
                    return Ok(None);
                };

                let now = Utc::now().timestamp();
                tx.execute(
                    "UPDATE tasks SET status = 'running', assignee = ?2, started_at = ?3
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, agent_id, now],
                )?;
                let task = get_task(&tx, &id)?;
                tx.commit()?;

                if let Some(ref t) = task {
                    info!(task_id = %t.id, agent = %agent_id, "task claimed");
                }
                Ok(task)
            })
            .await
    }

    /// Atomically claim one specific task, if it is currently claimable.
    ///
    /// Workers assigned a particular subtask poll this until the task's
    /// dependencies complete.
    #[instrument(skip(self))]
    pub async fn claim_by_id(&self, agent_id: &str, task_id: &str) -> StoreResult<Option<Task>> {
        let agent_id = agent_id.to_string();
        let task_id = task_id.to_string();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;

                let Some(task) = get_task(&tx, &task_id)? else {
                    return Ok(None);
                };
                if task.status != TaskStatus::Pending
                    || !dependencies_complete(&tx, &task.dependencies)?
                {
                    return Ok(None);
                }

                let now = Utc::now().timestamp();
                let updated = tx.execute(
                    "UPDATE tasks SET status = 'running', assignee = ?2, started_at = ?3
                     WHERE id = ?1 AND status = 'pending'",
                    params![task_id, agent_id, now],
                )?;
                if updated == 0 {
                    return Ok(None);
                }
                let task = get_task(&tx, &task_id)?;
                tx.commit()?;

                info!(task_id = %task_id, agent = %agent_id, "task claimed by id");
                Ok(task)
            })
            .await
    }

    /// Mark a task complete, recording its result blob verbatim.
    #[instrument(skip(self, result))]
    pub async fn complete(&self, task_id: &str, result: &str) -> StoreResult<()> {
        let task_id = task_id.to_string();
        let result = result.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE tasks SET status = 'complete', result = ?2, completed_at = ?3
                     WHERE id = ?1",
                    params![task_id, result, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "task",
                        id: task_id,
                    });
                }
                Ok(())
            })
            .await?;
        info!("task completed");
        Ok(())
    }

    /// Mark a task failed.  Dependents of a failed task never become
    /// claimable.
    #[instrument(skip(self))]
    pub async fn fail(&self, task_id: &str, error: &str) -> StoreResult<()> {
        let task_id = task_id.to_string();
        let error = error.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE tasks SET status = 'failed', error = ?2, completed_at = ?3
                     WHERE id = ?1",
                    params![task_id, error, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "task",
                        id: task_id,
                    });
                }
                Ok(())
            })
            .await?;
        warn!("task failed");
        Ok(())
    }

    /// Fetch a task by id.
    pub async fn get(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let task_id = task_id.to_string();
        self.db.execute(move |conn| get_task(conn, &task_id)).await
    }

    /// Every task in the queue, oldest first.
    pub async fn all(&self) -> StoreResult<Vec<Task>> {
        self.db
            .execute(|conn| {
                let mut stmt =
                    conn.prepare(&format!("{SELECT_TASK} ORDER BY created_at ASC, id ASC"))?;
                let rows = stmt
                    .query_map([], row_to_task_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(TaskRow::into_task).collect()
            })
            .await
    }

    /// All completed tasks with their results.
    pub async fn completed(&self) -> StoreResult<Vec<Task>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_TASK} WHERE status = 'complete' ORDER BY completed_at ASC, id ASC"
                ))?;
                let rows = stmt
                    .query_map([], row_to_task_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(TaskRow::into_task).collect()
            })
            .await
    }

    /// True when no task is pending or running.
    pub async fn all_done(&self) -> StoreResult<bool> {
        self.db
            .execute(|conn| {
                let open: i64 = conn.query_row(
                    "SELECT count(*) FROM tasks WHERE status IN ('pending', 'running')",
                    [],
                    |row| row.get(0),
                )?;
                Ok(open == 0)
            })
            .await
    }

    /// Count of tasks per status.
    pub async fn summary(&self) -> StoreResult<HashMap<String, i64>> {
        self.db
            .execute(|conn| {
                let mut stmt =
                    conn.prepare("SELECT status, count(*) FROM tasks GROUP BY status")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<Result<HashMap<_, _>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Crash recovery: re-pend every running task whose assignee is not in
    /// `live_agents`, clearing the stale assignment.  Returns the number of
    /// tasks recovered.
    #[instrument(skip(self, live_agents))]
    pub async fn requeue_abandoned(&self, live_agents: &[String]) -> StoreResult<usize> {
        let live: Vec<String> = live_agents.to_vec();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let running: Vec<(String, Option<String>)> = {
                    let mut stmt =
                        tx.prepare("SELECT id, assignee FROM tasks WHERE status = 'running'")?;
                    let rows = stmt
                        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };

                let mut recovered = 0usize;
                for (id, assignee) in running {
                    let owner_alive = assignee.as_deref().is_some_and(|a| live.iter().any(|l| l == a));
                    if !owner_alive {
                        tx.execute(
                            "UPDATE tasks SET status = 'pending', assignee = NULL, started_at = NULL
                             WHERE id = ?1 AND status = 'running'",
                            params![id],
                        )?;
                        recovered += 1;
                    }
                }
                tx.commit()?;

                if recovered > 0 {
                    warn!(recovered, "re-pended orphaned running tasks");
                }
                Ok(recovered)
            })
            .await
    }

    /// Clear all tasks (fresh engagement).
    pub async fn reset(&self) -> StoreResult<()> {
        self.db
            .execute(|conn| {
                conn.execute("DELETE FROM tasks", [])?;
                Ok(())
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Internal row mapping and helpers
// ---------------------------------------------------------------------------

const SELECT_TASK: &str = "SELECT id, description, status, assignee, dependencies, priority,
     result, error, created_at, started_at, completed_at FROM tasks";

struct TaskRow {
    id: String,
    description: String,
    status: String,
    assignee: Option<String>,
    dependencies: String,
    priority: i64,
    result: Option<String>,
    error: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

fn row_to_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        description: row.get(1)?,
        status: row.get(2)?,
        assignee: row.get(3)?,
        dependencies: row.get(4)?,
        priority: row.get(5)?,
        result: row.get(6)?,
        error: row.get(7)?,
        created_at: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
    })
}

impl TaskRow {
    fn into_task(self) -> StoreResult<Task> {
        let dependencies: Vec<String> = serde_json::from_str(&self.dependencies)?;
        let status = TaskStatus::parse(&self.status).ok_or_else(|| StoreError::Corrupt {
            entity: "task",
            id: self.id.clone(),
            reason: format!("unknown status '{}'", self.status),
        })?;
        Ok(Task {
            id: self.id,
            description: self.description,
            dependencies,
            priority: self.priority,
            status,
            assignee: self.assignee,
            result: self.result,
            error: self.error,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

fn get_task(conn: &Connection, task_id: &str) -> StoreResult<Option<Task>> {
    let result = conn.query_row(
        &format!("{SELECT_TASK} WHERE id = ?1"),
        params![task_id],
        row_to_task_row,
    );
    match result {
        Ok(row) => row.into_task().map(Some),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StoreError::Sqlite(e)),
    }
}

/// True when every id in `deps` exists with status `complete`.
fn dependencies_complete(conn: &Connection, deps: &[String]) -> StoreResult<bool> {
    if deps.is_empty() {
        return Ok(true);
    }
    let placeholders = vec!["?"; deps.len()].join(",");
    let sql = format!(
        "SELECT count(*) FROM tasks WHERE id IN ({placeholders}) AND status = 'complete'"
    );
    let complete: i64 = conn.query_row(
        &sql,
        rusqlite::params_from_iter(deps.iter()),
        |row| row.get(0),
    )?;
    Ok(complete as usize == deps.len())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn queue() -> TaskQueue {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        TaskQueue::new(db)
    }

    #[tokio::test]
    async fn add_claim_complete_round_trip() {
        let q = queue().await;
        q.add(&Task::new("scan_1", "Nmap scan 10.10.10.5")).await.unwrap();

        let claimed = q.claim("recon_agent_1").await.unwrap().unwrap();
        assert_eq!(claimed.id, "scan_1");
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.assignee.as_deref(), Some("recon_agent_1"));
        assert!(claimed.started_at.is_some());

        q.complete("scan_1", r#"{"ports": [22, 80]}"#).await.unwrap();
        let done = q.get("scan_1").await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Complete);
        assert_eq!(done.result.as_deref(), Some(r#"{"ports": [22, 80]}"#));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let q = queue().await;
        q.add(&Task::new("t1", "only task")).await.unwrap();

        let first = q.claim("agent_a").await.unwrap();
        let second = q.claim("agent_b").await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn claim_respects_dependencies() {
        let q = queue().await;
        q.add(&Task::new("t1", "first")).await.unwrap();
        q.add(&Task::new("t2", "second").with_dependencies(["t1".to_string()]))
            .await
            .unwrap();

        // t2 must not be claimable while t1 is open.
        let claimed = q.claim("a").await.unwrap().unwrap();
        assert_eq!(claimed.id, "t1");
        assert!(q.claim("b").await.unwrap().is_none());

        q.complete("t1", "ok").await.unwrap();
        let claimed = q.claim("b").await.unwrap().unwrap();
        assert_eq!(claimed.id, "t2");
    }

    #[tokio::test]
    async fn failed_dependency_blocks_dependents() {
        let q = queue().await;
        q.add(&Task::new("t1", "first")).await.unwrap();
        q.add(&Task::new("t2", "second").with_dependencies(["t1".to_string()]))
            .await
            .unwrap();

        q.claim("a").await.unwrap();
        q.fail("t1", "boom").await.unwrap();

        // A failed dependency never satisfies the gate.
        assert!(q.claim("b").await.unwrap().is_none());
        assert!(!q.all_done().await.unwrap());
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_age() {
        let q = queue().await;
        let mut low = Task::new("low", "low priority").with_priority(1);
        low.created_at = 100;
        let mut high = Task::new("high", "high priority").with_priority(10);
        high.created_at = 200;
        let mut old = Task::new("old", "same priority, older").with_priority(10);
        old.created_at = 150;
        q.add(&low).await.unwrap();
        q.add(&high).await.unwrap();
        q.add(&old).await.unwrap();

        assert_eq!(q.claim("a").await.unwrap().unwrap().id, "old");
        assert_eq!(q.claim("a").await.unwrap().unwrap().id, "high");
        assert_eq!(q.claim("a").await.unwrap().unwrap().id, "low");
    }

    #[tokio::test]
    async fn claim_by_id_waits_for_dependencies() {
        let q = queue().await;
        q.add(&Task::new("t1", "first")).await.unwrap();
        q.add(&Task::new("t2", "second").with_dependencies(["t1".to_string()]))
            .await
            .unwrap();

        assert!(q.claim_by_id("w2", "t2").await.unwrap().is_none());

        q.claim_by_id("w1", "t1").await.unwrap().unwrap();
        q.complete("t1", "done").await.unwrap();

        let t2 = q.claim_by_id("w2", "t2").await.unwrap().unwrap();
        assert_eq!(t2.assignee.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn claim_by_id_rejects_already_claimed() {
        let q = queue().await;
        q.add(&Task::new("t1", "task")).await.unwrap();
        assert!(q.claim_by_id("w1", "t1").await.unwrap().is_some());
        assert!(q.claim_by_id("w2", "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn summary_and_all_done() {
        let q = queue().await;
        q.add(&Task::new("a", "x")).await.unwrap();
        q.add(&Task::new("b", "y")).await.unwrap();
        q.claim("w").await.unwrap();
        q.complete("a", "r").await.unwrap();

        let summary = q.summary().await.unwrap();
        assert_eq!(summary.get("complete"), Some(&1));
        assert_eq!(summary.get("pending"), Some(&1));
        assert!(!q.all_done().await.unwrap());

        q.claim("w").await.unwrap();
        q.fail("b", "err").await.unwrap();
        assert!(q.all_done().await.unwrap());
    }

    #[tokio::test]
    async fn requeue_abandoned_recovers_orphans() {
        let q = queue().await;
        q.add(&Task::new("t1", "task")).await.unwrap();
        q.claim("dead_worker").await.unwrap();

        let recovered = q
            .requeue_abandoned(&["live_worker".to_string()])
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let task = q.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assignee.is_none());

        // Another worker can now claim it.
        assert!(q.claim("live_worker").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn requeue_leaves_live_owners_alone() {
        let q = queue().await;
        q.add(&Task::new("t1", "task")).await.unwrap();
        q.claim("alive").await.unwrap();

        let recovered = q.requeue_abandoned(&["alive".to_string()]).await.unwrap();
        assert_eq!(recovered, 0);
        assert_eq!(
            q.get("t1").await.unwrap().unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn complete_unknown_task_is_not_found() {
        let q = queue().await;
        let err = q.complete("ghost", "r").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn reset_clears_queue() {
        let q = queue().await;
        q.add(&Task::new("t1", "task")).await.unwrap();
        q.reset().await.unwrap();
        assert!(q.get("t1").await.unwrap().is_none());
        assert!(q.all_done().await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_claims_never_duplicate() {
        let q = queue().await;
        for i in 0..8 {
            q.add(&Task::new(format!("t{i}"), "work")).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..8 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(task) = q.claim(&format!("w{w}")).await.unwrap() {
                    mine.push(task.id);
                }
                mine
            }));
        }

        let mut all: Vec<String> = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let total_claims = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total_claims, 8, "no task claimed twice");
        assert_eq!(all.len(), 8, "every task claimed once");
    }
}
