//! Team Lead — the per-engagement orchestrator.
//!
//! Executes an objective end to end: decompose into a dependency graph,
//! enqueue, spawn one worker per subtask, monitor progress through the
//! mailbox (recovering orphaned tasks along the way), synthesize an
//! executive summary once the queue drains, and clean up within a bounded
//! deadline.
//!
//! The lead owns the stores and the router; workers receive cheap handles
//! and never talk to each other directly — all coordination flows through
//! the task queue, the mailbox, and the lock manager.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use redtalon_agent::{AgentRuntime, ChatMessage, LlmRouter, RuntimeConfig, ToolBridge};
use redtalon_core::{Finding, Severity};
use redtalon_store::{
    AgentMessage, FindingStore, LockManager, Mailbox, MessageKind, Task, TaskQueue, TaskStatus,
};

use crate::decompose::{TaskType, decompose};
use crate::error::TeamResult;
use crate::worker::{TEAM_LEAD_ID, WorkerContext, run_worker};

// ---------------------------------------------------------------------------
// Configuration and report
// ---------------------------------------------------------------------------

/// Orchestration timing knobs.
#[derive(Debug, Clone)]
pub struct TeamLeadConfig {
    /// Pause between monitor iterations.
    pub monitor_interval: Duration,
    /// How long cleanup waits for workers to finish gracefully.
    pub cleanup_timeout: Duration,
    /// Worker claim-poll interval.
    pub worker_poll_interval: Duration,
    /// Respawn budget per task after orphan recovery.
    pub max_respawns: u32,
    /// Limits handed to each worker's ReAct runtime.
    pub runtime: RuntimeConfig,
}

impl Default for TeamLeadConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(2),
            cleanup_timeout: Duration::from_secs(10),
            worker_poll_interval: Duration::from_millis(500),
            max_respawns: 1,
            runtime: RuntimeConfig::default(),
        }
    }
}

/// Final output of one engagement.
#[derive(Debug, Clone)]
pub struct EngagementReport {
    pub objective: String,
    /// LLM-written summary of completed-task results.
    pub executive_summary: String,
    pub completed: Vec<Task>,
    /// Task count per status string.
    pub status_counts: HashMap<String, i64>,
    /// Pending tasks that can never run because a dependency failed.
    pub unsatisfied: Vec<String>,
    pub findings_count: i64,
    pub elapsed_secs: f64,
}

// ---------------------------------------------------------------------------
// Team lead
// ---------------------------------------------------------------------------

/// Master orchestrator coordinating workers over the shared stores.
pub struct TeamLead {
    config: TeamLeadConfig,
    router: Arc<LlmRouter>,
    bridge: Arc<ToolBridge>,
    queue: TaskQueue,
    mailbox: Mailbox,
    locks: LockManager,
    findings: FindingStore,
    live_workers: Arc<Mutex<HashSet<String>>>,
}

impl TeamLead {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TeamLeadConfig,
        router: Arc<LlmRouter>,
        bridge: Arc<ToolBridge>,
        queue: TaskQueue,
        mailbox: Mailbox,
        locks: LockManager,
        findings: FindingStore,
    ) -> Self {
        mailbox.register(TEAM_LEAD_ID);
        Self {
            config,
            router,
            bridge,
            queue,
            mailbox,
            locks,
            findings,
            live_workers: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Execute an objective end to end and return the engagement report.
    pub async fn orchestrate(&self, objective: &str) -> TeamResult<EngagementReport> {
        let started = Instant::now();
        info!(objective, "starting orchestration");

        // A prior session may have died mid-task; nothing in this process
        // owns those assignments.
        let recovered = self.queue.requeue_abandoned(&self.live_snapshot()).await?;
        if recovered > 0 {
            info!(recovered, "recovered tasks from a previous session");
        }

        // 1. Decompose and enqueue.
        let specs = decompose(&self.router, objective).await;
        let mut types: HashMap<String, TaskType> = HashMap::new();
        for spec in &specs {
            types.insert(spec.id.clone(), spec.task_type);
            let task = Task::new(&spec.id, &spec.description)
                .with_priority(spec.priority)
                .with_dependencies(spec.dependencies.clone());
            self.queue.add(&task).await?;
        }
        info!(tasks = specs.len(), "tasks enqueued");

        // 2. One worker per subtask.
        let mut workers: JoinSet<()> = JoinSet::new();
        for spec in &specs {
            self.spawn_worker(&mut workers, &spec.id, spec.task_type, 0);
        }

        // 3. Monitor until the queue drains or the rest is unsatisfiable.
        self.monitor(&mut workers, &types).await?;

        // 4. Synthesize before tearing the workers down.
        let executive_summary = self.synthesize(objective).await;

        // 5. Bounded cleanup.
        self.cleanup(workers).await?;

        let completed = self.queue.completed().await?;
        let status_counts = self.queue.summary().await?;
        let unsatisfied = unsatisfiable_tasks(&self.queue.all().await?);
        let findings_count = self.findings.count().await?;
        let elapsed_secs = started.elapsed().as_secs_f64();

        info!(
            completed = completed.len(),
            unsatisfied = unsatisfied.len(),
            elapsed_secs,
            "orchestration complete"
        );

        Ok(EngagementReport {
            objective: objective.to_string(),
            executive_summary,
            completed,
            status_counts,
            unsatisfied,
            findings_count,
            elapsed_secs,
        })
    }

    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<()>,
        task_id: &str,
        task_type: TaskType,
        attempt: u32,
    ) {
        let agent_id = if attempt == 0 {
            format!("worker_{task_id}")
        } else {
            format!("worker_{task_id}_r{attempt}")
        };
        info!(worker = %agent_id, task = task_id, "spawning worker");

        let runtime = Arc::new(AgentRuntime::new(
            self.config.runtime.clone(),
            Arc::clone(&self.router),
            Arc::clone(&self.bridge),
        ));

        workers.spawn(run_worker(WorkerContext {
            agent_id,
            task_id: task_id.to_string(),
            task_type,
            queue: self.queue.clone(),
            mailbox: self.mailbox.clone(),
            locks: self.locks.clone(),
            findings: self.findings.clone(),
            runtime,
            poll_interval: self.config.worker_poll_interval,
            live_workers: Arc::clone(&self.live_workers),
        }));
    }

    fn live_snapshot(&self) -> Vec<String> {
        self.live_workers
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Monitoring
    // -----------------------------------------------------------------------

    async fn monitor(
        &self,
        workers: &mut JoinSet<()>,
        types: &HashMap<String, TaskType>,
    ) -> TeamResult<()> {
        let mut respawns: HashMap<String, u32> = HashMap::new();

        loop {
            for message in self.mailbox.receive(TEAM_LEAD_ID, true).await? {
                self.process_message(&message).await?;
            }

            // Reap finished worker tasks; panics are logged, the task
            // itself is handled by the orphan pass below.
            while let Some(result) = workers.try_join_next() {
                if let Err(e) = result {
                    error!(error = %e, "worker task aborted");
                }
            }

            // Orphan recovery: running tasks whose worker is gone go back
            // to pending, and get a fresh worker within the respawn budget.
            let live = self.live_snapshot();
            let tasks = self.queue.all().await?;
            let orphaned: Vec<String> = tasks
                .iter()
                .filter(|t| {
                    t.status == TaskStatus::Running
                        && !t
                            .assignee
                            .as_deref()
                            .is_some_and(|a| live.iter().any(|l| l == a))
                })
                .map(|t| t.id.clone())
                .collect();
            if !orphaned.is_empty() {
                self.queue.requeue_abandoned(&live).await?;
                for task_id in orphaned {
                    let attempts = respawns.entry(task_id.clone()).or_insert(0);
                    if *attempts < self.config.max_respawns {
                        *attempts += 1;
                        let task_type =
                            types.get(&task_id).copied().unwrap_or(TaskType::General);
                        self.spawn_worker(workers, &task_id, task_type, *attempts);
                    } else {
                        warn!(task = %task_id, "respawn budget exhausted, failing task");
                        self.queue
                            .fail(&task_id, "worker crashed repeatedly")
                            .await?;
                    }
                }
            }

            if self.queue.all_done().await? {
                break;
            }

            // Everything still open is blocked behind a failed dependency:
            // no worker will ever claim it, so stop monitoring.
            let tasks = self.queue.all().await?;
            let unsatisfiable = unsatisfiable_tasks(&tasks);
            let progress_possible = tasks.iter().any(|t| {
                matches!(t.status, TaskStatus::Pending | TaskStatus::Running)
                    && !unsatisfiable.contains(&t.id)
            });
            if !progress_possible {
                warn!(
                    blocked = unsatisfiable.len(),
                    "remaining tasks are blocked by failed dependencies"
                );
                break;
            }

            tokio::time::sleep(self.config.monitor_interval).await;
        }

        Ok(())
    }

    async fn process_message(&self, message: &AgentMessage) -> TeamResult<()> {
        match message.kind {
            MessageKind::TaskComplete => {
                info!(
                    from = %message.from,
                    task = %message.payload["task_id"],
                    "task complete"
                );
            }
            MessageKind::Error => {
                warn!(
                    from = %message.from,
                    task = %message.payload["task_id"],
                    error = %message.payload["error"],
                    "worker reported an error"
                );
            }
            MessageKind::CriticalFinding => {
                let title = message.payload["title"].as_str().unwrap_or("Critical finding");
                let description = message.payload["description"]
                    .as_str()
                    .unwrap_or_default();
                error!(from = %message.from, title, "critical finding reported");
                self.findings
                    .record(
                        &Finding::new("engagement", title, Severity::Critical, description)
                            .with_metadata(json!({"reported_by": message.from})),
                    )
                    .await?;
            }
            MessageKind::ValidationRequest => {
                info!(from = %message.from, "validation requested");
            }
            _ => {}
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Synthesis and cleanup
    // -----------------------------------------------------------------------

    /// Ask the router to fold completed-task results into an executive
    /// summary.  Failure-tolerant: an engagement report is produced even
    /// when no provider is left standing.
    async fn synthesize(&self, objective: &str) -> String {
        let completed = match self.queue.completed().await {
            Ok(completed) => completed,
            Err(e) => {
                error!(error = %e, "could not read completed tasks for synthesis");
                return "Synthesis unavailable: task store unreadable".to_string();
            }
        };
        if completed.is_empty() {
            return "No tasks completed.".to_string();
        }

        let task_lines: Vec<String> = completed
            .iter()
            .take(20)
            .map(|t| {
                let result: String = t
                    .result
                    .as_deref()
                    .unwrap_or("")
                    .chars()
                    .take(300)
                    .collect();
                format!("- {} ({}): {}", t.id, t.description, result)
            })
            .collect();

        let prompt = format!(
            "Synthesize penetration-test results for the objective: {objective}\n\n\
             Completed tasks:\n{}\n\n\
             Generate:\n1. Executive summary (2-3 sentences)\n2. Critical findings list\n3. Recommendations",
            task_lines.join("\n")
        );

        match self.router.chat(&[ChatMessage::user(prompt)], None).await {
            Ok(outcome) => outcome.content,
            Err(e) => {
                warn!(error = %e, "synthesis call failed");
                "Synthesis unavailable — all LLM providers failed.".to_string()
            }
        }
    }

    /// Terminate every worker, wait bounded for graceful exits, then drop
    /// the stragglers and release all locks.
    async fn cleanup(&self, mut workers: JoinSet<()>) -> TeamResult<()> {
        info!("starting cleanup");
        self.mailbox
            .broadcast(TEAM_LEAD_ID, MessageKind::Terminate, json!({}))
            .await?;

        let graceful = tokio::time::timeout(self.config.cleanup_timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if graceful.is_err() {
            warn!("some workers did not finish gracefully, aborting them");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        let released = self.locks.cleanup().await?;
        if released > 0 {
            info!(released, "released leftover locks");
        }
        info!("cleanup complete");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dependency analysis
// ---------------------------------------------------------------------------

/// Pending tasks that can never become claimable: a dependency failed, is
/// missing, or is itself unsatisfiable.
pub fn unsatisfiable_tasks(tasks: &[Task]) -> Vec<String> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut unsatisfiable: HashSet<String> = HashSet::new();

    loop {
        let mut changed = false;
        for task in tasks {
            if task.status != TaskStatus::Pending || unsatisfiable.contains(&task.id) {
                continue;
            }
            let blocked = task.dependencies.iter().any(|dep| {
                match by_id.get(dep.as_str()) {
                    Some(dep_task) => {
                        dep_task.status == TaskStatus::Failed || unsatisfiable.contains(dep)
                    }
                    // Dependency on a task that does not exist.
                    None => true,
                }
            });
            if blocked {
                unsatisfiable.insert(task.id.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut out: Vec<String> = unsatisfiable.into_iter().collect();
    out.sort();
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, status: TaskStatus, deps: &[&str]) -> Task {
        let mut t = Task::new(id, "x").with_dependencies(deps.iter().map(|d| d.to_string()));
        t.status = status;
        t
    }

    #[test]
    fn direct_failed_dependency_is_unsatisfiable() {
        let tasks = vec![
            task("a", TaskStatus::Failed, &[]),
            task("b", TaskStatus::Pending, &["a"]),
        ];
        assert_eq!(unsatisfiable_tasks(&tasks), vec!["b".to_string()]);
    }

    #[test]
    fn transitive_failure_propagates() {
        let tasks = vec![
            task("a", TaskStatus::Failed, &[]),
            task("b", TaskStatus::Pending, &["a"]),
            task("c", TaskStatus::Pending, &["b"]),
            task("d", TaskStatus::Pending, &["c"]),
        ];
        assert_eq!(
            unsatisfiable_tasks(&tasks),
            vec!["b".to_string(), "c".to_string(), "d".to_string()]
        );
    }

    #[test]
    fn healthy_graph_has_no_unsatisfiable_tasks() {
        let tasks = vec![
            task("a", TaskStatus::Complete, &[]),
            task("b", TaskStatus::Running, &["a"]),
            task("c", TaskStatus::Pending, &["b"]),
        ];
        assert!(unsatisfiable_tasks(&tasks).is_empty());
    }

    #[test]
    fn missing_dependency_is_unsatisfiable() {
        let tasks = vec![task("b", TaskStatus::Pending, &["ghost"])];
        assert_eq!(unsatisfiable_tasks(&tasks), vec!["b".to_string()]);
    }

    #[test]
    fn completed_and_failed_tasks_are_not_listed() {
        let tasks = vec![
            task("a", TaskStatus::Failed, &[]),
            task("b", TaskStatus::Complete, &["a"]),
        ];
        assert!(unsatisfiable_tasks(&tasks).is_empty());
    }
}
