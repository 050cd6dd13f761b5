//! Worker agent.
//!
//! One worker per decomposed subtask.  A worker polls the shared queue
//! until its task becomes claimable (dependencies complete), takes the
//! per-target advisory lock when the task names a target, runs a ReAct
//! task with enriched context, and reports the outcome to the Team Lead
//! through the mailbox.  Between polls it checks its mailbox for a
//! `terminate` signal and exits at the next checkpoint.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use redtalon_agent::{AgentEvent, AgentRuntime, EventKind, TaskContext};
use redtalon_store::{FindingStore, LockManager, Mailbox, MessageKind, TaskQueue};

use crate::decompose::TaskType;

/// Recipient id of the Team Lead in the mailbox.
pub const TEAM_LEAD_ID: &str = "team_lead";

/// How long a worker waits for a busy target lock before proceeding
/// without it (locks are advisory).
const LOCK_WAIT: Duration = Duration::from_secs(60);

static IPV4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("valid regex")
});

/// Everything one worker needs; handles are cheap clones of shared stores.
pub struct WorkerContext {
    pub agent_id: String,
    pub task_id: String,
    pub task_type: TaskType,
    pub queue: TaskQueue,
    pub mailbox: Mailbox,
    pub locks: LockManager,
    pub findings: FindingStore,
    pub runtime: Arc<AgentRuntime>,
    /// Interval between claim attempts.
    pub poll_interval: Duration,
    /// Shared liveness set; the worker removes itself on exit so the Team
    /// Lead's recovery pass can spot abandoned tasks.
    pub live_workers: Arc<Mutex<HashSet<String>>>,
}

/// Run one worker to completion.
pub async fn run_worker(ctx: WorkerContext) {
    ctx.mailbox.register(&ctx.agent_id);
    if let Ok(mut live) = ctx.live_workers.lock() {
        live.insert(ctx.agent_id.clone());
    }

    let outcome = worker_loop(&ctx).await;
    if let Err(e) = outcome {
        // Failing to reach the stores is fatal for this worker; the task
        // will be recovered by the Team Lead's orphan pass.
        warn!(worker = %ctx.agent_id, error = %e, "worker aborted on store error");
    }

    if let Ok(mut live) = ctx.live_workers.lock() {
        live.remove(&ctx.agent_id);
    }
    ctx.mailbox.unregister(&ctx.agent_id);
    debug!(worker = %ctx.agent_id, "worker exited");
}

async fn worker_loop(ctx: &WorkerContext) -> Result<(), redtalon_store::StoreError> {
    // Wait for the task to become claimable; honour terminate while waiting.
    let task = loop {
        if terminate_requested(ctx).await? {
            info!(worker = %ctx.agent_id, "terminated before claiming");
            return Ok(());
        }
        if let Some(task) = ctx.queue.claim_by_id(&ctx.agent_id, &ctx.task_id).await? {
            break task;
        }
        tokio::time::sleep(ctx.poll_interval).await;
    };

    info!(worker = %ctx.agent_id, task = %task.id, "task claimed, starting execution");

    // Advisory lock around the task's target, when it names one.
    let lock_resource = IPV4
        .find(&task.description)
        .map(|m| format!("target_{}", m.as_str()));
    if let Some(ref resource) = lock_resource {
        let acquired = ctx
            .locks
            .acquire(resource, &ctx.agent_id, LOCK_WAIT)
            .await?;
        if !acquired {
            warn!(worker = %ctx.agent_id, resource = %resource, "target lock busy, proceeding unlocked");
        }
    }

    let context = build_task_context(ctx, &task.description).await?;
    let mut rx = ctx.runtime.run_task(task.description.clone(), context);

    let mut final_event: Option<AgentEvent> = None;
    while let Some(event) = rx.recv().await {
        if event.is_final {
            final_event = Some(event);
        }
    }

    match final_event {
        Some(event) if event.kind == EventKind::Assistant => {
            let summary: String = event.content.chars().take(200).collect();
            ctx.queue.complete(&task.id, &event.content).await?;
            ctx.mailbox
                .send(
                    &ctx.agent_id,
                    TEAM_LEAD_ID,
                    MessageKind::TaskComplete,
                    json!({"task_id": task.id, "summary": summary}),
                )
                .await?;
            info!(worker = %ctx.agent_id, task = %task.id, "task completed");
        }
        Some(event) => {
            // Terminal system event: timeout, iteration cap, or provider
            // failure.
            ctx.queue.fail(&task.id, &event.content).await?;
            ctx.mailbox
                .send(
                    &ctx.agent_id,
                    TEAM_LEAD_ID,
                    MessageKind::Error,
                    json!({"task_id": task.id, "error": event.content}),
                )
                .await?;
            warn!(worker = %ctx.agent_id, task = %task.id, reason = %event.content, "task failed");
        }
        None => {
            let reason = "agent stream closed without a terminal event";
            ctx.queue.fail(&task.id, reason).await?;
            ctx.mailbox
                .send(
                    &ctx.agent_id,
                    TEAM_LEAD_ID,
                    MessageKind::Error,
                    json!({"task_id": task.id, "error": reason}),
                )
                .await?;
        }
    }

    if let Some(ref resource) = lock_resource {
        let _ = ctx.locks.release(resource, &ctx.agent_id).await?;
    }

    Ok(())
}

/// Drain this worker's mailbox; true when a terminate signal arrived.
async fn terminate_requested(ctx: &WorkerContext) -> Result<bool, redtalon_store::StoreError> {
    let messages = ctx.mailbox.receive(&ctx.agent_id, true).await?;
    Ok(messages.iter().any(|m| m.kind == MessageKind::Terminate))
}

/// Enrich the ReAct context with peer results and type-specific tool hints.
async fn build_task_context(
    ctx: &WorkerContext,
    description: &str,
) -> Result<TaskContext, redtalon_store::StoreError> {
    let peers = ctx.queue.completed().await?;
    let peer_summaries: Vec<String> = peers
        .iter()
        .filter_map(|t| {
            t.result
                .as_ref()
                .map(|r| format!("{}: {}", t.id, r.chars().take(200).collect::<String>()))
        })
        .collect();

    let targets: Vec<String> = IPV4
        .find_iter(description)
        .map(|m| m.as_str().to_string())
        .collect();

    let findings = ctx.findings.list().await?;

    Ok(TaskContext {
        phase: ctx.task_type.as_str().to_string(),
        targets,
        findings,
        tool_hints: ctx.task_type.tool_hints(),
        peer_summaries,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_extraction_finds_targets() {
        assert_eq!(
            IPV4.find("Nmap scan: assess host 10.10.10.5 fully").unwrap().as_str(),
            "10.10.10.5"
        );
        assert!(IPV4.find("enumerate example.com directories").is_none());
    }
}
