//! End-to-end engagement scenarios over a scripted LLM transport.
//!
//! Every LLM response is canned; tool execution runs through the real
//! bridge (with a stub nmap server and the real terminal server), and
//! coordination runs over a real in-memory SQLite database.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use redtalon_agent::{
    ChatTransport, HttpReply, LlmRouter, ProviderConfig, RuntimeConfig, TerminalServer,
    ToolBridge, ToolCallRequest, ToolResult, ToolSchema, ToolServer,
};
use redtalon_core::{Guardian, GuardianConfig};
use redtalon_store::{
    Database, FindingStore, LockManager, Mailbox, TaskQueue, TaskStatus,
};
use redtalon_team::{TeamLead, TeamLeadConfig};

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

/// Pops one canned reply per POST; health-check GETs always succeed.
struct ScriptedTransport {
    replies: Mutex<VecDeque<HttpReply>>,
}

impl ScriptedTransport {
    fn new(replies: Vec<HttpReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
        })
    }

    fn ok(body: Value) -> HttpReply {
        HttpReply {
            status: 200,
            body: body.to_string(),
        }
    }

    fn status(status: u16, body: &str) -> HttpReply {
        HttpReply {
            status,
            body: body.to_string(),
        }
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn post_json(
        &self,
        _url: &str,
        _api_key: Option<&str>,
        _body: &Value,
        _timeout: Duration,
    ) -> redtalon_agent::Result<HttpReply> {
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(HttpReply {
                status: 500,
                body: "script exhausted".to_string(),
            }))
    }

    async fn get(
        &self,
        _url: &str,
        _api_key: Option<&str>,
        _timeout: Duration,
    ) -> redtalon_agent::Result<HttpReply> {
        Ok(HttpReply {
            status: 200,
            body: "{}".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Canned responses and stub tools
// ---------------------------------------------------------------------------

fn text_response(text: &str) -> Value {
    json!({
        "choices": [{"message": {"content": text}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
        "model": "qwen-coder",
    })
}

fn tool_call_response(tool: &str, arguments: Value) -> Value {
    json!({
        "choices": [{
            "message": {
                "content": "",
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": tool, "arguments": arguments.to_string()},
                }],
            },
            "finish_reason": "tool_calls",
        }],
        "usage": {"prompt_tokens": 20, "completion_tokens": 10, "total_tokens": 30},
        "model": "qwen-coder",
    })
}

fn decomposition_response(tasks: Value) -> Value {
    text_response(&format!("Here is the plan:\n{tasks}"))
}

struct StubNmapServer;

#[async_trait]
impl ToolServer for StubNmapServer {
    fn name(&self) -> &str {
        "nmap"
    }

    fn get_tools(&self) -> Vec<ToolSchema> {
        vec![ToolSchema {
            name: "nmap_scan".into(),
            description: "Port scan a target".into(),
            parameters: json!({
                "type": "object",
                "properties": {"target": {"type": "string"}},
                "required": ["target"],
            }),
        }]
    }

    async fn execute_tool(&self, request: ToolCallRequest) -> ToolResult {
        let target = request.arguments["target"].as_str().unwrap_or("?").to_string();
        ToolResult {
            id: request.id,
            name: request.name,
            success: true,
            output: format!(
                "Nmap scan report for {target}\n22/tcp open ssh\n80/tcp open http"
            ),
            error: None,
            duration: 0.2,
            metadata: json!({"target": target}),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    lead: TeamLead,
    queue: TaskQueue,
}

async fn harness(replies: Vec<HttpReply>, guardian: Option<Guardian>) -> Harness {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();

    let queue = TaskQueue::new(db.clone());
    let mailbox = Mailbox::new(db.clone());
    let locks = LockManager::new(db.clone());
    let findings = FindingStore::new(db);

    let transport = ScriptedTransport::new(replies);
    let router = Arc::new(LlmRouter::with_transport(
        vec![ProviderConfig::local("scripted", "qwen-coder")],
        transport,
    ));

    let mut bridge = ToolBridge::new();
    if let Some(guardian) = guardian {
        bridge = bridge.with_guardian(Arc::new(guardian));
    }
    bridge.register_server(Arc::new(StubNmapServer));
    bridge.register_server(Arc::new(TerminalServer::new()));

    let config = TeamLeadConfig {
        monitor_interval: Duration::from_millis(25),
        cleanup_timeout: Duration::from_secs(5),
        worker_poll_interval: Duration::from_millis(10),
        max_respawns: 1,
        runtime: RuntimeConfig {
            max_iterations: 10,
            task_timeout: Duration::from_secs(30),
            output_max_chars: 3000,
            verbose: true,
        },
    };

    let lead = TeamLead::new(
        config,
        router,
        Arc::new(bridge),
        queue.clone(),
        mailbox,
        locks,
        findings,
    );

    Harness { lead, queue }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Single-task happy path: decompose → one recon worker → one nmap tool
/// call → final answer → synthesis.
#[tokio::test]
async fn single_task_happy_path() {
    let replies = vec![
        // Decomposition: one recon task, no dependencies.
        ScriptedTransport::ok(decomposition_response(json!([
            {"id": "recon_1", "desc": "Nmap scan 10.0.0.5", "deps": [], "type": "recon"}
        ]))),
        // Worker iteration 1: the model calls nmap_scan.
        ScriptedTransport::ok(tool_call_response("nmap_scan", json!({"target": "10.0.0.5"}))),
        // Worker iteration 2: final answer.
        ScriptedTransport::ok(text_response(
            "Scan complete. Host 10.0.0.5 exposes ssh (22) and http (80).",
        )),
        // Synthesis.
        ScriptedTransport::ok(text_response(
            "Executive summary: 10.0.0.5 exposes ssh and http; proceed to service enumeration.",
        )),
    ];

    let h = harness(replies, None).await;
    let report = h.lead.orchestrate("scan 10.0.0.5").await.unwrap();

    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.status_counts.get("complete"), Some(&1));
    assert_eq!(report.status_counts.get("failed"), None);
    assert!(report.unsatisfied.is_empty());
    assert!(report.executive_summary.contains("Executive summary"));

    let task = h.queue.get("recon_1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
    assert!(task.result.unwrap().contains("ssh (22)"));
}

/// Dependency gating: the dependent task only runs after its prerequisite
/// completes, and its context carries the peer's result.
#[tokio::test]
async fn dependent_task_waits_for_prerequisite() {
    let replies = vec![
        ScriptedTransport::ok(decomposition_response(json!([
            {"id": "t1", "desc": "Nmap scan 10.0.0.5", "deps": [], "type": "recon"},
            {"id": "t2", "desc": "Analyze scan results", "deps": ["t1"], "type": "general"}
        ]))),
        // t1 answers immediately.
        ScriptedTransport::ok(text_response("t1 done: ports 22/80 open")),
        // t2 runs strictly after t1 completed.
        ScriptedTransport::ok(text_response("t2 done: ssh and http are interesting")),
        // Synthesis.
        ScriptedTransport::ok(text_response("Both phases complete.")),
    ];

    let h = harness(replies, None).await;
    let report = h.lead.orchestrate("assess 10.0.0.5").await.unwrap();

    assert_eq!(report.completed.len(), 2);

    let t1 = h.queue.get("t1").await.unwrap().unwrap();
    let t2 = h.queue.get("t2").await.unwrap().unwrap();
    assert_eq!(t1.status, TaskStatus::Complete);
    assert_eq!(t2.status, TaskStatus::Complete);
    // t2 could not have been claimed before t1 finished.
    assert!(t2.started_at.unwrap() >= t1.completed_at.unwrap());
}

/// Guardian denial: a blocked command surfaces as a failed tool result, the
/// model sees the error and recovers, and the task still completes.
#[tokio::test]
async fn guardian_denial_does_not_fail_the_task() {
    let replies = vec![
        ScriptedTransport::ok(decomposition_response(json!([
            {"id": "t1", "desc": "Clean up host 10.0.0.5", "deps": [], "type": "general"}
        ]))),
        // The model tries something destructive.
        ScriptedTransport::ok(tool_call_response(
            "run_terminal_command",
            json!({"command": "rm -rf /"}),
        )),
        // After seeing the block, it recovers with a final answer.
        ScriptedTransport::ok(text_response(
            "The destructive command was blocked; no cleanup performed.",
        )),
        // Synthesis.
        ScriptedTransport::ok(text_response("Engagement finished without incident.")),
    ];

    let guardian = Guardian::new(GuardianConfig::default()).unwrap();
    let h = harness(replies, Some(guardian)).await;
    let report = h.lead.orchestrate("clean up 10.0.0.5").await.unwrap();

    // The task did NOT fail — the denial fed back into the loop.
    assert_eq!(report.status_counts.get("complete"), Some(&1));
    assert_eq!(report.status_counts.get("failed"), None);

    let task = h.queue.get("t1").await.unwrap().unwrap();
    assert!(task.result.unwrap().contains("blocked"));
}

/// A failed task blocks its dependents forever; the lead detects the dead
/// branch, reports it, and still produces a report.
#[tokio::test]
async fn failed_dependency_is_reported_unsatisfied() {
    let replies = vec![
        ScriptedTransport::ok(decomposition_response(json!([
            {"id": "t1", "desc": "Initial probe", "deps": [], "type": "recon"},
            {"id": "t2", "desc": "Follow-up exploitation", "deps": ["t1"], "type": "exploit"}
        ]))),
        // t1's only LLM call is rejected outright → provider chain exhausts
        // → the worker fails the task.
        ScriptedTransport::status(400, "malformed request"),
        // No further replies: t2 never claims, synthesis sees no completed
        // tasks and skips the LLM.
    ];

    let h = harness(replies, None).await;
    let report = h.lead.orchestrate("probe then exploit").await.unwrap();

    assert_eq!(report.status_counts.get("failed"), Some(&1));
    assert_eq!(report.status_counts.get("pending"), Some(&1));
    assert_eq!(report.unsatisfied, vec!["t2".to_string()]);
    assert_eq!(report.executive_summary, "No tasks completed.");

    let t1 = h.queue.get("t1").await.unwrap().unwrap();
    assert_eq!(t1.status, TaskStatus::Failed);
}

/// Unparseable decomposition falls back to the fixed default graph.
#[tokio::test]
async fn decomposition_fallback_uses_default_graph() {
    let mut replies = vec![
        // Decomposition reply contains no JSON array.
        ScriptedTransport::ok(text_response("I cannot plan this, sorry.")),
    ];
    // Six default tasks, each answered immediately; order of recon tasks is
    // nondeterministic but each response is interchangeable.
    for i in 0..6 {
        replies.push(ScriptedTransport::ok(text_response(&format!(
            "task {i} done"
        ))));
    }
    // Synthesis.
    replies.push(ScriptedTransport::ok(text_response("All six phases done.")));

    let h = harness(replies, None).await;
    let report = h.lead.orchestrate("pentest 10.0.0.9").await.unwrap();

    assert_eq!(report.completed.len(), 6);
    assert!(h.queue.get("recon_nmap").await.unwrap().is_some());
    assert!(h.queue.get("validate").await.unwrap().is_some());
    assert_eq!(report.status_counts.get("complete"), Some(&6));
}
