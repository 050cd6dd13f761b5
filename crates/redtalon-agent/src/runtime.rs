//! ReAct agent runtime.
//!
//! Drives the observe→think→act→evaluate loop for one task: call the LLM
//! router, execute any tool calls through the bridge, feed compressed
//! results back into the conversation, repeat.  The loop is bounded both by
//! an iteration budget and a wall-clock timeout, and every task emits
//! exactly one terminal event — timeouts and provider failures surface as
//! final system events, never as errors.
//!
//! Callers consume progress as a stream of [`AgentEvent`]s from the channel
//! returned by [`AgentRuntime::run_task`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use redtalon_core::Finding;

use crate::bridge::{ToolBridge, ToolCallRequest};
use crate::llm::limits::{context_limit, estimate_conversation_tokens};
use crate::llm::router::LlmRouter;
use crate::llm::types::{ChatMessage, ToolSchema};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Classes of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Lifecycle and error notices.
    System,
    /// The agent is about to invoke a tool.
    Thinking,
    /// A tool finished executing.
    Tool,
    /// Assistant text from the model.
    Assistant,
}

/// One step in a task's event stream.  Exactly one event per task carries
/// `is_final = true`.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub kind: EventKind,
    pub content: String,
    pub metadata: Value,
    pub is_final: bool,
}

impl AgentEvent {
    fn new(kind: EventKind, content: impl Into<String>, metadata: Value) -> Self {
        Self {
            kind,
            content: content.into(),
            metadata,
            is_final: false,
        }
    }

    fn terminal(kind: EventKind, content: impl Into<String>, metadata: Value) -> Self {
        Self {
            kind,
            content: content.into(),
            metadata,
            is_final: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration and context
// ---------------------------------------------------------------------------

/// Limits for one runtime instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum LLM↔tool cycles per task.
    pub max_iterations: u32,
    /// Wall-clock budget per task.
    pub task_timeout: Duration,
    /// Maximum characters of tool output fed back into the conversation.
    pub output_max_chars: usize,
    /// Emit intermediate assistant/thinking events, not just the final one.
    pub verbose: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            task_timeout: Duration::from_secs(600),
            output_max_chars: 3000,
            verbose: true,
        }
    }
}

/// Engagement context injected into the system prompt.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    /// Current engagement phase (e.g. "recon").
    pub phase: String,
    /// Targets this task concerns.
    pub targets: Vec<String>,
    /// Recent findings; the last five are surfaced to the model.
    pub findings: Vec<Finding>,
    /// Tools the task type favours.
    pub tool_hints: Vec<String>,
    /// Result summaries from already-completed peer tasks.
    pub peer_summaries: Vec<String>,
}

/// Router reachability at initialization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// At least one provider answered the health probe.
    Ready,
    /// No provider is reachable; tasks may still succeed if one recovers.
    Degraded,
    NotInitialized,
}

/// Introspection snapshot.
#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub initialized: bool,
    pub health: HealthStatus,
    pub provider_reachable: HashMap<String, bool>,
    pub total_tasks: u64,
    pub last_iterations: u32,
}

struct RuntimeState {
    initialized: bool,
    health: HealthStatus,
    provider_reachable: HashMap<String, bool>,
    total_tasks: u64,
    last_iterations: u32,
    conversation: Vec<ChatMessage>,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Single-agent ReAct loop over a router and a tool bridge.
pub struct AgentRuntime {
    config: RuntimeConfig,
    router: Arc<LlmRouter>,
    bridge: Arc<ToolBridge>,
    state: tokio::sync::Mutex<RuntimeState>,
}

impl AgentRuntime {
    pub fn new(config: RuntimeConfig, router: Arc<LlmRouter>, bridge: Arc<ToolBridge>) -> Self {
        Self {
            config,
            router,
            bridge,
            state: tokio::sync::Mutex::new(RuntimeState {
                initialized: false,
                health: HealthStatus::NotInitialized,
                provider_reachable: HashMap::new(),
                total_tasks: 0,
                last_iterations: 0,
                conversation: Vec::new(),
            }),
        }
    }

    /// Probe provider reachability and mark the runtime initialized.
    ///
    /// A degraded result is not fatal — a task may still succeed once a
    /// provider recovers.
    pub async fn initialize(&self) -> HealthStatus {
        let health = self.router.health_check().await;
        let reachable: HashMap<String, bool> =
            health.iter().map(|(k, v)| (k.clone(), v.reachable)).collect();
        let any_reachable = reachable.values().any(|r| *r);

        let status = if any_reachable {
            HealthStatus::Ready
        } else {
            warn!("no LLM providers reachable; first task will likely fail");
            HealthStatus::Degraded
        };

        let mut state = self.state.lock().await;
        state.initialized = true;
        state.health = status;
        state.provider_reachable = reachable;
        info!(health = ?status, "agent runtime initialized");
        status
    }

    /// Execute one task through the full ReAct loop.
    ///
    /// Returns immediately with the event channel; the loop runs as a
    /// background task and closes the channel after the terminal event.
    pub fn run_task(
        self: &Arc<Self>,
        objective: impl Into<String>,
        context: TaskContext,
    ) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(64);
        let runtime = Arc::clone(self);
        let objective = objective.into();
        tokio::spawn(async move {
            runtime.run_task_inner(objective, context, tx).await;
        });
        rx
    }

    async fn run_task_inner(
        &self,
        objective: String,
        context: TaskContext,
        tx: mpsc::Sender<AgentEvent>,
    ) {
        if !self.state.lock().await.initialized {
            self.initialize().await;
        }

        let task_number = {
            let mut state = self.state.lock().await;
            state.total_tasks += 1;
            state.last_iterations = 0;
            state.total_tasks
        };

        let started = Instant::now();
        info!(task = task_number, objective = %objective, "task started");

        let mut conversation = vec![
            ChatMessage::system(build_system_prompt(&context)),
            ChatMessage::user(objective.clone()),
        ];

        let _ = tx
            .send(AgentEvent::new(
                EventKind::System,
                format!("Processing task: {objective}"),
                json!({"phase": "start", "task": task_number}),
            ))
            .await;

        let tools = self.bridge.all_tools();
        let model = self
            .router
            .providers()
            .first()
            .map(|p| p.model.clone())
            .unwrap_or_default();

        let mut iteration = 0u32;
        loop {
            if iteration >= self.config.max_iterations {
                let _ = tx
                    .send(AgentEvent::terminal(
                        EventKind::System,
                        format!(
                            "Max iterations ({}) reached. Task may be incomplete.",
                            self.config.max_iterations
                        ),
                        json!({
                            "reason": "max_iterations",
                            "elapsed_secs": started.elapsed().as_secs_f64(),
                        }),
                    ))
                    .await;
                break;
            }
            iteration += 1;

            let elapsed = started.elapsed();
            if elapsed > self.config.task_timeout {
                let _ = tx
                    .send(AgentEvent::terminal(
                        EventKind::System,
                        format!("Task timeout after {}s", elapsed.as_secs()),
                        json!({"reason": "timeout"}),
                    ))
                    .await;
                break;
            }

            debug!(
                iteration,
                max = self.config.max_iterations,
                elapsed_secs = elapsed.as_secs_f64(),
                "react iteration"
            );

            trim_conversation(&mut conversation, &model, iteration);

            let tools_arg = if tools.is_empty() {
                None
            } else {
                Some(tools.as_slice())
            };
            let outcome = match self.router.chat(&conversation, tools_arg).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Full chain goes to the log; events get a short reason.
                    warn!(error = %e, "LLM call failed, terminating task");
                    let _ = tx
                        .send(AgentEvent::terminal(
                            EventKind::System,
                            "LLM error: all providers failed — check provider health",
                            json!({"reason": "provider_failure"}),
                        ))
                        .await;
                    break;
                }
            };

            // No tool calls: the model is done with the task.
            if outcome.tool_calls.is_empty() {
                let content = if outcome.content.is_empty() {
                    "(no response)".to_string()
                } else {
                    outcome.content.clone()
                };
                conversation.push(ChatMessage::assistant(&outcome.content));
                let _ = tx
                    .send(AgentEvent::terminal(
                        EventKind::Assistant,
                        content,
                        json!({
                            "iteration": iteration,
                            "finish_reason": outcome.finish_reason,
                            "elapsed_secs": started.elapsed().as_secs_f64(),
                        }),
                    ))
                    .await;
                info!(
                    iterations = iteration,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "task complete"
                );
                break;
            }

            if self.config.verbose && !outcome.content.is_empty() {
                let _ = tx
                    .send(AgentEvent::new(
                        EventKind::Assistant,
                        outcome.content.clone(),
                        json!({
                            "iteration": iteration,
                            "model": outcome.model,
                            "latency_secs": outcome.latency,
                        }),
                    ))
                    .await;
            }

            // Record the assistant turn, giving empty call ids a real one.
            let mut calls = outcome.tool_calls.clone();
            for call in &mut calls {
                if call.id.is_empty() {
                    call.id = format!("call_{}", Uuid::now_v7().simple());
                }
            }
            conversation.push(ChatMessage::assistant_tool_calls(
                outcome.content.clone(),
                calls.clone(),
            ));

            for call in &calls {
                let _ = tx
                    .send(AgentEvent::new(
                        EventKind::Thinking,
                        format!("Calling tool: {}", call.name),
                        json!({"iteration": iteration, "tool": call.name}),
                    ))
                    .await;

                let result = self.bridge.dispatch(ToolCallRequest::from(call)).await;
                let feedback = result.context_text();

                let _ = tx
                    .send(AgentEvent::new(
                        EventKind::Tool,
                        display_excerpt(&feedback),
                        json!({
                            "iteration": iteration,
                            "tool": call.name,
                            "success": result.success,
                            "output_chars": feedback.len(),
                        }),
                    ))
                    .await;

                let compressed =
                    compress_output(&call.name, &feedback, self.config.output_max_chars);
                conversation.push(ChatMessage::tool_result(&call.id, compressed));

                debug!(
                    tool = %call.name,
                    success = result.success,
                    chars = feedback.len(),
                    "tool result recorded"
                );
            }
        }

        let mut state = self.state.lock().await;
        state.last_iterations = iteration;
        state.conversation = conversation;
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Introspection snapshot.
    pub async fn status(&self) -> RuntimeStatus {
        let state = self.state.lock().await;
        RuntimeStatus {
            initialized: state.initialized,
            health: state.health,
            provider_reachable: state.provider_reachable.clone(),
            total_tasks: state.total_tasks,
            last_iterations: state.last_iterations,
        }
    }

    /// Clear the stored conversation for a fresh task.
    pub async fn reset_conversation(&self) {
        let mut state = self.state.lock().await;
        state.conversation.clear();
        state.last_iterations = 0;
    }

    /// Shut down: resets all state including health.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.initialized = false;
        state.health = HealthStatus::NotInitialized;
        state.provider_reachable.clear();
        state.conversation.clear();
        info!("agent runtime shut down");
    }
}

// ---------------------------------------------------------------------------
// Prompt and conversation helpers
// ---------------------------------------------------------------------------

/// Conversation-size fraction of the context window that triggers trimming.
const TRIM_THRESHOLD: f64 = 0.60;

/// Compact system prompt for limited context windows.
fn build_system_prompt(context: &TaskContext) -> String {
    let phase = if context.phase.is_empty() {
        "autonomous"
    } else {
        &context.phase
    };

    let mut prompt = String::from(
        "You are RedTalon, an autonomous red-team agent operating inside a \
         pre-authorized engagement. You ACT by calling tools, never just advise.\n\n\
         RULES:\n\
         - NEVER fabricate tool output or write <tool_response> blocks\n\
         - Wait for REAL tool results before analyzing\n\
         - Stay within target scope, no destructive commands\n\
         - Report each vulnerability you confirm\n\n\
         WORKFLOW: recon → enumerate findings → vulnerability analysis → \
         exploitation → validation\n\n",
    );

    let targets = if context.targets.is_empty() {
        "user-specified".to_string()
    } else {
        context.targets.join(", ")
    };
    prompt.push_str(&format!(
        "Phase: {phase} | Targets: {targets} | Findings: {}\n",
        context.findings.len()
    ));

    for finding in context.findings.iter().rev().take(5).rev() {
        prompt.push_str(&format!("  {}\n", finding.prompt_line()));
    }

    if !context.tool_hints.is_empty() {
        prompt.push_str(&format!("Preferred tools: {}\n", context.tool_hints.join(", ")));
    }
    for summary in &context.peer_summaries {
        prompt.push_str(&format!("Peer result: {summary}\n"));
    }

    prompt
}

/// Bound cross-iteration growth: past 60 % of the context window, keep the
/// first two messages (system + objective) and the last two, replacing the
/// middle with a short system note.
fn trim_conversation(conversation: &mut Vec<ChatMessage>, model: &str, iteration: u32) {
    let threshold = (context_limit(model) as f64 * TRIM_THRESHOLD) as usize;
    if estimate_conversation_tokens(conversation) <= threshold || conversation.len() <= 4 {
        return;
    }

    let n = conversation.len();
    let removed = n - 4;
    let mut trimmed = Vec::with_capacity(5);
    trimmed.extend_from_slice(&conversation[..2]);
    trimmed.push(ChatMessage::system(format!(
        "[{removed} messages trimmed. Iteration: {iteration}. Continue task.]"
    )));
    trimmed.extend_from_slice(&conversation[n - 2..]);

    info!(
        before = n,
        after = trimmed.len(),
        "conversation trimmed to fit context"
    );
    *conversation = trimmed;
}

/// Display copy of tool output for events.
fn display_excerpt(output: &str) -> String {
    truncate_at_boundary(output, 2000).to_string()
}

/// Compress tool output to fit the conversation budget.
///
/// JSON survives pretty-printed when it fits; short text is character
/// truncated; long text keeps the first and last 30 lines under a summary
/// header.
pub fn compress_output(tool_name: &str, output: &str, max_chars: usize) -> String {
    if output.len() <= max_chars {
        return output.to_string();
    }

    if let Ok(data) = serde_json::from_str::<Value>(output) {
        let pretty = serde_json::to_string_pretty(&data).unwrap_or_else(|_| output.to_string());
        if pretty.len() <= max_chars {
            return pretty;
        }
        return format!(
            "{}\n... [JSON TRUNCATED: {} total chars]",
            truncate_at_boundary(&pretty, max_chars.saturating_sub(100)),
            pretty.len()
        );
    }

    let lines: Vec<&str> = output.lines().collect();
    if lines.len() <= 100 {
        return format!(
            "{}\n... [TRUNCATED: {} total chars]",
            truncate_at_boundary(output, max_chars.saturating_sub(80)),
            output.len()
        );
    }

    let head = lines[..30].join("\n");
    let tail = lines[lines.len() - 30..].join("\n");
    let compressed = format!(
        "[{tool_name}] {} lines, {} chars — first 30 + last 30:\n{head}\n\n... [MIDDLE OMITTED] ...\n\n{tail}",
        lines.len(),
        output.len(),
    );

    if compressed.len() > max_chars {
        return format!(
            "{}\n... [TRUNCATED: {} total chars]",
            truncate_at_boundary(&compressed, max_chars.saturating_sub(80)),
            output.len()
        );
    }
    compressed
}

fn truncate_at_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
