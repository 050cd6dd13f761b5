//! Tool bridge — registry and dispatcher over tool servers.
//!
//! The ReAct runtime never talks to a tool server directly.  Every tool
//! call resolves through the bridge, which finds the owning server,
//! validates any shell command with the Guardian, executes under a timeout,
//! and returns a structured result.  Failures come back as failed results,
//! never as errors — the LLM sees the error text on its next turn and can
//! self-correct.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use redtalon_core::{Guardian, SessionKind};

use crate::llm::types::{ToolCall, ToolSchema};

/// Tool names may carry this prefix (some models echo the product name);
/// resolution strips it before lookup.
const TOOL_PREFIX: &str = "redtalon_";

/// Default timeout for one tool execution.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Tool server contract
// ---------------------------------------------------------------------------

/// A request dispatched to a tool server.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Correlation id from the LLM tool call.
    pub id: String,
    /// Tool name as the model emitted it.
    pub name: String,
    /// JSON arguments.
    pub arguments: Value,
}

impl From<&ToolCall> for ToolCallRequest {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        }
    }
}

/// Structured result of one tool execution.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    /// Wall-clock seconds.
    pub duration: f64,
    pub metadata: Value,
}

impl ToolResult {
    fn failure(request: &ToolCallRequest, error: impl Into<String>) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            success: false,
            output: String::new(),
            error: Some(error.into()),
            duration: 0.0,
            metadata: Value::Null,
        }
    }

    /// The text fed back into the conversation.
    pub fn context_text(&self) -> String {
        if self.success {
            self.output.clone()
        } else {
            format!("ERROR: {}", self.error.as_deref().unwrap_or("unknown"))
        }
    }
}

/// A server wrapping one external tool (or a family of tools).
///
/// Tool implementations are opaque to the bridge: it only needs the
/// advertised schemas and an execution entry point.
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Registry name of this server.
    fn name(&self) -> &str;

    /// Tool schemas this server advertises to the LLM.
    fn get_tools(&self) -> Vec<ToolSchema>;

    /// Execute one tool call.
    async fn execute_tool(&self, request: ToolCallRequest) -> ToolResult;
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Aggregate dispatch counters.
#[derive(Debug, Clone)]
pub struct BridgeStats {
    pub registered_servers: usize,
    pub total_executions: usize,
    pub successes: usize,
    pub failures: usize,
    /// Successes over total, or `None` before the first dispatch.
    pub success_rate: Option<f64>,
}

struct ExecutionRecord {
    name: String,
    success: bool,
}

/// Registry and dispatcher over [`ToolServer`] instances.
pub struct ToolBridge {
    servers: HashMap<String, Arc<dyn ToolServer>>,
    /// tool schema name → server name, built at registration.
    tool_index: HashMap<String, String>,
    guardian: Option<Arc<Guardian>>,
    tool_timeout: Duration,
    log: Mutex<Vec<ExecutionRecord>>,
}

impl ToolBridge {
    pub fn new() -> Self {
        Self {
            servers: HashMap::new(),
            tool_index: HashMap::new(),
            guardian: None,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Attach the Guardian that validates `command` arguments.
    pub fn with_guardian(mut self, guardian: Arc<Guardian>) -> Self {
        self.guardian = Some(guardian);
        self
    }

    /// Override the per-call execution timeout.
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Register a tool server and index its advertised tools.
    pub fn register_server(&mut self, server: Arc<dyn ToolServer>) {
        let name = server.name().to_string();
        for schema in server.get_tools() {
            debug!(tool = %schema.name, server = %name, "tool indexed");
            self.tool_index.insert(schema.name, name.clone());
        }
        info!(server = %name, "tool server registered");
        self.servers.insert(name, server);
    }

    /// Register several servers at once.
    pub fn register_servers(&mut self, servers: impl IntoIterator<Item = Arc<dyn ToolServer>>) {
        for server in servers {
            self.register_server(server);
        }
    }

    /// Names of all registered servers.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    /// All tool schemas across every registered server.
    pub fn all_tools(&self) -> Vec<ToolSchema> {
        let mut tools: Vec<ToolSchema> = self
            .servers
            .values()
            .flat_map(|s| s.get_tools())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Dispatch a tool call to the owning server.
    ///
    /// Resolution order: the schema index as-is, then with the product
    /// prefix stripped, then the tool name treated as a server name.
    pub async fn dispatch(&self, request: ToolCallRequest) -> ToolResult {
        let started = Instant::now();

        let stripped = request.name.strip_prefix(TOOL_PREFIX).unwrap_or(&request.name);
        let server_name = self
            .tool_index
            .get(&request.name)
            .or_else(|| self.tool_index.get(stripped))
            .cloned()
            .unwrap_or_else(|| stripped.to_string());

        let Some(server) = self.servers.get(&server_name) else {
            let result = ToolResult::failure(
                &request,
                format!(
                    "no server registered for tool: {} (resolved: {server_name}); available servers: {}",
                    request.name,
                    self.server_names().join(", "),
                ),
            );
            self.record(&result);
            return result;
        };

        // Guardian validation for anything carrying a shell command.
        if let Some(ref guardian) = self.guardian {
            if let Some(command) = request.arguments.get("command").and_then(Value::as_str) {
                let validation = guardian.validate(command, SessionKind::Local);
                if validation.denied() {
                    warn!(
                        tool = %request.name,
                        risk = %validation.risk,
                        "tool call blocked by guardian"
                    );
                    let mut result = ToolResult::failure(
                        &request,
                        format!("Blocked by guardian: {}", validation.reasons.join("; ")),
                    );
                    result.metadata = serde_json::json!({
                        "risk_level": validation.risk.as_str(),
                    });
                    self.record(&result);
                    return result;
                }
            }
        }

        let mut result = match tokio::time::timeout(
            self.tool_timeout,
            server.execute_tool(request.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => ToolResult::failure(
                &request,
                format!("tool timed out after {}s", self.tool_timeout.as_secs()),
            ),
        };

        result.duration = started.elapsed().as_secs_f64();
        if !result.metadata.is_object() {
            result.metadata = serde_json::json!({});
        }
        result.metadata["server"] = Value::String(server_name);

        info!(
            tool = %result.name,
            success = result.success,
            duration = result.duration,
            "tool dispatched"
        );
        self.record(&result);
        result
    }

    /// Tool name and success flag for every dispatch so far.
    pub fn execution_log(&self) -> Vec<(String, bool)> {
        self.log
            .lock()
            .map(|l| l.iter().map(|r| (r.name.clone(), r.success)).collect())
            .unwrap_or_default()
    }

    /// Aggregate dispatch statistics.
    pub fn stats(&self) -> BridgeStats {
        let records = self.execution_log();
        let total = records.len();
        let successes = records.iter().filter(|(_, ok)| *ok).count();
        BridgeStats {
            registered_servers: self.servers.len(),
            total_executions: total,
            successes,
            failures: total - successes,
            success_rate: if total == 0 {
                None
            } else {
                Some(successes as f64 / total as f64)
            },
        }
    }

    fn record(&self, result: &ToolResult) {
        if let Ok(mut log) = self.log.lock() {
            log.push(ExecutionRecord {
                name: result.name.clone(),
                success: result.success,
            });
        }
    }
}

impl Default for ToolBridge {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use redtalon_core::GuardianConfig;
    use serde_json::json;

    struct EchoServer {
        server_name: String,
        tool_name: String,
    }

    #[async_trait]
    impl ToolServer for EchoServer {
        fn name(&self) -> &str {
            &self.server_name
        }

        fn get_tools(&self) -> Vec<ToolSchema> {
            vec![ToolSchema {
                name: self.tool_name.clone(),
                description: "Echo arguments".into(),
                parameters: json!({"type": "object"}),
            }]
        }

        async fn execute_tool(&self, request: ToolCallRequest) -> ToolResult {
            ToolResult {
                id: request.id.clone(),
                name: request.name.clone(),
                success: true,
                output: request.arguments.to_string(),
                error: None,
                duration: 0.0,
                metadata: Value::Null,
            }
        }
    }

    struct SlowServer;

    #[async_trait]
    impl ToolServer for SlowServer {
        fn name(&self) -> &str {
            "slow"
        }

        fn get_tools(&self) -> Vec<ToolSchema> {
            vec![ToolSchema {
                name: "slow_tool".into(),
                description: "Never finishes".into(),
                parameters: json!({"type": "object"}),
            }]
        }

        async fn execute_tool(&self, request: ToolCallRequest) -> ToolResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ToolResult::failure(&request, "unreachable")
        }
    }

    fn echo_bridge() -> ToolBridge {
        let mut bridge = ToolBridge::new();
        bridge.register_server(Arc::new(EchoServer {
            server_name: "nmap".into(),
            tool_name: "nmap_scan".into(),
        }));
        bridge
    }

    fn request(name: &str, arguments: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: "tc_1".into(),
            name: name.into(),
            arguments,
        }
    }

    #[tokio::test]
    async fn dispatch_by_schema_name() {
        let bridge = echo_bridge();
        let result = bridge
            .dispatch(request("nmap_scan", json!({"target": "10.0.0.5"})))
            .await;
        assert!(result.success);
        assert!(result.output.contains("10.0.0.5"));
        assert_eq!(result.metadata["server"], "nmap");
    }

    #[tokio::test]
    async fn dispatch_strips_product_prefix() {
        let bridge = echo_bridge();
        let result = bridge
            .dispatch(request("redtalon_nmap_scan", json!({})))
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn dispatch_falls_back_to_server_name() {
        let bridge = echo_bridge();
        // "nmap" is not a schema name, but it is a server name.
        let result = bridge.dispatch(request("nmap", json!({}))).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn unknown_tool_returns_failed_result() {
        let bridge = echo_bridge();
        let result = bridge.dispatch(request("ghost_tool", json!({}))).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("no server registered for tool: ghost_tool"));
        assert!(error.contains("nmap"));
    }

    #[tokio::test]
    async fn guardian_blocks_destructive_command() {
        let guardian = Arc::new(Guardian::new(GuardianConfig::default()).unwrap());
        let mut bridge = ToolBridge::new().with_guardian(guardian);
        bridge.register_server(Arc::new(EchoServer {
            server_name: "terminal".into(),
            tool_name: "run_terminal_command".into(),
        }));

        let result = bridge
            .dispatch(request("run_terminal_command", json!({"command": "rm -rf /"})))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Blocked"));
        assert_eq!(result.metadata["risk_level"], "blocked");
    }

    #[tokio::test]
    async fn guardian_allows_benign_command() {
        let guardian = Arc::new(Guardian::new(GuardianConfig::default()).unwrap());
        let mut bridge = ToolBridge::new().with_guardian(guardian);
        bridge.register_server(Arc::new(EchoServer {
            server_name: "terminal".into(),
            tool_name: "run_terminal_command".into(),
        }));

        let result = bridge
            .dispatch(request("run_terminal_command", json!({"command": "echo hi"})))
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn calls_without_command_skip_guardian() {
        let guardian = Arc::new(Guardian::new(GuardianConfig::default()).unwrap());
        let mut bridge = ToolBridge::new().with_guardian(guardian);
        bridge.register_server(Arc::new(EchoServer {
            server_name: "nmap".into(),
            tool_name: "nmap_scan".into(),
        }));

        let result = bridge
            .dispatch(request("nmap_scan", json!({"target": "10.0.0.5"})))
            .await;
        assert!(result.success);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let mut bridge = ToolBridge::new().with_tool_timeout(Duration::from_secs(1));
        bridge.register_server(Arc::new(SlowServer));

        let result = bridge.dispatch(request("slow_tool", json!({}))).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn stats_track_successes_and_failures() {
        let bridge = echo_bridge();
        bridge.dispatch(request("nmap_scan", json!({}))).await;
        bridge.dispatch(request("ghost", json!({}))).await;

        let stats = bridge.stats();
        assert_eq!(stats.registered_servers, 1);
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert!((stats.success_rate.unwrap() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn all_tools_aggregates_schemas() {
        let mut bridge = echo_bridge();
        bridge.register_server(Arc::new(EchoServer {
            server_name: "nuclei".into(),
            tool_name: "nuclei_scan".into(),
        }));

        let tools = bridge.all_tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "nmap_scan");
        assert_eq!(tools[1].name, "nuclei_scan");
    }
}
