//! Generic terminal tool server.
//!
//! The one concrete [`ToolServer`] that ships with the core: it runs a
//! shell command via `tokio::process::Command` and returns combined output.
//! Specific tool wrappers (nmap, nuclei, ...) live outside the core and
//! register alongside it; the terminal server is the seam every raw command
//! — and therefore the Guardian — flows through.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::bridge::{ToolCallRequest, ToolResult, ToolServer};
use crate::llm::types::ToolSchema;

/// Default timeout for generic terminal commands.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Maximum raw output bytes retained per command (the runtime compresses
/// further before feeding the conversation).
const MAX_OUTPUT_BYTES: usize = 100 * 1024;

/// Tool server executing raw shell commands.
pub struct TerminalServer {
    timeout_secs: u64,
}

impl TerminalServer {
    pub fn new() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Override the command timeout.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

impl Default for TerminalServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolServer for TerminalServer {
    fn name(&self) -> &str {
        "terminal"
    }

    fn get_tools(&self) -> Vec<ToolSchema> {
        vec![ToolSchema {
            name: "run_terminal_command".into(),
            description: "Execute a shell command on the operator machine and return its output"
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to execute",
                    },
                    "timeout_secs": {
                        "type": "integer",
                        "description": "Optional timeout override in seconds",
                    },
                },
                "required": ["command"],
            }),
        }]
    }

    async fn execute_tool(&self, request: ToolCallRequest) -> ToolResult {
        let Some(command) = request.arguments.get("command").and_then(|v| v.as_str()) else {
            return ToolResult {
                id: request.id,
                name: request.name,
                success: false,
                output: String::new(),
                error: Some("missing required string field `command`".into()),
                duration: 0.0,
                metadata: json!({}),
            };
        };

        let timeout_secs = request
            .arguments
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.timeout_secs);

        debug!(command, timeout_secs, "executing terminal command");

        let spawned = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return ToolResult {
                    id: request.id,
                    name: request.name,
                    success: false,
                    output: String::new(),
                    error: Some(format!("failed to spawn process: {e}")),
                    duration: 0.0,
                    metadata: json!({"command_executed": command}),
                };
            }
        };

        // On timeout the child is dropped and killed via kill_on_drop.
        let waited = tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            child.wait_with_output(),
        )
        .await;

        match waited {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1);
                let stdout = truncate_bytes(&output.stdout);
                let stderr = truncate_bytes(&output.stderr);
                let success = output.status.success();

                let combined = if !success && !stderr.is_empty() {
                    format!("{stdout}\n[STDERR]:\n{stderr}")
                } else {
                    stdout
                };

                ToolResult {
                    id: request.id,
                    name: request.name,
                    success,
                    output: combined,
                    error: if success {
                        None
                    } else {
                        Some(format!("exit code {exit_code}"))
                    },
                    duration: 0.0,
                    metadata: json!({"command_executed": command, "exit_code": exit_code}),
                }
            }
            Ok(Err(e)) => ToolResult {
                id: request.id,
                name: request.name,
                success: false,
                output: String::new(),
                error: Some(format!("process error: {e}")),
                duration: 0.0,
                metadata: json!({"command_executed": command}),
            },
            Err(_) => {
                warn!(command, timeout_secs, "terminal command timed out");
                ToolResult {
                    id: request.id,
                    name: request.name,
                    success: false,
                    output: String::new(),
                    error: Some(format!("command timed out after {timeout_secs}s")),
                    duration: 0.0,
                    metadata: json!({"command_executed": command}),
                }
            }
        }
    }
}

fn truncate_bytes(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    if text.len() <= MAX_OUTPUT_BYTES {
        text.into_owned()
    } else {
        let mut end = MAX_OUTPUT_BYTES;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}\n... [output truncated]", &text[..end])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn request(arguments: serde_json::Value) -> ToolCallRequest {
        ToolCallRequest {
            id: "tc_1".into(),
            name: "run_terminal_command".into(),
            arguments,
        }
    }

    #[tokio::test]
    async fn runs_simple_command() {
        let server = TerminalServer::new();
        let result = server
            .execute_tool(request(json!({"command": "echo hello"})))
            .await;
        assert!(result.success);
        assert_eq!(result.output.trim(), "hello");
        assert_eq!(result.metadata["exit_code"], 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure_with_stderr() {
        let server = TerminalServer::new();
        let result = server
            .execute_tool(request(json!({"command": "echo oops >&2; exit 3"})))
            .await;
        assert!(!result.success);
        assert!(result.output.contains("[STDERR]"));
        assert!(result.output.contains("oops"));
        assert_eq!(result.error.as_deref(), Some("exit code 3"));
    }

    #[tokio::test]
    async fn missing_command_is_rejected() {
        let server = TerminalServer::new();
        let result = server.execute_tool(request(json!({}))).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("command"));
    }

    #[tokio::test]
    async fn command_timeout_is_reported() {
        let server = TerminalServer::new();
        let result = server
            .execute_tool(request(json!({"command": "sleep 5", "timeout_secs": 1})))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[test]
    fn advertises_one_tool() {
        let server = TerminalServer::new();
        let tools = server.get_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "run_terminal_command");
        assert_eq!(tools[0].parameters["required"][0], "command");
    }
}
