//! Objective decomposition.
//!
//! The Team Lead asks the LLM to break an objective into a JSON array of
//! subtasks with dependencies.  Model output is parsed defensively — the
//! outermost bracketed array is sliced out of whatever prose surrounds it —
//! and any parse failure falls back to a fixed default graph so an
//! engagement never stalls on a malformed decomposition.

use serde_json::Value;
use tracing::{info, warn};

use redtalon_agent::{ChatMessage, LlmRouter};

// ---------------------------------------------------------------------------
// Task specs
// ---------------------------------------------------------------------------

/// Worker specialization for a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Recon,
    Exploit,
    Validator,
    BinaryAnalyst,
    General,
}

impl TaskType {
    pub fn parse(s: &str) -> Self {
        match s {
            "recon" => Self::Recon,
            "exploit" => Self::Exploit,
            "validator" => Self::Validator,
            "binary_analyst" => Self::BinaryAnalyst,
            _ => Self::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recon => "recon",
            Self::Exploit => "exploit",
            Self::Validator => "validator",
            Self::BinaryAnalyst => "binary_analyst",
            Self::General => "general",
        }
    }

    /// Tools a worker of this type should prefer.
    pub fn tool_hints(&self) -> Vec<String> {
        let tools: &[&str] = match self {
            Self::Recon => &["nmap", "nuclei", "dirb", "subdomain_enum", "whois"],
            Self::Exploit => &["metasploit", "search_web", "download_poc", "compile_exploit"],
            Self::Validator => &["playwright", "screenshot", "http_client"],
            Self::BinaryAnalyst => &["ghidra", "radare2", "pattern_matcher"],
            Self::General => &[],
        };
        tools.iter().map(|s| s.to_string()).collect()
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decomposed subtask, before it becomes a queue [`redtalon_store::Task`].
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: String,
    pub description: String,
    pub dependencies: Vec<String>,
    pub task_type: TaskType,
    pub priority: i64,
}

// ---------------------------------------------------------------------------
// Decomposition
// ---------------------------------------------------------------------------

const DECOMPOSE_SYSTEM_PROMPT: &str = "\
You are a penetration-test team lead. Break the request into subtasks.

Rules:
1. Identify INDEPENDENT tasks (can run in parallel)
2. Identify DEPENDENT tasks (must wait for others)
3. Each task needs: id, desc, deps (list of dependency ids), type \
(recon/exploit/validator/binary_analyst/general)

Output a JSON array ONLY. No explanation.";

/// Decompose an objective via the router, falling back to the default graph
/// on any failure.
pub async fn decompose(router: &LlmRouter, objective: &str) -> Vec<TaskSpec> {
    let messages = vec![
        ChatMessage::system(DECOMPOSE_SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Request: {objective}\n\nBreak into subtasks with dependencies.\n\
             Output format: [{{\"id\": \"task_1\", \"desc\": \"...\", \"deps\": [], \"type\": \"recon\"}}, ...]"
        )),
    ];

    match router.chat(&messages, None).await {
        Ok(outcome) => match parse_decomposition(&outcome.content) {
            Some(specs) => {
                info!(count = specs.len(), "objective decomposed");
                specs
            }
            None => {
                warn!("could not parse task decomposition, using defaults");
                default_decomposition(objective)
            }
        },
        Err(e) => {
            warn!(error = %e, "decomposition call failed, using defaults");
            default_decomposition(objective)
        }
    }
}

/// Slice the outermost `[...]` from the text and parse it into task specs.
/// `None` when no usable array is present.
pub fn parse_decomposition(text: &str) -> Option<Vec<TaskSpec>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }

    let items: Vec<Value> = serde_json::from_str(&text[start..=end]).ok()?;
    let mut specs = Vec::with_capacity(items.len());

    for item in items {
        let id = item["id"].as_str()?.to_string();
        let description = item["desc"]
            .as_str()
            .or_else(|| item["description"].as_str())?
            .to_string();
        let dependencies = item["deps"]
            .as_array()
            .or_else(|| item["dependencies"].as_array())
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let task_type = TaskType::parse(item["type"].as_str().unwrap_or("general"));
        let priority = item["priority"].as_i64().unwrap_or(0);

        specs.push(TaskSpec {
            id,
            description,
            dependencies,
            task_type,
            priority,
        });
    }

    if specs.is_empty() { None } else { Some(specs) }
}

/// The fixed fallback graph: parallel recon, then analysis, exploitation,
/// and validation in a chain.
pub fn default_decomposition(objective: &str) -> Vec<TaskSpec> {
    vec![
        TaskSpec {
            id: "recon_nmap".into(),
            description: format!("Nmap scan: {objective}"),
            dependencies: vec![],
            task_type: TaskType::Recon,
            priority: 0,
        },
        TaskSpec {
            id: "recon_nuclei".into(),
            description: format!("Nuclei scan: {objective}"),
            dependencies: vec![],
            task_type: TaskType::Recon,
            priority: 0,
        },
        TaskSpec {
            id: "recon_dirb".into(),
            description: format!("Directory enumeration: {objective}"),
            dependencies: vec![],
            task_type: TaskType::Recon,
            priority: 0,
        },
        TaskSpec {
            id: "vuln_assess".into(),
            description: "Analyze scan results for vulnerabilities".into(),
            dependencies: vec!["recon_nmap".into(), "recon_nuclei".into()],
            task_type: TaskType::General,
            priority: 0,
        },
        TaskSpec {
            id: "exploit_vulns".into(),
            description: "Exploit identified vulnerabilities".into(),
            dependencies: vec!["vuln_assess".into()],
            task_type: TaskType::Exploit,
            priority: 0,
        },
        TaskSpec {
            id: "validate".into(),
            description: "Validate exploitation results".into(),
            dependencies: vec!["exploit_vulns".into()],
            task_type: TaskType::Validator,
            priority: 0,
        },
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_array() {
        let text = r#"[
            {"id": "t1", "desc": "Nmap scan 10.0.0.5", "deps": [], "type": "recon"},
            {"id": "t2", "desc": "Exploit findings", "deps": ["t1"], "type": "exploit"}
        ]"#;
        let specs = parse_decomposition(text).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].task_type, TaskType::Recon);
        assert_eq!(specs[1].dependencies, vec!["t1".to_string()]);
    }

    #[test]
    fn parses_array_wrapped_in_prose() {
        let text = "Here is the plan:\n[{\"id\": \"t1\", \"desc\": \"scan\", \"deps\": [], \"type\": \"recon\"}]\nGood luck!";
        let specs = parse_decomposition(text).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].id, "t1");
    }

    #[test]
    fn accepts_long_field_names() {
        let text = r#"[{"id": "t1", "description": "scan", "dependencies": ["t0"], "type": "recon"}]"#;
        let specs = parse_decomposition(text).unwrap();
        assert_eq!(specs[0].description, "scan");
        assert_eq!(specs[0].dependencies, vec!["t0".to_string()]);
    }

    #[test]
    fn unknown_type_becomes_general() {
        let text = r#"[{"id": "t1", "desc": "x", "deps": [], "type": "wizardry"}]"#;
        let specs = parse_decomposition(text).unwrap();
        assert_eq!(specs[0].task_type, TaskType::General);
    }

    #[test]
    fn garbage_yields_none() {
        assert!(parse_decomposition("no json here").is_none());
        assert!(parse_decomposition("]broken[").is_none());
        assert!(parse_decomposition("[]").is_none());
        assert!(parse_decomposition("[{\"desc\": \"missing id\"}]").is_none());
    }

    #[test]
    fn default_graph_shape() {
        let specs = default_decomposition("pentest 10.0.0.5");
        assert_eq!(specs.len(), 6);

        let recon: Vec<&TaskSpec> = specs
            .iter()
            .filter(|s| s.task_type == TaskType::Recon)
            .collect();
        assert_eq!(recon.len(), 3);
        assert!(recon.iter().all(|s| s.dependencies.is_empty()));

        let validate = specs.iter().find(|s| s.id == "validate").unwrap();
        assert_eq!(validate.dependencies, vec!["exploit_vulns".to_string()]);
        assert!(specs[0].description.contains("pentest 10.0.0.5"));
    }

    #[test]
    fn tool_hints_per_type() {
        assert!(TaskType::Recon.tool_hints().contains(&"nmap".to_string()));
        assert!(
            TaskType::Exploit
                .tool_hints()
                .contains(&"metasploit".to_string())
        );
        assert!(TaskType::General.tool_hints().is_empty());
    }

    #[test]
    fn type_round_trip() {
        for t in [
            TaskType::Recon,
            TaskType::Exploit,
            TaskType::Validator,
            TaskType::BinaryAnalyst,
            TaskType::General,
        ] {
            assert_eq!(TaskType::parse(t.as_str()), t);
        }
    }
}
