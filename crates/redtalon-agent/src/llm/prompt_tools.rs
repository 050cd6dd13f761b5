//! Prompt-based tool calling.
//!
//! Some endpoints (vLLM without auto tool choice, several OpenRouter
//! models) reject the native `tools` parameter.  The fallback embeds every
//! tool schema into the system prompt and asks the model to emit its calls
//! as JSON objects, which are then parsed back out of the free text.
//!
//! Parsing accepts two shapes, fenced or bare:
//!
//! ```text
//! {"tool_call": {"name": "nmap_scan", "arguments": {"target": "10.0.0.5"}}}
//! {"name": "nmap_scan", "arguments": {"target": "10.0.0.5"}}
//! ```
//!
//! Matched JSON spans and any hallucinated `<tool_response>` blocks are
//! stripped from the text so the caller gets clean assistant content.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::llm::types::{ChatMessage, Role, ToolCall, ToolSchema};

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced-json regex is valid")
});

static TOOL_RESPONSE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<tool_response>.*?</tool_response>").expect("tool-response regex is valid")
});

static TOOL_RESPONSE_TAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<tool_response>.*$").expect("tool-response tail regex is valid")
});

// ---------------------------------------------------------------------------
// Prompt rendering
// ---------------------------------------------------------------------------

/// Render tool schemas into the textual description embedded in the system
/// prompt.
pub fn render_tool_descriptions(tools: &[ToolSchema]) -> String {
    let mut out = Vec::with_capacity(tools.len());
    for tool in tools {
        let mut lines = vec![format!("  {}: {}", tool.name, tool.description)];

        let required: Vec<&str> = tool.parameters["required"]
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        if let Some(props) = tool.parameters["properties"].as_object() {
            for (pname, pinfo) in props {
                let ptype = pinfo["type"].as_str().unwrap_or("string");
                let pdesc = pinfo["description"].as_str().unwrap_or("");
                let req = if required.contains(&pname.as_str()) {
                    "REQUIRED"
                } else {
                    "optional"
                };
                lines.push(format!("    - {pname}: {ptype} ({req}) — {pdesc}"));
            }
        }
        out.push(lines.join("\n"));
    }
    out.join("\n")
}

/// Append tool-calling instructions to the conversation's system message,
/// inserting one if the conversation has none.
pub fn inject_tool_instructions(messages: &[ChatMessage], tools: &[ToolSchema]) -> Vec<ChatMessage> {
    let instruction = format!(
        "\n\nTo call a tool, output a JSON block: \
         {{\"tool_call\": {{\"name\": \"TOOL_NAME\", \"arguments\": {{\"param\": \"value\"}}}}}}\n\
         Available tools:\n{}\n",
        render_tool_descriptions(tools)
    );

    let mut out = Vec::with_capacity(messages.len() + 1);
    let mut injected = false;
    for msg in messages {
        if msg.role == Role::System && !injected {
            let mut patched = msg.clone();
            patched.content.push_str(&instruction);
            out.push(patched);
            injected = true;
        } else {
            out.push(msg.clone());
        }
    }
    if !injected {
        out.insert(0, ChatMessage::system(instruction));
    }
    out
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse tool calls out of free-text model output.
///
/// Returns the cleaned content (tool-call JSON and `<tool_response>` spans
/// removed) and the extracted calls.
pub fn parse_tool_calls(content: &str) -> (String, Vec<ToolCall>) {
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut remaining = content.to_string();

    // Fenced ```json blocks first.
    for capture in FENCED_JSON.captures_iter(content) {
        let whole = &capture[0];
        let inner = &capture[1];
        if let Some(call) = json_to_tool_call(inner, tool_calls.len()) {
            tool_calls.push(call);
            remaining = remaining.replace(whole, "");
        }
    }

    // Bare top-level JSON objects only when no fenced block yielded calls.
    if tool_calls.is_empty() {
        for span in extract_json_objects(content) {
            if let Some(call) = json_to_tool_call(&span, tool_calls.len()) {
                tool_calls.push(call);
                remaining = remaining.replace(&span, "");
            }
        }
    }

    let cleaned = TOOL_RESPONSE_BLOCK.replace_all(&remaining, "");
    let cleaned = TOOL_RESPONSE_TAIL.replace_all(&cleaned, "");

    (cleaned.trim().to_string(), tool_calls)
}

/// Interpret one JSON string as a tool call, accepting both the wrapped
/// `{"tool_call": {...}}` and the direct `{name, arguments}` shapes.
fn json_to_tool_call(raw: &str, index: usize) -> Option<ToolCall> {
    let parsed: Value = serde_json::from_str(raw).ok()?;
    let call = parsed.get("tool_call").unwrap_or(&parsed);

    let name = call.get("name")?.as_str()?;
    if name.is_empty() {
        return None;
    }
    let args = call.get("arguments").or_else(|| call.get("args"))?;
    let arguments = if args.is_object() {
        args.clone()
    } else {
        Value::Object(serde_json::Map::new())
    };

    Some(ToolCall {
        id: format!("prompt_call_{index}"),
        name: name.to_string(),
        arguments,
    })
}

/// Find every balanced top-level `{...}` object in `text`, honouring string
/// quoting and escapes so braces inside strings do not confuse the count.
pub fn extract_json_objects(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut results = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }

        let start = i;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escape = false;
        let mut matched_end: Option<usize> = None;

        for (j, &c) in bytes.iter().enumerate().skip(start) {
            if escape {
                escape = false;
                continue;
            }
            match c {
                b'\\' => escape = true,
                b'"' => in_string = !in_string,
                b'{' if !in_string => depth += 1,
                b'}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        matched_end = Some(j + 1);
                        break;
                    }
                }
                _ => {}
            }
        }

        match matched_end {
            Some(end) => {
                results.push(text[start..end].to_string());
                i = end;
            }
            // Unclosed brace — skip it.
            None => i += 1,
        }
    }

    results
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
