//! Conversation consistency repair.
//!
//! Provider APIs reject conversations where an assistant `tool_calls` entry
//! has no matching `tool` response, or where a `tool` message answers a call
//! that was never made.  Interrupted tasks and trimmed histories produce
//! both.  [`fix_message_list`] repairs a conversation so that every tool
//! call is answered before the next assistant message:
//!
//! - orphaned tool responses (no matching call) are demoted to system notes;
//! - unanswered tool calls get a synthetic interruption response, inserted
//!   before the next assistant message;
//! - duplicate answers to the same call are kept as-is (providers accept
//!   them, and dropping output loses information).
//!
//! The repair is idempotent: repairing a repaired list changes nothing.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::llm::types::{ChatMessage, Role};

/// Repair a conversation so every tool call is paired with a tool response.
pub fn fix_message_list(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    if messages.is_empty() {
        return messages;
    }

    let mut fixed: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    // Calls emitted but not yet answered: id → tool name.
    let mut pending: HashMap<String, String> = HashMap::new();
    // Every call id ever emitted, answered or not.
    let mut seen_ids: HashSet<String> = HashSet::new();
    // Preserves emission order for synthetic responses.
    let mut pending_order: Vec<String> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::Assistant => {
                // A new assistant turn must not begin while calls are
                // unanswered — flush synthetic responses first.
                flush_pending(&mut fixed, &mut pending, &mut pending_order);

                for tc in &msg.tool_calls {
                    if !tc.id.is_empty() {
                        pending.insert(tc.id.clone(), tc.name.clone());
                        pending_order.push(tc.id.clone());
                        seen_ids.insert(tc.id.clone());
                    }
                }
                fixed.push(msg);
            }
            Role::Tool => {
                let id = msg.tool_call_id.clone().unwrap_or_default();
                if pending.remove(&id).is_some() {
                    pending_order.retain(|p| p != &id);
                    fixed.push(msg);
                } else if !seen_ids.contains(&id) {
                    // No call ever produced this id — keep the content as an
                    // informational system note.
                    debug!(tool_call_id = %id, "demoting orphaned tool response");
                    let excerpt: String = msg.content.chars().take(200).collect();
                    fixed.push(ChatMessage::system(format!(
                        "[Tool output (orphaned)]: {excerpt}"
                    )));
                } else {
                    // Duplicate answer to an already-answered call.
                    fixed.push(msg);
                }
            }
            Role::System | Role::User => fixed.push(msg),
        }
    }

    // Anything still pending at the end of the conversation.
    flush_pending(&mut fixed, &mut pending, &mut pending_order);

    fixed
}

fn flush_pending(
    fixed: &mut Vec<ChatMessage>,
    pending: &mut HashMap<String, String>,
    pending_order: &mut Vec<String>,
) {
    for id in pending_order.drain(..) {
        if let Some(name) = pending.remove(&id) {
            debug!(tool = %name, "adding synthetic response for unanswered tool call");
            fixed.push(ChatMessage::tool_result(
                id,
                format!("[Tool execution interrupted - no response for {name}]"),
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ToolCall;
    use serde_json::json;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: json!({}),
        }
    }

    #[test]
    fn consistent_conversation_is_unchanged() {
        let msgs = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("scan the host"),
            ChatMessage::assistant_tool_calls("", vec![call("tc_1", "nmap_scan")]),
            ChatMessage::tool_result("tc_1", "22/tcp open"),
            ChatMessage::assistant("done"),
        ];
        let fixed = fix_message_list(msgs.clone());
        assert_eq!(fixed.len(), msgs.len());
        assert_eq!(fixed[3].tool_call_id.as_deref(), Some("tc_1"));
    }

    #[test]
    fn unanswered_call_gets_synthetic_response() {
        let msgs = vec![
            ChatMessage::user("go"),
            ChatMessage::assistant_tool_calls("", vec![call("tc_1", "nmap_scan")]),
        ];
        let fixed = fix_message_list(msgs);
        assert_eq!(fixed.len(), 3);
        assert_eq!(fixed[2].role, Role::Tool);
        assert_eq!(fixed[2].tool_call_id.as_deref(), Some("tc_1"));
        assert!(fixed[2].content.contains("interrupted"));
        assert!(fixed[2].content.contains("nmap_scan"));
    }

    #[test]
    fn synthetic_response_lands_before_next_assistant() {
        let msgs = vec![
            ChatMessage::user("go"),
            ChatMessage::assistant_tool_calls("", vec![call("tc_1", "nmap_scan")]),
            ChatMessage::assistant("I never waited for the result"),
        ];
        let fixed = fix_message_list(msgs);
        // user, assistant(tool_calls), synthetic tool, assistant.
        assert_eq!(fixed.len(), 4);
        assert_eq!(fixed[2].role, Role::Tool);
        assert_eq!(fixed[3].role, Role::Assistant);
    }

    #[test]
    fn orphaned_tool_response_is_demoted() {
        let long_output = "x".repeat(500);
        let msgs = vec![
            ChatMessage::user("go"),
            ChatMessage::tool_result("tc_ghost", long_output),
        ];
        let fixed = fix_message_list(msgs);
        assert_eq!(fixed.len(), 2);
        assert_eq!(fixed[1].role, Role::System);
        assert!(fixed[1].content.starts_with("[Tool output (orphaned)]"));
        // Excerpt is capped at 200 chars.
        assert!(fixed[1].content.len() < 250);
    }

    #[test]
    fn multiple_calls_answered_out_of_order() {
        let msgs = vec![
            ChatMessage::assistant_tool_calls(
                "",
                vec![call("a", "nmap_scan"), call("b", "nuclei_scan")],
            ),
            ChatMessage::tool_result("b", "nuclei out"),
        ];
        let fixed = fix_message_list(msgs);
        // assistant, tool(b), synthetic tool(a).
        assert_eq!(fixed.len(), 3);
        let answered: Vec<&str> = fixed[1..]
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert!(answered.contains(&"a"));
        assert!(answered.contains(&"b"));
    }

    #[test]
    fn repair_is_idempotent() {
        let msgs = vec![
            ChatMessage::user("go"),
            ChatMessage::assistant_tool_calls("", vec![call("tc_1", "nmap_scan")]),
            ChatMessage::tool_result("tc_orphan", "stray"),
            ChatMessage::assistant("mid"),
        ];
        let once = fix_message_list(msgs);
        let twice = fix_message_list(once.clone());
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.role, b.role);
            assert_eq!(a.content, b.content);
            assert_eq!(a.tool_call_id, b.tool_call_id);
        }
    }

    #[test]
    fn empty_list_stays_empty() {
        assert!(fix_message_list(Vec::new()).is_empty());
    }
}
