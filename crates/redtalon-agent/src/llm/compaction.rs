//! Context auto-compaction.
//!
//! Before each request, the router estimates the conversation's token count
//! against the target model's context window.  Past the threshold, the
//! middle of the conversation is replaced with a single synthetic user
//! message summarizing what was dropped: system messages and the most
//! recent eight non-system messages always survive.
//!
//! Compaction is idempotent — a compacted conversation either falls below
//! the threshold or has too few messages to compact again.

use tracing::{info, warn};

use crate::llm::limits::{context_limit, estimate_conversation_tokens};
use crate::llm::types::{ChatMessage, Role};

/// Fraction of the context window that triggers compaction.
pub const COMPACTION_THRESHOLD: f64 = 0.85;

/// Non-system messages preserved verbatim at the tail.
const KEEP_RECENT: usize = 8;

/// Maximum summary lines in the synthetic message.
const MAX_SUMMARY_LINES: usize = 20;

/// Characters of each dropped message quoted in the summary.
const SUMMARY_EXCERPT_CHARS: usize = 100;

/// Compact `messages` when they approach the model's context limit.
///
/// Returns the (possibly unchanged) conversation and whether compaction
/// happened.
pub fn auto_compact(messages: &[ChatMessage], model: &str) -> (Vec<ChatMessage>, bool) {
    auto_compact_with_threshold(messages, model, COMPACTION_THRESHOLD)
}

/// Compaction with an explicit threshold (forced compaction after a
/// context-overflow rejection uses a lower one).
pub fn auto_compact_with_threshold(
    messages: &[ChatMessage],
    model: &str,
    threshold: f64,
) -> (Vec<ChatMessage>, bool) {
    let total_tokens = estimate_conversation_tokens(messages);
    let limit = context_limit(model);

    if (total_tokens as f64) < (limit as f64) * threshold {
        return (messages.to_vec(), false);
    }

    let system_msgs: Vec<ChatMessage> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .cloned()
        .collect();
    let other_msgs: Vec<ChatMessage> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();

    // Too few messages to usefully compact.
    if other_msgs.len() <= KEEP_RECENT + 2 {
        return (messages.to_vec(), false);
    }

    warn!(
        total_tokens,
        limit,
        pct = (total_tokens as f64 / limit as f64 * 100.0) as u32,
        "context approaching limit, compacting"
    );

    let split = other_msgs.len() - KEEP_RECENT;
    let dropped = &other_msgs[..split];
    let kept = &other_msgs[split..];

    let mut summary_lines: Vec<String> = Vec::new();
    for msg in dropped {
        if msg.content.is_empty() {
            continue;
        }
        let excerpt: String = msg.content.chars().take(SUMMARY_EXCERPT_CHARS).collect();
        summary_lines.push(format!("[{}]: {excerpt}", msg.role.as_str()));
    }

    let mut summary = String::from("=== Context Summary (auto-compacted) ===\n");
    summary.push_str(&format!("Removed {} older messages. Key points:\n", dropped.len()));
    summary.push_str(
        &summary_lines
            .iter()
            .take(MAX_SUMMARY_LINES)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n"),
    );
    if summary_lines.len() > MAX_SUMMARY_LINES {
        summary.push_str(&format!(
            "\n... and {} more messages",
            summary_lines.len() - MAX_SUMMARY_LINES
        ));
    }

    let mut compacted = Vec::with_capacity(system_msgs.len() + 1 + kept.len());
    compacted.extend(system_msgs);
    compacted.push(ChatMessage::user(summary));
    compacted.extend_from_slice(kept);

    info!(
        original = messages.len(),
        compacted = compacted.len(),
        before_tokens = total_tokens,
        after_tokens = estimate_conversation_tokens(&compacted),
        "context compacted"
    );

    (compacted, true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Model with an 8192-token window; 0.85 × 8192 ≈ 6963 tokens.
    const SMALL_MODEL: &str = "llama-test";

    fn bulky_conversation(count: usize) -> Vec<ChatMessage> {
        let mut msgs = vec![ChatMessage::system("You are a pentest agent.")];
        for i in 0..count {
            if i % 2 == 0 {
                msgs.push(ChatMessage::user(format!("request {i} {}", "x".repeat(1500))));
            } else {
                msgs.push(ChatMessage::assistant(format!(
                    "response {i} {}",
                    "y".repeat(1500)
                )));
            }
        }
        msgs
    }

    #[test]
    fn below_threshold_is_untouched() {
        let msgs = vec![ChatMessage::system("s"), ChatMessage::user("short")];
        let (out, compacted) = auto_compact(&msgs, SMALL_MODEL);
        assert!(!compacted);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn over_threshold_compacts_to_summary_plus_tail() {
        let msgs = bulky_conversation(30);
        let (out, compacted) = auto_compact(&msgs, SMALL_MODEL);
        assert!(compacted);
        // system + synthetic summary + 8 recent.
        assert_eq!(out.len(), 10);
        assert_eq!(out[0].role, Role::System);
        assert_eq!(out[1].role, Role::User);
        assert!(out[1].content.contains("Context Summary"));
        assert!(out[1].content.contains("Removed 22 older messages"));
        // Tail is preserved verbatim, most recent last.
        assert!(out[9].content.starts_with("response 29"));
    }

    #[test]
    fn summary_lines_are_capped() {
        let msgs = bulky_conversation(40);
        let (out, compacted) = auto_compact(&msgs, SMALL_MODEL);
        assert!(compacted);
        let summary = &out[1].content;
        assert!(summary.contains("... and 12 more messages"));
    }

    #[test]
    fn too_few_messages_skips_compaction() {
        // Few but enormous messages: over the token threshold, under the
        // message-count floor.
        let msgs = vec![
            ChatMessage::system("s"),
            ChatMessage::user("x".repeat(40_000)),
            ChatMessage::assistant("y".repeat(40_000)),
        ];
        let (out, compacted) = auto_compact(&msgs, SMALL_MODEL);
        assert!(!compacted);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn compaction_is_idempotent() {
        let msgs = bulky_conversation(30);
        let (once, first) = auto_compact(&msgs, SMALL_MODEL);
        assert!(first);
        let (twice, second) = auto_compact(&once, SMALL_MODEL);
        assert!(!second);
        assert_eq!(once.len(), twice.len());
    }

    #[test]
    fn huge_context_models_rarely_compact() {
        let msgs = bulky_conversation(30);
        let (_, compacted) = auto_compact(&msgs, "gemini-2.0-flash");
        assert!(!compacted);
    }

    #[test]
    fn forced_threshold_compacts_smaller_conversations() {
        let msgs = bulky_conversation(14);
        let (_, normal) = auto_compact(&msgs, SMALL_MODEL);
        let (_, forced) = auto_compact_with_threshold(&msgs, SMALL_MODEL, 0.5);
        assert!(!normal);
        assert!(forced);
    }
}
