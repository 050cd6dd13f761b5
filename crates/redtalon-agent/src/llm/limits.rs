//! Token estimation and model context limits.
//!
//! Estimation is deliberately rough — one token per four characters — which
//! is close enough to decide when to compact or trim.  Exact counts would
//! need a per-model tokenizer, and the thresholds all carry safety margins.

use crate::llm::types::ChatMessage;

/// Approximate context-window sizes per model family.  Matched by substring
/// against the lowercase model name; first hit wins.
const MODEL_TOKEN_LIMITS: &[(&str, usize)] = &[
    ("gpt-4o", 128_000),
    ("gpt-4", 128_000),
    ("gpt-3.5", 16_385),
    ("claude", 200_000),
    ("gemini", 1_000_000),
    ("llama3", 131_072),
    ("llama", 8_192),
    ("qwen", 32_768),
    ("deepseek", 64_000),
    ("phi", 16_384),
    ("mistral", 32_768),
];

/// Conservative default when the model family is unknown.
pub const DEFAULT_CONTEXT_LIMIT: usize = 8_192;

/// Rough token count: one token per four characters.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Rough token count across a whole conversation.
pub fn estimate_conversation_tokens(messages: &[ChatMessage]) -> usize {
    let chars: usize = messages.iter().map(|m| m.content.len() + 1).sum();
    chars / 4
}

/// Approximate context limit for a model.
pub fn context_limit(model: &str) -> usize {
    let lower = model.to_lowercase();
    MODEL_TOKEN_LIMITS
        .iter()
        .find(|(family, _)| lower.contains(family))
        .map(|(_, limit)| *limit)
        .unwrap_or(DEFAULT_CONTEXT_LIMIT)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_chars_per_token() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn known_model_families() {
        assert_eq!(context_limit("openai/gpt-4o-mini"), 128_000);
        assert_eq!(context_limit("claude-sonnet-4"), 200_000);
        assert_eq!(context_limit("Llama3.1-70B"), 131_072);
        assert_eq!(context_limit("qwen-coder"), 32_768);
    }

    #[test]
    fn unknown_model_uses_default() {
        assert_eq!(context_limit("some-exotic-model"), DEFAULT_CONTEXT_LIMIT);
    }

    #[test]
    fn conversation_estimate_sums_messages() {
        let msgs = vec![
            ChatMessage::system("x".repeat(40)),
            ChatMessage::user("y".repeat(40)),
        ];
        // 40 + 1 + 40 + 1 = 82 chars → 20 tokens.
        assert_eq!(estimate_conversation_tokens(&msgs), 20);
    }
}
