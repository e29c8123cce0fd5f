//! Token-count heuristic shared by `count_tokens` and the usage fallback.
//!
//! Roughly four characters per token for text and serialized JSON, a fixed
//! budget per image, and a small per-message framing overhead. Deterministic
//! so that `count_tokens` and a later usage estimate agree.

use super::anthropic_types::{ContentBlock, Message, SystemContent, Tool};

const CHARS_PER_TOKEN: usize = 4;
const IMAGE_TOKENS: u64 = 1_600;
const MESSAGE_OVERHEAD: u64 = 4;

pub fn estimate_text(text: &str) -> u64 {
    estimate_chars(text.chars().count())
}

/// Tokens for a running character count, as kept by the stream translators.
pub fn estimate_chars(chars: usize) -> u64 {
    chars.div_ceil(CHARS_PER_TOKEN) as u64
}

fn estimate_json(value: &serde_json::Value) -> u64 {
    estimate_text(&value.to_string())
}

pub fn estimate_blocks(blocks: &[ContentBlock]) -> u64 {
    blocks.iter().map(estimate_block).sum()
}

fn estimate_block(block: &ContentBlock) -> u64 {
    match block {
        ContentBlock::Text { text } => estimate_text(text),
        ContentBlock::Image { .. } => IMAGE_TOKENS,
        ContentBlock::ToolUse { name, input, .. } => estimate_text(name) + estimate_json(input),
        ContentBlock::ToolResult { content, .. } => content
            .as_ref()
            .map(|c| estimate_text(&c.as_text()))
            .unwrap_or(0),
        ContentBlock::Thinking { thinking, .. } => estimate_text(thinking),
    }
}

/// Estimated prompt size for a request's system prompt, messages and tools.
pub fn estimate_input(
    system: Option<&SystemContent>,
    messages: &[Message],
    tools: Option<&[Tool]>,
) -> u64 {
    let system_tokens = system.map(|s| estimate_text(&s.as_text())).unwrap_or(0);

    let message_tokens: u64 = messages
        .iter()
        .map(|m| MESSAGE_OVERHEAD + estimate_blocks(&m.content.blocks()))
        .sum();

    let tool_tokens: u64 = tools
        .unwrap_or_default()
        .iter()
        .map(|t| {
            estimate_text(&t.name)
                + t.description.as_deref().map(estimate_text).unwrap_or(0)
                + estimate_json(&t.input_schema)
        })
        .sum();

    (system_tokens + message_tokens + tool_tokens).max(1)
}
