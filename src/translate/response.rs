//! Translate complete (non-streaming) backend responses into Anthropic messages.

use serde_json::Value;
use tracing::warn;

use super::anthropic_types::{new_message_id, ContentBlock, MessagesResponse, Role, StopReason, Usage};
use super::openai_types::{ChatCompletionResponse, ChatToolCall};
use super::tokens;
use crate::backend::dialect::{truncate, Dialect};
use crate::error::{ProxyError, Result};

/// A successfully received backend body, parsed per dialect.
#[derive(Debug, Clone)]
pub enum BackendResponse {
    Anthropic(MessagesResponse),
    Chat(ChatCompletionResponse),
}

impl BackendResponse {
    pub fn parse(dialect: &Dialect, body: &str) -> Result<Self> {
        let parsed = if dialect.is_native() {
            serde_json::from_str(body).map(BackendResponse::Anthropic)
        } else {
            serde_json::from_str(body).map(BackendResponse::Chat)
        };

        parsed.map_err(|e| {
            ProxyError::translation(format!(
                "Failed to parse {} response: {}. Body: {}",
                dialect.name,
                e,
                truncate(body, 300)
            ))
        })
    }
}

/// Translate a backend response into an Anthropic Messages response.
/// `original_model` is what the client asked for; `input_estimate` backs
/// the usage record when the backend reports none.
pub fn translate(resp: BackendResponse, original_model: &str, input_estimate: u64) -> MessagesResponse {
    match resp {
        BackendResponse::Chat(chat) => chat_to_anthropic(&chat, original_model, input_estimate),
        BackendResponse::Anthropic(native) => normalize_native(native, original_model, input_estimate),
    }
}

fn chat_to_anthropic(
    resp: &ChatCompletionResponse,
    original_model: &str,
    input_estimate: u64,
) -> MessagesResponse {
    let choice = resp.choices.first();

    let mut content: Vec<ContentBlock> = Vec::new();

    if let Some(c) = choice {
        if let Some(reasoning) = c.message.reasoning_text() {
            content.push(ContentBlock::Thinking {
                thinking: reasoning.to_string(),
                signature: None,
            });
        }

        if let Some(ref text) = c.message.content {
            if !text.is_empty() {
                content.push(ContentBlock::text(text.clone()));
            }
        }

        if let Some(ref tool_calls) = c.message.tool_calls {
            content.extend(tool_calls.iter().map(tool_call_to_block));
        }
    }

    // Ensure at least one content block
    if content.is_empty() {
        content.push(ContentBlock::text(String::new()));
    }

    let has_tool_use = content.iter().any(ContentBlock::is_tool_use);
    let mut stop_reason = choice
        .and_then(|c| c.finish_reason.as_deref())
        .map_or(StopReason::EndTurn, map_finish_reason);
    if has_tool_use && stop_reason == StopReason::EndTurn {
        stop_reason = StopReason::ToolUse;
    }

    let usage = match &resp.usage {
        Some(u) => Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            ..Usage::default()
        },
        None => Usage {
            input_tokens: input_estimate,
            output_tokens: tokens::estimate_blocks(&content),
            ..Usage::default()
        },
    };

    let id = if resp.id.is_empty() {
        new_message_id()
    } else {
        format!("msg_{}", resp.id.trim_start_matches("chatcmpl-"))
    };

    MessagesResponse {
        id,
        response_type: "message".to_string(),
        role: Role::Assistant,
        content,
        model: original_model.to_string(),
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage,
    }
}

fn normalize_native(
    mut resp: MessagesResponse,
    original_model: &str,
    input_estimate: u64,
) -> MessagesResponse {
    resp.model = original_model.to_string();

    if resp.stop_reason == Some(StopReason::Unknown) {
        warn!("Unknown stop_reason from backend, treating as end_turn");
        resp.stop_reason = Some(StopReason::EndTurn);
    }

    if resp.usage.input_tokens == 0 && resp.usage.output_tokens == 0 {
        resp.usage.input_tokens = input_estimate;
        resp.usage.output_tokens = tokens::estimate_blocks(&resp.content);
    }

    resp
}

/// Build a `tool_use` block from a completed chat tool call.
pub fn tool_call_to_block(tc: &ChatToolCall) -> ContentBlock {
    ContentBlock::ToolUse {
        id: tool_use_id(&tc.id),
        name: tc.function.name.clone(),
        input: parse_tool_arguments(&tc.function.name, &tc.function.arguments),
    }
}

/// Backend-supplied call id, or a fresh one when the backend sent none.
pub fn tool_use_id(id: &str) -> String {
    if id.is_empty() {
        format!("toolu_{}", uuid::Uuid::new_v4().simple())
    } else {
        id.to_string()
    }
}

/// Parse accumulated argument JSON. Tool inputs are always objects; anything
/// unparseable becomes `{}` with a warning.
pub fn parse_tool_arguments(tool: &str, arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    match serde_json::from_str::<Value>(arguments) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            warn!(tool, arguments = %other, "Tool arguments are not a JSON object, using {{}}");
            Value::Object(serde_json::Map::new())
        }
        Err(e) => {
            warn!(tool, error = %e, arguments = truncate(arguments, 200), "Unparseable tool arguments, using {{}}");
            Value::Object(serde_json::Map::new())
        }
    }
}

/// Map a chat `finish_reason` to an Anthropic `stop_reason`.
pub fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "stop" | "end_turn" | "eos" => StopReason::EndTurn,
        "length" | "max_tokens" => StopReason::MaxTokens,
        "tool_calls" | "function_call" | "tool_use" => StopReason::ToolUse,
        "stop_sequence" => StopReason::StopSequence,
        "content_filter" => StopReason::Refusal,
        other => {
            warn!(finish_reason = other, "Unknown finish_reason, treating as end_turn");
            StopReason::EndTurn
        }
    }
}
