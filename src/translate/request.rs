//! Translate Anthropic Messages API requests into the active backend's payload.
//!
//! Handles system messages, multi-part content (text, images), tool use, tool results,
//! and tool choice mapping. A single Anthropic message can expand into multiple chat
//! messages (e.g. a user message with `tool_result` blocks becomes separate `tool`-role
//! messages). For the native dialect the request is forwarded as-is apart from the model.

use std::collections::HashSet;

use serde::Serialize;
use tracing::warn;

use super::anthropic_types::{
    ContentBlock, ImageSource, Message, MessageContent, MessagesRequest, Role, ToolChoice, ToolResultContent,
};
use super::openai_types::{
    ChatCompletionRequest, ChatContent, ChatFunction, ChatMessage, ChatTool, ChatToolCall,
    ChatToolCallFunction, ChatToolChoice, ChatToolChoiceFunction, ChatToolChoiceSpecific,
    ContentPart, ImageUrlDetail, StreamOptions,
};
use crate::backend::dialect::{ContentShape, Dialect};
use crate::error::{ProxyError, Result};

/// Body sent to the backend.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BackendPayload {
    Anthropic(MessagesRequest),
    Chat(ChatCompletionRequest),
}

impl BackendPayload {
    pub fn model(&self) -> &str {
        match self {
            BackendPayload::Anthropic(req) => &req.model,
            BackendPayload::Chat(req) => &req.model,
        }
    }
}

/// Structural checks every dialect relies on.
pub fn validate(req: &MessagesRequest) -> Result<()> {
    if req.messages.is_empty() {
        return Err(ProxyError::validation("messages: at least one message is required"));
    }
    if req.max_tokens == 0 {
        return Err(ProxyError::validation("max_tokens: must be at least 1"));
    }

    if let Some(tools) = &req.tools {
        let mut names = HashSet::new();
        for tool in tools {
            if tool.name.is_empty() {
                return Err(ProxyError::validation("tools: tool name must not be empty"));
            }
            if !names.insert(tool.name.as_str()) {
                return Err(ProxyError::validation(format!(
                    "tools: tool names must be unique, '{}' appears more than once",
                    tool.name
                )));
            }
        }
    }

    let mut seen_tool_uses: HashSet<String> = HashSet::new();
    for (i, msg) in req.messages.iter().enumerate() {
        let blocks: &[ContentBlock] = match &msg.content {
            MessageContent::Blocks(blocks) => blocks,
            MessageContent::Text(_) => &[],
        };
        for block in blocks {
            match (msg.role, block) {
                (Role::Assistant, ContentBlock::ToolUse { id, .. }) => {
                    seen_tool_uses.insert(id.clone());
                }
                (_, ContentBlock::ToolResult { tool_use_id, .. }) => {
                    if !seen_tool_uses.contains(tool_use_id) {
                        return Err(ProxyError::validation(format!(
                            "messages.{i}: tool_result references unknown tool_use_id '{tool_use_id}'"
                        )));
                    }
                }
                _ => {}
            }
        }
    }

    Ok(())
}

/// Translate an Anthropic request into the payload `dialect` expects.
/// `target_model` is the already-resolved backend model name.
pub fn translate(
    req: &MessagesRequest,
    dialect: &Dialect,
    target_model: &str,
    stream: bool,
) -> Result<BackendPayload> {
    validate(req)?;

    if dialect.is_native() {
        let mut native = req.clone();
        native.model = target_model.to_string();
        native.stream = Some(stream);
        return Ok(BackendPayload::Anthropic(native));
    }

    Ok(BackendPayload::Chat(anthropic_to_chat(
        req,
        dialect,
        target_model,
        stream,
    )))
}

fn anthropic_to_chat(
    req: &MessagesRequest,
    dialect: &Dialect,
    target_model: &str,
    stream: bool,
) -> ChatCompletionRequest {
    let mut messages = Vec::new();

    if let Some(ref system) = req.system {
        let text = system.as_text();
        if !text.is_empty() {
            messages.push(ChatMessage::text("system", text));
        }
    }

    for msg in &req.messages {
        let mut translated = translate_message(msg, dialect.content_shape);
        messages.append(&mut translated);
    }

    let tools: Option<Vec<ChatTool>> = req.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
        tools
            .iter()
            .map(|t| ChatTool {
                tool_type: "function".to_string(),
                function: ChatFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    });

    // Chat backends reject a tool_choice without tools
    let tool_choice = req
        .tool_choice
        .as_ref()
        .filter(|_| tools.is_some())
        .map(translate_tool_choice);

    let parallel_tool_calls = req
        .tool_choice
        .as_ref()
        .and_then(disable_parallel)
        .filter(|_| tools.is_some())
        .and_then(|disabled| {
            if dialect.supports_parallel_tool_calls {
                Some(!disabled)
            } else {
                warn!(backend = dialect.name, "Dropping disable_parallel_tool_use: unsupported");
                None
            }
        });

    let top_k = req.top_k.and_then(|k| {
        if dialect.supports_top_k {
            Some(k)
        } else {
            warn!(backend = dialect.name, top_k = k, "Dropping top_k: unsupported");
            None
        }
    });

    let stream_options = (stream && dialect.supports_stream_usage).then_some(StreamOptions {
        include_usage: true,
    });

    let user = req.metadata.as_ref().and_then(|m| m.user_id.clone());

    let model = if dialect.model_in_path {
        String::new()
    } else {
        target_model.to_string()
    };

    ChatCompletionRequest {
        model,
        messages,
        max_tokens: Some(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        top_k,
        stream: Some(stream),
        stream_options,
        tools,
        tool_choice,
        parallel_tool_calls,
        stop: req.stop_sequences.clone().filter(|s| !s.is_empty()),
        user,
    }
}

/// A single Anthropic message can expand to multiple chat messages
/// (e.g. a user message with `tool_results` becomes separate tool-role messages).
fn translate_message(msg: &Message, shape: ContentShape) -> Vec<ChatMessage> {
    let blocks = msg.content.blocks();

    match msg.role {
        Role::User => translate_user_message(&blocks, shape),
        Role::Assistant => translate_assistant_message(&blocks),
    }
}

fn translate_user_message(blocks: &[ContentBlock], shape: ContentShape) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    let mut content_parts: Vec<ContentPart> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                content_parts.push(ContentPart::Text { text: text.clone() });
            }
            ContentBlock::Image { source } => match shape {
                ContentShape::Parts => content_parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrlDetail {
                        url: image_url(source),
                        detail: None,
                    },
                }),
                ContentShape::Flattened => {
                    warn!("Dropping image block: backend accepts text content only");
                }
            },
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(ChatContent::Text(tool_result_to_string(
                        content.as_ref(),
                        *is_error,
                    ))),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                });
            }
            ContentBlock::Thinking { .. } | ContentBlock::ToolUse { .. } => {}
        }
    }

    // Tool replies must directly follow the assistant turn that called them.
    if !content_parts.is_empty() {
        messages.push(user_message(&content_parts, shape));
    }

    // If nothing was produced (empty message), emit an empty user message
    if messages.is_empty() {
        messages.push(ChatMessage::text("user", String::new()));
    }

    messages
}

fn translate_assistant_message(blocks: &[ContentBlock]) -> Vec<ChatMessage> {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ChatToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                text_parts.push(text);
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ChatToolCall {
                    id: id.clone(),
                    call_type: "function".to_string(),
                    function: ChatToolCallFunction {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                });
            }
            ContentBlock::Thinking { .. }
            | ContentBlock::Image { .. }
            | ContentBlock::ToolResult { .. } => {}
        }
    }

    let content = if text_parts.is_empty() {
        None
    } else {
        Some(ChatContent::Text(text_parts.concat()))
    };

    let tool_calls = if tool_calls.is_empty() {
        None
    } else {
        Some(tool_calls)
    };

    vec![ChatMessage {
        role: "assistant".to_string(),
        content,
        tool_calls,
        tool_call_id: None,
    }]
}

fn user_message(parts: &[ContentPart], shape: ContentShape) -> ChatMessage {
    ChatMessage {
        role: "user".to_string(),
        content: Some(collapse_content_parts(parts, shape)),
        tool_calls: None,
        tool_call_id: None,
    }
}

fn collapse_content_parts(parts: &[ContentPart], shape: ContentShape) -> ChatContent {
    if shape == ContentShape::Flattened {
        let text = parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        return ChatContent::Text(text);
    }

    if parts.len() == 1 {
        if let ContentPart::Text { text } = &parts[0] {
            return ChatContent::Text(text.clone());
        }
    }
    ChatContent::Parts(parts.to_vec())
}

fn image_url(source: &ImageSource) -> String {
    match source {
        ImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        ImageSource::Url { url } => url.clone(),
    }
}

fn tool_result_to_string(content: Option<&ToolResultContent>, is_error: Option<bool>) -> String {
    let prefix = if is_error == Some(true) {
        "ERROR: "
    } else {
        ""
    };

    match content {
        Some(content) => format!("{prefix}{}", content.as_text()),
        None => format!("{prefix}(no content)"),
    }
}

fn translate_tool_choice(tc: &ToolChoice) -> ChatToolChoice {
    match tc {
        ToolChoice::Auto { .. } => ChatToolChoice::String("auto".to_string()),
        ToolChoice::Any { .. } => ChatToolChoice::String("required".to_string()),
        ToolChoice::None => ChatToolChoice::String("none".to_string()),
        ToolChoice::Tool { name, .. } => ChatToolChoice::Specific(ChatToolChoiceSpecific {
            choice_type: "function".to_string(),
            function: ChatToolChoiceFunction { name: name.clone() },
        }),
    }
}

fn disable_parallel(tc: &ToolChoice) -> Option<bool> {
    match tc {
        ToolChoice::Auto {
            disable_parallel_tool_use,
        }
        | ToolChoice::Any {
            disable_parallel_tool_use,
        }
        | ToolChoice::Tool {
            disable_parallel_tool_use,
            ..
        } => *disable_parallel_tool_use,
        ToolChoice::None => None,
    }
}
