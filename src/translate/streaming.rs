//! State machines for translating backend event streams into Anthropic SSE events.
//!
//! Both decoders feed a shared [`BlockAssembler`], which owns block indices:
//! text and thinking blocks start on their first non-empty delta, tool calls
//! are buffered until the backend signals completion and then emitted whole.
//!
//! - [`StreamTranslator`] handles chat-completions chunks.
//! - [`AnthropicRelay`] re-emits a native Anthropic stream, normalising the
//!   model name, block indices and tool-input deltas the same way.
//!
//! Every stream ends with `message_delta` + `message_stop`; an abnormal end
//! produces an `error` event and `stop_reason: "error"` instead of a silent
//! truncation.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use super::anthropic_types::{
    ContentBlock, Delta, DeltaUsage, ErrorBody, ErrorResponse, MessageDeltaBody, MessagesResponse,
    StopReason, StreamEvent, Usage,
};
use super::openai_types::{ChatCompletionChunk, ChatErrorResponse, ChatUsage, DatabricksErrorResponse};
use super::response::{map_finish_reason, parse_tool_arguments, tool_use_id};
use super::tokens;
use crate::error::ApiErrorKind;

/// Incremental decoder for one backend stream.
pub trait StreamDecoder: Send {
    /// Feed one SSE event (`event:` name, possibly empty, and `data:` payload).
    fn decode(&mut self, event: &str, data: &str) -> Vec<StreamEvent>;

    /// The upstream byte stream ended.
    fn finish(&mut self) -> Vec<StreamEvent>;

    /// The upstream failed; close the message with `stop_reason: error`.
    fn abort(&mut self, kind: ApiErrorKind, message: &str) -> Vec<StreamEvent>;

    /// Whether `message_stop` has been emitted.
    fn is_done(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenKind {
    Text,
    Thinking,
}

#[derive(Debug, Clone, Default)]
struct PendingTool {
    id: String,
    name: String,
    arguments: String,
}

/// Assigns block indices and enforces start/delta/stop ordering.
#[derive(Debug, Default)]
pub struct BlockAssembler {
    next_index: usize,
    open: Option<(usize, OpenKind)>,
    // Insertion order is emission order. A `None` key is a call that was
    // superseded at its index and only waits for completion.
    pending_tools: Vec<(Option<usize>, PendingTool)>,
    emitted_tool_use: bool,
    output_chars: usize,
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&mut self, text: &str) -> Vec<StreamEvent> {
        if text.is_empty() {
            return Vec::new();
        }
        let mut events = self.ensure_open(OpenKind::Text);
        self.output_chars += text.chars().count();
        events.push(StreamEvent::ContentBlockDelta {
            index: self.current_index(),
            delta: Delta::TextDelta {
                text: text.to_string(),
            },
        });
        events
    }

    pub fn thinking(&mut self, thinking: &str) -> Vec<StreamEvent> {
        if thinking.is_empty() {
            return Vec::new();
        }
        let mut events = self.ensure_open(OpenKind::Thinking);
        self.output_chars += thinking.chars().count();
        events.push(StreamEvent::ContentBlockDelta {
            index: self.current_index(),
            delta: Delta::ThinkingDelta {
                thinking: thinking.to_string(),
            },
        });
        events
    }

    /// Signatures only attach to an open thinking block.
    pub fn signature(&mut self, signature: &str) -> Vec<StreamEvent> {
        match self.open {
            Some((index, OpenKind::Thinking)) if !signature.is_empty() => {
                vec![StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::SignatureDelta {
                        signature: signature.to_string(),
                    },
                }]
            }
            _ => Vec::new(),
        }
    }

    /// Register (or update) the tool call keyed by the backend's own index.
    /// A different id at an index already in use starts a new call there.
    /// Closes any open text block so later indices stay increasing.
    pub fn begin_tool(&mut self, key: usize, id: Option<&str>, name: Option<&str>) -> Vec<StreamEvent> {
        let events = self.close_open();
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            let superseded = self
                .pending_tools
                .iter_mut()
                .find(|(k, tool)| *k == Some(key) && !tool.id.is_empty() && tool.id != id);
            if let Some(entry) = superseded {
                entry.0 = None;
            }
        }
        let tool = self.pending_tool(key);
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            tool.id = id.to_string();
        }
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            if tool.name.is_empty() {
                tool.name = name.to_string();
            }
        }
        events
    }

    pub fn tool_arguments(&mut self, key: usize, fragment: &str) {
        self.pending_tool(key).arguments.push_str(fragment);
    }

    fn pending_tool(&mut self, key: usize) -> &mut PendingTool {
        let pos = match self.pending_tools.iter().position(|(k, _)| *k == Some(key)) {
            Some(pos) => pos,
            None => {
                self.pending_tools.push((Some(key), PendingTool::default()));
                self.pending_tools.len() - 1
            }
        };
        &mut self.pending_tools[pos].1
    }

    /// Emit one buffered tool call as start, a single complete
    /// `input_json_delta` and stop.
    pub fn complete_tool(&mut self, key: usize) -> Vec<StreamEvent> {
        let Some(pos) = self.pending_tools.iter().position(|(k, _)| *k == Some(key)) else {
            return Vec::new();
        };
        let (_, tool) = self.pending_tools.remove(pos);
        let mut events = self.close_open();
        events.extend(self.emit_tool(tool));
        events
    }

    pub fn complete_all_tools(&mut self) -> Vec<StreamEvent> {
        let mut events = self.close_open();
        for (_, tool) in std::mem::take(&mut self.pending_tools) {
            events.extend(self.emit_tool(tool));
        }
        events
    }

    fn emit_tool(&mut self, tool: PendingTool) -> Vec<StreamEvent> {
        let index = self.next_index;
        self.next_index += 1;
        self.emitted_tool_use = true;

        let input = parse_tool_arguments(&tool.name, &tool.arguments);
        let partial_json = input.to_string();
        self.output_chars += tool.name.len() + partial_json.chars().count();

        vec![
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse {
                    id: tool_use_id(&tool.id),
                    name: tool.name,
                    input: serde_json::Value::Object(serde_json::Map::new()),
                },
            },
            StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::InputJsonDelta { partial_json },
            },
            StreamEvent::ContentBlockStop { index },
        ]
    }

    pub fn close_open(&mut self) -> Vec<StreamEvent> {
        match self.open.take() {
            Some((index, _)) => vec![StreamEvent::ContentBlockStop { index }],
            None => Vec::new(),
        }
    }

    /// Drop tool calls whose arguments never completed. Returns how many.
    pub fn discard_pending_tools(&mut self) -> usize {
        let dropped = self.pending_tools.len();
        self.pending_tools.clear();
        dropped
    }

    pub fn emitted_tool_use(&self) -> bool {
        self.emitted_tool_use
    }

    pub fn output_estimate(&self) -> u64 {
        tokens::estimate_chars(self.output_chars)
    }

    fn current_index(&self) -> usize {
        self.open.map(|(index, _)| index).unwrap_or(self.next_index)
    }

    fn ensure_open(&mut self, kind: OpenKind) -> Vec<StreamEvent> {
        if matches!(self.open, Some((_, open)) if open == kind) {
            return Vec::new();
        }
        let mut events = self.close_open();
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some((index, kind));
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: match kind {
                OpenKind::Text => ContentBlock::text(String::new()),
                OpenKind::Thinking => ContentBlock::Thinking {
                    thinking: String::new(),
                    signature: None,
                },
            },
        });
        events
    }
}

/// Closing sequence shared by both decoders.
fn closing_events(stop_reason: StopReason, output_tokens: u64, input_tokens: Option<u64>) -> Vec<StreamEvent> {
    vec![
        StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                output_tokens,
                input_tokens,
            },
        },
        StreamEvent::MessageStop,
    ]
}

fn error_event(kind: ApiErrorKind, message: &str) -> StreamEvent {
    StreamEvent::Error {
        error: ErrorBody {
            error_type: kind,
            message: message.to_string(),
        },
    }
}

/// State machine that translates chat-completions streaming chunks into
/// Anthropic SSE events.
///
/// Usage:
///   let mut translator = StreamTranslator::new("claude-sonnet-4-20250514", 12);
///   for (event, data) in sse_events {
///       let events = translator.decode(event, data);
///       // send each event as SSE
///   }
///   let final_events = translator.finish();
#[derive(Debug)]
pub struct StreamTranslator {
    model: String,
    msg_id: String,
    input_estimate: u64,
    started: bool,
    done: bool,
    finish_reason: Option<StopReason>,
    usage: Option<ChatUsage>,
    blocks: BlockAssembler,
}

impl StreamTranslator {
    pub fn new(model: &str, input_estimate: u64) -> Self {
        Self {
            model: model.to_string(),
            msg_id: super::anthropic_types::new_message_id(),
            input_estimate,
            started: false,
            done: false,
            finish_reason: None,
            usage: None,
            blocks: BlockAssembler::new(),
        }
    }

    /// Process a single chunk, returning zero or more Anthropic events.
    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }

        let mut events = self.start();

        // Usage may arrive on its own chunk after finish_reason
        if let Some(ref usage) = chunk.usage {
            self.usage = Some(usage.clone());
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if let Some(reasoning) = choice.delta.reasoning_text() {
            events.extend(self.blocks.thinking(reasoning));
        }

        if let Some(ref content) = choice.delta.content {
            events.extend(self.blocks.text(content));
        }

        if let Some(ref tool_calls) = choice.delta.tool_calls {
            for tc in tool_calls {
                let key = tc.index as usize;
                let name = tc.function.as_ref().and_then(|f| f.name.as_deref());
                if tc.id.is_some() || name.is_some() {
                    events.extend(self.blocks.begin_tool(key, tc.id.as_deref(), name));
                }
                if let Some(args) = tc.function.as_ref().and_then(|f| f.arguments.as_deref()) {
                    self.blocks.tool_arguments(key, args);
                }
            }
        }

        // finish_reason is the completion signal for buffered tool calls
        if let Some(ref reason) = choice.finish_reason {
            self.finish_reason = Some(map_finish_reason(reason));
            events.extend(self.blocks.complete_all_tools());
        }

        events
    }

    fn start(&mut self) -> Vec<StreamEvent> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        vec![
            StreamEvent::MessageStart {
                message: MessagesResponse::empty(
                    self.msg_id.clone(),
                    self.model.clone(),
                    self.input_estimate,
                ),
            },
            StreamEvent::Ping,
        ]
    }

    fn complete(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        let mut events = self.start();
        events.extend(self.blocks.complete_all_tools());
        self.done = true;

        let mut stop_reason = self.finish_reason.unwrap_or(StopReason::EndTurn);
        if stop_reason == StopReason::EndTurn && self.blocks.emitted_tool_use() {
            stop_reason = StopReason::ToolUse;
        }

        let (output_tokens, input_tokens) = match &self.usage {
            Some(u) => (u.completion_tokens, Some(u.prompt_tokens)),
            None => (self.blocks.output_estimate(), None),
        };

        events.extend(closing_events(stop_reason, output_tokens, input_tokens));
        events
    }
}

impl StreamDecoder for StreamTranslator {
    fn decode(&mut self, _event: &str, data: &str) -> Vec<StreamEvent> {
        let data = data.trim();
        if data.is_empty() || self.done {
            return Vec::new();
        }
        if data == "[DONE]" {
            return self.complete();
        }

        if let Some((kind, message)) = chat_stream_error(data) {
            return self.abort(kind, &message);
        }

        match serde_json::from_str::<ChatCompletionChunk>(data) {
            Ok(chunk) => self.process_chunk(&chunk),
            Err(e) => {
                debug!(error = %e, "Skipping unparseable chunk");
                Vec::new()
            }
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        // Some backends close the connection right after finish_reason
        if self.finish_reason.is_some() {
            return self.complete();
        }
        self.abort(
            ApiErrorKind::Api,
            "backend stream ended without a finish signal",
        )
    }

    fn abort(&mut self, kind: ApiErrorKind, message: &str) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        let mut events = self.start();
        events.extend(self.blocks.close_open());
        let dropped = self.blocks.discard_pending_tools();
        if dropped > 0 {
            warn!(dropped, "Discarding incomplete tool calls from aborted stream");
        }
        self.done = true;

        events.push(error_event(kind, message));
        events.extend(closing_events(
            StopReason::Error,
            self.blocks.output_estimate(),
            None,
        ));
        events
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

/// Error objects some chat backends send in place of a chunk.
fn chat_stream_error(data: &str) -> Option<(ApiErrorKind, String)> {
    if let Ok(err) = serde_json::from_str::<ChatErrorResponse>(data) {
        let kind = match err.error.error_type.as_str() {
            "rate_limit_error" | "rate_limit_exceeded" => ApiErrorKind::RateLimit,
            "overloaded_error" => ApiErrorKind::Overloaded,
            _ => ApiErrorKind::Api,
        };
        return Some((kind, err.error.message));
    }
    serde_json::from_str::<DatabricksErrorResponse>(data)
        .ok()
        .map(|err| (ApiErrorKind::Api, format!("{}: {}", err.error_code, err.message)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpstreamBlock {
    Text,
    Thinking,
    Tool,
}

/// Re-emits a native Anthropic stream under the gateway's guarantees.
#[derive(Debug)]
pub struct AnthropicRelay {
    model: String,
    input_estimate: u64,
    started: bool,
    done: bool,
    upstream: HashMap<usize, UpstreamBlock>,
    stop_reason: Option<StopReason>,
    stop_sequence: Option<String>,
    output_tokens: Option<u64>,
    blocks: BlockAssembler,
}

impl AnthropicRelay {
    pub fn new(model: &str, input_estimate: u64) -> Self {
        Self {
            model: model.to_string(),
            input_estimate,
            started: false,
            done: false,
            upstream: HashMap::new(),
            stop_reason: None,
            stop_sequence: None,
            output_tokens: None,
            blocks: BlockAssembler::new(),
        }
    }

    pub fn process_event(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }

        match event {
            StreamEvent::MessageStart { mut message } => {
                if self.started {
                    return Vec::new();
                }
                self.started = true;
                message.model = self.model.clone();
                message.content.clear();
                if message.usage.input_tokens == 0 {
                    message.usage.input_tokens = self.input_estimate;
                }
                vec![StreamEvent::MessageStart { message }]
            }
            StreamEvent::Ping => {
                let mut events = self.start();
                events.push(StreamEvent::Ping);
                events
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let mut events = self.start();
                match content_block {
                    ContentBlock::Text { text } => {
                        self.upstream.insert(index, UpstreamBlock::Text);
                        events.extend(self.blocks.text(&text));
                    }
                    ContentBlock::Thinking { thinking, .. } => {
                        self.upstream.insert(index, UpstreamBlock::Thinking);
                        events.extend(self.blocks.thinking(&thinking));
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        self.upstream.insert(index, UpstreamBlock::Tool);
                        events.extend(self.blocks.begin_tool(index, Some(id.as_str()), Some(name.as_str())));
                        // Rare: input delivered whole on the start event
                        if input.as_object().is_some_and(|o| !o.is_empty()) {
                            self.blocks.tool_arguments(index, &input.to_string());
                        }
                    }
                    other => {
                        debug!(block = ?other, "Ignoring unsupported upstream block");
                    }
                }
                events
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                match (self.upstream.get(&index), delta) {
                    (Some(UpstreamBlock::Text), Delta::TextDelta { text }) => self.blocks.text(&text),
                    (Some(UpstreamBlock::Thinking), Delta::ThinkingDelta { thinking }) => {
                        self.blocks.thinking(&thinking)
                    }
                    (Some(UpstreamBlock::Thinking), Delta::SignatureDelta { signature }) => {
                        self.blocks.signature(&signature)
                    }
                    (Some(UpstreamBlock::Tool), Delta::InputJsonDelta { partial_json }) => {
                        self.blocks.tool_arguments(index, &partial_json);
                        Vec::new()
                    }
                    (block, delta) => {
                        debug!(index, ?block, ?delta, "Ignoring delta for unknown block");
                        Vec::new()
                    }
                }
            }
            StreamEvent::ContentBlockStop { index } => match self.upstream.remove(&index) {
                Some(UpstreamBlock::Tool) => self.blocks.complete_tool(index),
                Some(_) => self.blocks.close_open(),
                None => Vec::new(),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if delta.stop_sequence.is_some() {
                    self.stop_sequence = delta.stop_sequence;
                }
                self.output_tokens = Some(usage.output_tokens);
                Vec::new()
            }
            StreamEvent::MessageStop => self.complete(),
            StreamEvent::Error { error } => self.abort(error.error_type, &error.message),
        }
    }

    fn start(&mut self) -> Vec<StreamEvent> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        vec![StreamEvent::MessageStart {
            message: MessagesResponse::empty(
                super::anthropic_types::new_message_id(),
                self.model.clone(),
                self.input_estimate,
            ),
        }]
    }

    fn complete(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        let mut events = self.start();
        events.extend(self.blocks.complete_all_tools());
        self.done = true;

        let stop_reason = match self.stop_reason {
            Some(StopReason::Unknown) => {
                warn!("Unknown stop_reason from backend, treating as end_turn");
                StopReason::EndTurn
            }
            Some(reason) => reason,
            None if self.blocks.emitted_tool_use() => StopReason::ToolUse,
            None => StopReason::EndTurn,
        };
        let output_tokens = self
            .output_tokens
            .unwrap_or_else(|| self.blocks.output_estimate());

        let mut closing = closing_events(stop_reason, output_tokens, None);
        if let Some(StreamEvent::MessageDelta { delta, .. }) = closing.first_mut() {
            delta.stop_sequence = self.stop_sequence.take();
        }
        events.extend(closing);
        events
    }
}

impl StreamDecoder for AnthropicRelay {
    fn decode(&mut self, event: &str, data: &str) -> Vec<StreamEvent> {
        if data.trim().is_empty() || self.done {
            return Vec::new();
        }
        match serde_json::from_str::<StreamEvent>(data) {
            Ok(parsed) => self.process_event(parsed),
            Err(e) => {
                debug!(event, error = %e, "Skipping unparseable upstream event");
                Vec::new()
            }
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        self.abort(ApiErrorKind::Api, "backend stream ended before message_stop")
    }

    fn abort(&mut self, kind: ApiErrorKind, message: &str) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        let mut events = self.start();
        events.extend(self.blocks.close_open());
        let dropped = self.blocks.discard_pending_tools();
        if dropped > 0 {
            warn!(dropped, "Discarding incomplete tool calls from aborted stream");
        }
        self.done = true;

        events.push(error_event(kind, message));
        events.extend(closing_events(
            StopReason::Error,
            self.output_tokens
                .unwrap_or_else(|| self.blocks.output_estimate()),
            None,
        ));
        events
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

/// Rebuilds a complete message from the events of one stream.
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    id: String,
    model: String,
    blocks: BTreeMap<usize, (ContentBlock, String)>,
    stop_reason: Option<StopReason>,
    stop_sequence: Option<String>,
    usage: Usage,
    error: Option<ErrorBody>,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = message.id.clone();
                self.model = message.model.clone();
                self.usage.input_tokens = message.usage.input_tokens;
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                self.blocks
                    .insert(*index, (content_block.clone(), String::new()));
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let Some((block, json)) = self.blocks.get_mut(index) else {
                    return;
                };
                match (block, delta) {
                    (ContentBlock::Text { text }, Delta::TextDelta { text: more }) => {
                        text.push_str(more);
                    }
                    (ContentBlock::Thinking { thinking, .. }, Delta::ThinkingDelta { thinking: more }) => {
                        thinking.push_str(more);
                    }
                    (ContentBlock::Thinking { signature, .. }, Delta::SignatureDelta { signature: sig }) => {
                        *signature = Some(sig.clone());
                    }
                    (ContentBlock::ToolUse { .. }, Delta::InputJsonDelta { partial_json }) => {
                        json.push_str(partial_json);
                    }
                    _ => {}
                }
            }
            StreamEvent::ContentBlockStop { index } => {
                if let Some((ContentBlock::ToolUse { name, input, .. }, json)) =
                    self.blocks.get_mut(index)
                {
                    if !json.is_empty() {
                        *input = parse_tool_arguments(name, json);
                    }
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if delta.stop_sequence.is_some() {
                    self.stop_sequence = delta.stop_sequence.clone();
                }
                self.usage.output_tokens = usage.output_tokens;
                if let Some(input) = usage.input_tokens {
                    self.usage.input_tokens = input;
                }
            }
            StreamEvent::Error { error } => {
                self.error = Some(error.clone());
            }
            StreamEvent::MessageStop | StreamEvent::Ping => {}
        }
    }

    /// The `error` event the stream carried, if any.
    pub fn error(&self) -> Option<ErrorResponse> {
        self.error
            .as_ref()
            .map(|e| ErrorResponse::new(e.error_type, e.message.clone()))
    }

    pub fn into_message(self) -> MessagesResponse {
        MessagesResponse {
            id: self.id,
            response_type: "message".to_string(),
            role: super::anthropic_types::Role::Assistant,
            content: self.blocks.into_values().map(|(block, _)| block).collect(),
            model: self.model,
            stop_reason: self.stop_reason,
            stop_sequence: self.stop_sequence,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Checks the event-ordering guarantees every stream must satisfy.
    pub(crate) fn assert_well_formed(events: &[StreamEvent]) {
        assert!(
            matches!(events.first(), Some(StreamEvent::MessageStart { .. })),
            "message_start must be first: {events:?}"
        );
        assert_eq!(events.last(), Some(&StreamEvent::MessageStop));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, StreamEvent::MessageStart { .. }))
                .count(),
            1
        );

        let mut started: Vec<usize> = Vec::new();
        let mut stopped: Vec<usize> = Vec::new();
        for event in events {
            match event {
                StreamEvent::ContentBlockStart { index, .. } => {
                    assert!(!started.contains(index), "index {index} started twice");
                    if let Some(last) = started.last() {
                        assert!(index > last, "indices must increase");
                    }
                    started.push(*index);
                }
                StreamEvent::ContentBlockDelta { index, .. } => {
                    assert!(started.contains(index) && !stopped.contains(index));
                }
                StreamEvent::ContentBlockStop { index } => {
                    assert!(started.contains(index) && !stopped.contains(index));
                    stopped.push(*index);
                }
                _ => {}
            }
        }
        assert_eq!(started.len(), stopped.len(), "every block must be stopped");
    }

    fn chunk(value: serde_json::Value) -> String {
        value.to_string()
    }

    fn text_chunk(content: &str, finish: Option<&str>) -> String {
        chunk(json!({
            "id": "c1",
            "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": finish}]
        }))
    }

    fn run(decoder: &mut dyn StreamDecoder, data: &[String]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for d in data {
            events.extend(decoder.decode("", d));
        }
        events.extend(decoder.finish());
        events
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::event_name).collect()
    }

    #[test]
    fn test_simple_text_stream() {
        let mut translator = StreamTranslator::new("test-model", 9);

        let events = translator.decode("", &text_chunk("Hello", None));
        assert_eq!(
            names(&events),
            vec!["message_start", "ping", "content_block_start", "content_block_delta"]
        );
        match &events[0] {
            StreamEvent::MessageStart { message } => {
                assert_eq!(message.model, "test-model");
                assert_eq!(message.usage.input_tokens, 9);
            }
            _ => unreachable!(),
        }

        let events = translator.decode("", &text_chunk(" world", None));
        assert_eq!(names(&events), vec!["content_block_delta"]);

        let events = translator.decode("", &text_chunk("", Some("stop")));
        assert_eq!(names(&events), vec!["content_block_stop"]);

        let events = translator.decode("", "[DONE]");
        assert_eq!(names(&events), vec!["message_delta", "message_stop"]);
        assert!(translator.is_done());
        assert!(translator.finish().is_empty());
    }

    #[test]
    fn test_empty_deltas_open_no_blocks() {
        let mut translator = StreamTranslator::new("m", 1);
        let data = vec![
            chunk(json!({"choices": [{"delta": {"role": "assistant", "content": ""}}]})),
            text_chunk("", Some("stop")),
            "[DONE]".to_string(),
        ];
        let events = run(&mut translator, &data);
        assert_well_formed(&events);
        assert!(!names(&events).contains(&"content_block_start"));
    }

    #[test]
    fn test_tool_call_arguments_are_buffered() {
        let mut translator = StreamTranslator::new("big", 1);
        let data = vec![
            text_chunk("Let me look.", None),
            chunk(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "type": "function", "function": {"name": "LS", "arguments": ""}}
            ]}}]})),
            chunk(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"pa"}}
            ]}}]})),
            chunk(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "th\": \".\"}"}}
            ]}}]})),
        ];

        let mut events = Vec::new();
        for d in &data {
            events.extend(translator.decode("", d));
        }
        // Nothing about the tool is visible before completion
        assert!(!events.iter().any(|e| matches!(
            e,
            StreamEvent::ContentBlockDelta { delta: Delta::InputJsonDelta { .. }, .. }
        )));

        let finish = translator.decode(
            "",
            &chunk(json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]})),
        );
        assert_eq!(
            finish,
            vec![
                StreamEvent::ContentBlockStart {
                    index: 1,
                    content_block: ContentBlock::ToolUse {
                        id: "call_1".to_string(),
                        name: "LS".to_string(),
                        input: json!({}),
                    },
                },
                StreamEvent::ContentBlockDelta {
                    index: 1,
                    delta: Delta::InputJsonDelta {
                        partial_json: r#"{"path":"."}"#.to_string(),
                    },
                },
                StreamEvent::ContentBlockStop { index: 1 },
            ]
        );
        events.extend(finish);
        events.extend(translator.decode("", "[DONE]"));
        assert_well_formed(&events);

        match &events[events.len() - 2] {
            StreamEvent::MessageDelta { delta, .. } => {
                assert_eq!(delta.stop_reason, Some(StopReason::ToolUse));
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn test_new_id_at_same_index_starts_new_tool_call() {
        let mut translator = StreamTranslator::new("big", 1);
        let data = vec![
            chunk(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_a", "type": "function",
                 "function": {"name": "Read", "arguments": "{\"file_path\": \"a\"}"}}
            ]}}]})),
            chunk(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_b", "type": "function",
                 "function": {"name": "LS", "arguments": "{\"path\": \".\"}"}}
            ]}}]})),
            chunk(json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]})),
            "[DONE]".to_string(),
        ];
        let events = run(&mut translator, &data);
        assert_well_formed(&events);

        let mut message = MessageAccumulator::new();
        for event in &events {
            message.apply(event);
        }
        let tool_uses: Vec<(String, String, serde_json::Value)> = message
            .into_message()
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some((id, name, input)),
                _ => None,
            })
            .collect();
        assert_eq!(
            tool_uses,
            vec![
                ("call_a".to_string(), "Read".to_string(), json!({"file_path": "a"})),
                ("call_b".to_string(), "LS".to_string(), json!({"path": "."})),
            ]
        );
    }

    #[test]
    fn test_usage_after_finish_reason_is_reported() {
        let mut translator = StreamTranslator::new("m", 3);
        let data = vec![
            text_chunk("hi", Some("stop")),
            chunk(json!({"choices": [], "usage": {"prompt_tokens": 11, "completion_tokens": 7, "total_tokens": 18}})),
            "[DONE]".to_string(),
        ];
        let events = run(&mut translator, &data);
        assert_well_formed(&events);
        match &events[events.len() - 2] {
            StreamEvent::MessageDelta { usage, .. } => {
                assert_eq!(usage.output_tokens, 7);
                assert_eq!(usage.input_tokens, Some(11));
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn test_reasoning_streams_as_thinking_block() {
        let mut translator = StreamTranslator::new("m", 1);
        let data = vec![
            chunk(json!({"choices": [{"delta": {"reasoning": "think"}}]})),
            text_chunk("answer", Some("stop")),
            "[DONE]".to_string(),
        ];
        let events = run(&mut translator, &data);
        assert_well_formed(&events);

        let mut acc = MessageAccumulator::new();
        events.iter().for_each(|e| acc.apply(e));
        let message = acc.into_message();
        assert_eq!(
            message.content,
            vec![
                ContentBlock::Thinking {
                    thinking: "think".to_string(),
                    signature: None
                },
                ContentBlock::text("answer"),
            ]
        );
    }

    #[test]
    fn test_truncated_stream_ends_with_error_stop() {
        let mut translator = StreamTranslator::new("m", 1);
        let data = vec![
            text_chunk("partial", None),
            chunk(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_9", "function": {"name": "Bash", "arguments": "{\"comm"}}
            ]}}]})),
        ];
        let events = run(&mut translator, &data);
        assert_well_formed(&events);
        assert_eq!(
            names(&events)[events.len() - 3..],
            ["error", "message_delta", "message_stop"]
        );
        match &events[events.len() - 2] {
            StreamEvent::MessageDelta { delta, .. } => {
                assert_eq!(delta.stop_reason, Some(StopReason::Error));
            }
            _ => unreachable!(),
        }
        // The incomplete tool call never surfaces
        assert!(!events.iter().any(|e| matches!(
            e,
            StreamEvent::ContentBlockStart { content_block: ContentBlock::ToolUse { .. }, .. }
        )));
    }

    #[test]
    fn test_error_chunk_aborts() {
        let mut translator = StreamTranslator::new("m", 1);
        let data = vec![
            text_chunk("a", None),
            chunk(json!({"error": {"message": "Rate limit exceeded", "type": "rate_limit_exceeded"}})),
            text_chunk("ignored", None),
        ];
        let events = run(&mut translator, &data);
        assert_well_formed(&events);
        assert!(events.contains(&StreamEvent::Error {
            error: ErrorBody {
                error_type: ApiErrorKind::RateLimit,
                message: "Rate limit exceeded".to_string(),
            }
        }));
        assert!(!events.iter().any(|e| matches!(
            e,
            StreamEvent::ContentBlockDelta { delta: Delta::TextDelta { text }, .. } if text == "ignored"
        )));
    }

    #[test]
    fn test_close_after_finish_reason_without_done() {
        let mut translator = StreamTranslator::new("m", 1);
        let events = run(&mut translator, &[text_chunk("ok", Some("length"))]);
        assert_well_formed(&events);
        match &events[events.len() - 2] {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason, Some(StopReason::MaxTokens));
                assert_eq!(usage.output_tokens, 1);
            }
            _ => unreachable!(),
        }
    }

    fn native(event: serde_json::Value) -> String {
        event.to_string()
    }

    #[test]
    fn test_relay_buffers_tool_input_and_renames_model() {
        let mut relay = AnthropicRelay::new("big", 5);
        let data = vec![
            native(json!({"type": "message_start", "message": {
                "id": "msg_up", "type": "message", "role": "assistant", "content": [],
                "model": "claude-3-5-sonnet-20241022", "stop_reason": null,
                "usage": {"input_tokens": 21, "output_tokens": 1}}})),
            native(json!({"type": "ping"})),
            native(json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})),
            native(json!({"type": "content_block_stop", "index": 0})),
            native(json!({"type": "content_block_start", "index": 1,
                          "content_block": {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {}}})),
            native(json!({"type": "content_block_delta", "index": 1,
                          "delta": {"type": "input_json_delta", "partial_json": "{\"file_path\":"}})),
            native(json!({"type": "content_block_delta", "index": 1,
                          "delta": {"type": "input_json_delta", "partial_json": " \"a.txt\"}"}})),
            native(json!({"type": "content_block_stop", "index": 1})),
            native(json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 30}})),
            native(json!({"type": "message_stop"})),
        ];

        let events = run(&mut relay, &data);
        assert_well_formed(&events);

        match &events[0] {
            StreamEvent::MessageStart { message } => {
                assert_eq!(message.model, "big");
                assert_eq!(message.id, "msg_up");
                assert_eq!(message.usage.input_tokens, 21);
            }
            _ => unreachable!(),
        }

        // The empty upstream text block is never started; the tool gets index 0
        let tool_deltas: Vec<&StreamEvent> = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ContentBlockDelta { .. }))
            .collect();
        assert_eq!(
            tool_deltas,
            vec![&StreamEvent::ContentBlockDelta {
                index: 0,
                delta: Delta::InputJsonDelta {
                    partial_json: r#"{"file_path":"a.txt"}"#.to_string()
                }
            }]
        );

        let mut acc = MessageAccumulator::new();
        events.iter().for_each(|e| acc.apply(e));
        let message = acc.into_message();
        assert_eq!(message.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(message.usage.output_tokens, 30);
        assert_eq!(
            message.tool_uses(),
            vec![ContentBlock::ToolUse {
                id: "toolu_1".to_string(),
                name: "Read".to_string(),
                input: json!({"file_path": "a.txt"}),
            }]
        );
    }

    #[test]
    fn test_relay_forwards_upstream_error() {
        let mut relay = AnthropicRelay::new("big", 5);
        let data = vec![
            native(json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": "Hel"}})),
            native(json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}})),
        ];
        let events = run(&mut relay, &data);
        assert_well_formed(&events);

        let mut acc = MessageAccumulator::new();
        events.iter().for_each(|e| acc.apply(e));
        assert_eq!(
            acc.error().map(|e| e.error.error_type),
            Some(ApiErrorKind::Overloaded)
        );
        assert_eq!(acc.into_message().stop_reason, Some(StopReason::Error));
    }

    #[test]
    fn test_relay_eof_before_message_stop_is_error() {
        let mut relay = AnthropicRelay::new("big", 5);
        let events = run(
            &mut relay,
            &[native(json!({"type": "content_block_start", "index": 0,
                            "content_block": {"type": "text", "text": "partial"}}))],
        );
        assert_well_formed(&events);
        assert!(names(&events).contains(&"error"));
    }
}
