//! Tool loop around the backend router.
//!
//! A turn is one backend call. When the assistant asks for tools and a
//! dispatcher is configured, the tool results are appended to the
//! conversation and the next turn is issued; the client sees one message
//! covering every turn.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::backend::{BackendRouter, EventStream};
use crate::error::{ApiErrorKind, ProxyError, Result};
use crate::tools::Dispatcher;
use crate::translate::anthropic_types::{
    ContentBlock, DeltaUsage, ErrorBody, Message, MessageContent, MessageDeltaBody, MessagesRequest,
    MessagesResponse, Role, StopReason, StreamEvent, Usage,
};
use crate::translate::streaming::MessageAccumulator;

#[derive(Clone)]
pub struct Orchestrator {
    router: BackendRouter,
    dispatcher: Option<Arc<Dispatcher>>,
    max_turns: u32,
}

impl Orchestrator {
    /// `dispatcher: None` makes the gateway a pure translator: `tool_use`
    /// blocks go back to the client unexecuted.
    pub fn new(router: BackendRouter, dispatcher: Option<Arc<Dispatcher>>, max_turns: u32) -> Self {
        Self {
            router,
            dispatcher,
            max_turns: max_turns.max(1),
        }
    }

    pub fn router(&self) -> &BackendRouter {
        &self.router
    }

    pub fn tools_enabled(&self) -> bool {
        self.dispatcher.is_some()
    }

    /// The dispatcher to use after `turn`, if the loop should go on.
    fn continue_with(&self, turn: u32, message: &MessagesResponse) -> Option<&Dispatcher> {
        let dispatcher = self.dispatcher.as_deref()?;
        if message.stop_reason == Some(StopReason::Error) || !message.content.iter().any(ContentBlock::is_tool_use) {
            return None;
        }
        if turn >= self.max_turns {
            info!(turns = turn, "Tool loop bound reached; returning tool_use unexecuted");
            return None;
        }
        Some(dispatcher)
    }

    /// Synchronous tool loop. The result concatenates every turn's blocks,
    /// with each turn's tool results after its tool calls.
    pub async fn run(&self, req: &MessagesRequest, request_id: &str) -> Result<MessagesResponse> {
        let mut conversation = req.clone();
        let mut content = Vec::new();
        let mut usage = Usage::default();
        let mut first_id = None;
        let mut turn = 0u32;

        loop {
            turn += 1;
            let response = self.router.send_sync(&conversation, request_id).await?;
            usage.accumulate(&response.usage);
            first_id.get_or_insert_with(|| response.id.clone());
            content.extend(response.content.iter().cloned());

            let Some(dispatcher) = self.continue_with(turn, &response) else {
                return Ok(MessagesResponse {
                    id: first_id.unwrap_or(response.id),
                    content,
                    model: req.model.clone(),
                    usage,
                    ..response
                });
            };

            let results: Vec<ContentBlock> = dispatcher
                .dispatch(&response.content, request_id)
                .await
                .into_iter()
                .map(|r| r.into_content_block())
                .collect();
            debug!(turn, results = results.len(), "Tool turn complete");
            content.extend(results.iter().cloned());
            append_turn(&mut conversation, response.content, results);
        }
    }

    /// Streaming tool loop. The first backend call happens before this
    /// returns so connection and status errors can still become an HTTP
    /// error; later failures arrive as `error` events.
    pub async fn start_stream(&self, req: &MessagesRequest, request_id: &str) -> Result<EventStream> {
        let first = self.router.send_stream(req, request_id).await?;

        let this = self.clone();
        let mut conversation = req.clone();
        let request_id = request_id.to_string();

        Ok(Box::pin(async_stream::stream! {
            let mut splicer = Splicer::new(&conversation.model);
            let mut upstream = first;
            let mut turn = 1u32;

            loop {
                splicer.begin_turn();
                let mut turn_message = MessageAccumulator::new();

                while let Some(event) = upstream.next().await {
                    turn_message.apply(&event);
                    if let Some(out) = splicer.relay(event) {
                        yield out;
                    }
                }

                let message = turn_message.into_message();

                let Some(dispatcher) = this.continue_with(turn, &message) else {
                    for out in splicer.close() {
                        yield out;
                    }
                    break;
                };

                let results: Vec<ContentBlock> = dispatcher
                    .dispatch(&message.content, &request_id)
                    .await
                    .into_iter()
                    .map(|r| r.into_content_block())
                    .collect();
                for out in splicer.tool_results(&results) {
                    yield out;
                }
                append_turn(&mut conversation, message.content, results);

                turn += 1;
                match this.router.send_stream(&conversation, &request_id).await {
                    Ok(next) => upstream = next,
                    Err(e) => {
                        warn!(error = %e, turn, "Backend call failed mid tool loop");
                        for out in splicer.fail(&e) {
                            yield out;
                        }
                        break;
                    }
                }
            }
        }))
    }
}

/// Append one assistant turn and the user turn carrying its tool results.
pub fn append_turn(conversation: &mut MessagesRequest, assistant: Vec<ContentBlock>, results: Vec<ContentBlock>) {
    conversation.messages.push(Message {
        role: Role::Assistant,
        content: MessageContent::Blocks(assistant),
    });
    conversation.messages.push(Message {
        role: Role::User,
        content: MessageContent::Blocks(results),
    });
}

/// Merges several upstream streams into one client stream: one
/// `message_start`, a continuous block index sequence, and a single closing
/// `message_delta` + `message_stop`.
#[derive(Debug, Default)]
struct Splicer {
    started: bool,
    next_index: usize,
    offset: usize,
    held: Option<MessageDeltaBody>,
    turn_input: u64,
    turn_output: u64,
    total_input: u64,
    total_output: u64,
    model: String,
}

impl Splicer {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Self::default()
        }
    }

    fn begin_turn(&mut self) {
        self.fold_turn_usage();
        self.offset = self.next_index;
        self.held = None;
    }

    fn fold_turn_usage(&mut self) {
        self.total_input += std::mem::take(&mut self.turn_input);
        self.total_output += std::mem::take(&mut self.turn_output);
    }

    fn shift(&mut self, index: usize) -> usize {
        let global = self.offset + index;
        self.next_index = self.next_index.max(global + 1);
        global
    }

    /// Map one upstream event; per-turn closing events are held back.
    fn relay(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.turn_input = message.usage.input_tokens;
                if self.started {
                    return None;
                }
                self.started = true;
                Some(StreamEvent::MessageStart { message })
            }
            StreamEvent::ContentBlockStart { index, content_block } => Some(StreamEvent::ContentBlockStart {
                index: self.shift(index),
                content_block,
            }),
            StreamEvent::ContentBlockDelta { index, delta } => Some(StreamEvent::ContentBlockDelta {
                index: self.shift(index),
                delta,
            }),
            StreamEvent::ContentBlockStop { index } => Some(StreamEvent::ContentBlockStop {
                index: self.shift(index),
            }),
            StreamEvent::MessageDelta { delta, usage } => {
                self.turn_output = usage.output_tokens;
                if let Some(input) = usage.input_tokens {
                    self.turn_input = input;
                }
                self.held = Some(delta);
                None
            }
            StreamEvent::MessageStop => None,
            other @ (StreamEvent::Ping | StreamEvent::Error { .. }) => Some(other),
        }
    }

    /// Each result is a complete block: start carrying it, then stop.
    fn tool_results(&mut self, results: &[ContentBlock]) -> Vec<StreamEvent> {
        let mut events = Vec::with_capacity(results.len() * 2);
        for block in results {
            let index = self.next_index;
            self.next_index += 1;
            events.push(StreamEvent::ContentBlockStart {
                index,
                content_block: block.clone(),
            });
            events.push(StreamEvent::ContentBlockStop { index });
        }
        events
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if !self.started {
            self.started = true;
            let id = crate::translate::anthropic_types::new_message_id();
            events.push(StreamEvent::MessageStart {
                message: MessagesResponse::empty(id, self.model.clone(), 0),
            });
        }
    }

    fn closing(&mut self, delta: MessageDeltaBody) -> Vec<StreamEvent> {
        self.fold_turn_usage();
        let mut events = Vec::new();
        self.ensure_started(&mut events);
        events.push(StreamEvent::MessageDelta {
            delta,
            usage: DeltaUsage {
                output_tokens: self.total_output,
                input_tokens: Some(self.total_input),
            },
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    /// Close with the last turn's stop reason.
    fn close(&mut self) -> Vec<StreamEvent> {
        let delta = self.held.take().unwrap_or(MessageDeltaBody {
            stop_reason: Some(StopReason::Error),
            stop_sequence: None,
        });
        self.closing(delta)
    }

    /// Close after a failure between turns.
    fn fail(&mut self, error: &ProxyError) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.ensure_started(&mut events);
        let kind = match error.kind() {
            ApiErrorKind::InvalidRequest => ApiErrorKind::Api,
            other => other,
        };
        events.push(StreamEvent::Error {
            error: ErrorBody {
                error_type: kind,
                message: error.to_string(),
            },
        });
        events.extend(self.closing(MessageDeltaBody {
            stop_reason: Some(StopReason::Error),
            stop_sequence: None,
        }));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::anthropic_types::Delta;
    use crate::translate::streaming::tests::assert_well_formed;
    use serde_json::json;
    use std::time::Duration;

    fn start(input: u64) -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessagesResponse::empty("msg_1", "big", input),
        }
    }

    fn text_block(index: usize, text: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::text(""),
            },
            StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::TextDelta { text: text.into() },
            },
            StreamEvent::ContentBlockStop { index },
        ]
    }

    fn end(stop: StopReason, output: u64) -> Vec<StreamEvent> {
        vec![
            StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some(stop),
                    stop_sequence: None,
                },
                usage: DeltaUsage {
                    output_tokens: output,
                    input_tokens: None,
                },
            },
            StreamEvent::MessageStop,
        ]
    }

    fn tool_block(index: usize) -> Vec<StreamEvent> {
        vec![
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse {
                    id: "toolu_1".into(),
                    name: "LS".into(),
                    input: json!({}),
                },
            },
            StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::InputJsonDelta {
                    partial_json: "{}".into(),
                },
            },
            StreamEvent::ContentBlockStop { index },
        ]
    }

    fn turn(splicer: &mut Splicer, events: Vec<StreamEvent>) -> Vec<StreamEvent> {
        splicer.begin_turn();
        events.into_iter().filter_map(|e| splicer.relay(e)).collect()
    }

    #[test]
    fn test_splicer_merges_turns_into_one_message() {
        let mut splicer = Splicer::new("big");
        let mut out = Vec::new();

        let mut first = vec![start(10)];
        first.extend(text_block(0, "Let me look."));
        first.extend(tool_block(1));
        first.extend(end(StopReason::ToolUse, 5));
        out.extend(turn(&mut splicer, first));

        let result = ContentBlock::ToolResult {
            tool_use_id: "toolu_1".into(),
            content: Some(crate::translate::anthropic_types::ToolResultContent::Text("- ./".into())),
            is_error: None,
        };
        out.extend(splicer.tool_results(&[result]));

        let mut second = vec![start(30)];
        second.extend(text_block(0, "One directory."));
        second.extend(end(StopReason::EndTurn, 7));
        out.extend(turn(&mut splicer, second));
        out.extend(splicer.close());

        assert_well_formed(&out);
        let starts = out
            .iter()
            .filter(|e| matches!(e, StreamEvent::MessageStart { .. }))
            .count();
        assert_eq!(starts, 1);

        let indices: Vec<usize> = out
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStart { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        match &out[out.len() - 2] {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason, Some(StopReason::EndTurn));
                assert_eq!(usage.output_tokens, 12);
                assert_eq!(usage.input_tokens, Some(40));
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn test_splicer_failure_closes_with_error() {
        let mut splicer = Splicer::new("big");
        let mut out = turn(&mut splicer, {
            let mut events = vec![start(3)];
            events.extend(tool_block(0));
            events.extend(end(StopReason::ToolUse, 2));
            events
        });

        let err = ProxyError::timeout("backend request", Duration::from_secs(1));
        out.extend(splicer.fail(&err));

        assert_well_formed(&out);
        assert!(out.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
        match &out[out.len() - 2] {
            StreamEvent::MessageDelta { delta, .. } => {
                assert_eq!(delta.stop_reason, Some(StopReason::Error));
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn test_append_turn_adds_assistant_then_user() {
        let mut req: MessagesRequest = serde_json::from_value(json!({
            "model": "big",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "list files"}]
        }))
        .unwrap();

        append_turn(
            &mut req,
            vec![ContentBlock::ToolUse {
                id: "toolu_1".into(),
                name: "LS".into(),
                input: json!({}),
            }],
            vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_1".into(),
                content: None,
                is_error: None,
            }],
        );

        assert_eq!(req.messages.len(), 3);
        assert_eq!(req.messages[1].role, Role::Assistant);
        assert_eq!(req.messages[2].role, Role::User);
        crate::translate::request::validate(&req).unwrap();
    }
}
