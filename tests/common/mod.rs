#![allow(dead_code)]

use anthropic_gateway::config::GatewayConfig;
use anthropic_gateway::logging::SharedJournal;
use anthropic_gateway::translate::anthropic_types::MessagesRequest;
use anthropic_gateway::{build_router, AppState, BackendKind, BackendTarget};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

pub const API_KEY: &str = "test-key";

pub fn config(kind: BackendKind, base_url: &str, tool_root: &Path) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.backend.kind = kind;
    config.backend.base_url = Some(base_url.to_string());
    config.backend.big_model = Some("claude-big".to_string());
    config.backend.small_model = Some("claude-small".to_string());
    config.backend.initial_backoff_ms = 10;
    config.backend.max_retries = 2;
    config.tools.root = Some(tool_root.to_path_buf());
    config
}

pub fn state(config: &GatewayConfig) -> (AppState, SharedJournal) {
    config.validate().unwrap();
    let target = BackendTarget::from_config_with(config, |_| Some(API_KEY.to_string())).unwrap();
    let journal = SharedJournal::in_memory();
    let state = AppState::build(config, target, journal.clone()).unwrap();
    (state, journal)
}

/// Serve the gateway on an ephemeral port; returns its base URL.
pub async fn spawn_gateway(state: AppState) -> String {
    let app = build_router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn request(body: Value) -> MessagesRequest {
    serde_json::from_value(body).unwrap()
}

pub fn list_files_request() -> Value {
    json!({
        "model": "big",
        "max_tokens": 1024,
        "messages": [{"role": "user", "content": "list files"}],
        "tools": [{
            "name": "LS",
            "description": "List a directory",
            "input_schema": {"type": "object", "properties": {"path": {"type": "string"}}}
        }]
    })
}

pub fn chat_tool_call(id: &str, name: &str, arguments: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "claude-big",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": arguments}
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {"prompt_tokens": 20, "completion_tokens": 5, "total_tokens": 25}
    })
}

pub fn chat_text(text: &str) -> Value {
    json!({
        "id": "chatcmpl-2",
        "object": "chat.completion",
        "model": "claude-big",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 40, "completion_tokens": 7, "total_tokens": 47}
    })
}

/// `data:` framed chat-completions chunks followed by `[DONE]`.
pub fn chat_sse(chunks: &[Value]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// Named SSE events, as a native Anthropic backend sends them.
pub fn anthropic_sse(events: &[Value]) -> String {
    events
        .iter()
        .map(|e| format!("event: {}\ndata: {e}\n\n", e["type"].as_str().unwrap()))
        .collect()
}

/// Parse an SSE body into `(event name, data)` pairs.
pub fn parse_sse_events(body: &str) -> Vec<(String, Value)> {
    let mut events = Vec::new();
    for frame in body.split("\n\n") {
        let mut name = None;
        let mut data = String::new();
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                name = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data.push_str(rest.trim());
            }
        }
        if let (Some(name), false) = (name, data.is_empty()) {
            events.push((name, serde_json::from_str(&data).unwrap()));
        }
    }
    events
}
