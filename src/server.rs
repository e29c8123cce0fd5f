use crate::backend::{BackendRouter, BackendTarget};
use crate::config::GatewayConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{JournalEvent, SharedJournal};
use crate::orchestrator::Orchestrator;
use crate::tools::{Dispatcher, ToolRegistry};
use crate::translate::anthropic_types::{
    CountTokensRequest, CountTokensResponse, ErrorResponse, MessagesRequest, StreamEvent,
};
use crate::translate::{request, tokens};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const DEFAULT_JOURNAL_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub journal: SharedJournal,
}

impl AppState {
    /// Wire the router, tool registry and dispatcher for an already
    /// validated configuration.
    pub fn build(config: &GatewayConfig, target: BackendTarget, journal: SharedJournal) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        let router = BackendRouter::new(target, client, journal.clone());

        let dispatcher = if config.tools.enabled {
            let registry = ToolRegistry::from_config(&config.tools)?;
            Some(Arc::new(Dispatcher::new(
                Arc::new(registry),
                Duration::from_secs(config.tools.timeout_secs),
                journal.clone(),
            )))
        } else {
            info!("Tool execution disabled; tool_use blocks are returned to the client");
            None
        };

        Ok(Self {
            orchestrator: Orchestrator::new(router, dispatcher, config.tools.max_turns),
            journal,
        })
    }

    pub fn from_config(config: &GatewayConfig, journal: SharedJournal) -> Result<Self> {
        let target = BackendTarget::from_config(config)?;
        Self::build(config, target, journal)
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/health", get(handle_health))
        .route("/v1/models", get(handle_models))
        .route("/debug/journal", get(handle_journal))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(err: &ProxyError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(err.to_error_response())).into_response()
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

async fn handle_messages(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Failed to parse request");
            let err = ErrorResponse::invalid_request(format!("Invalid request body: {e}"));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };
    if let Err(e) = request::validate(&req) {
        warn!(error = %e, "Rejected request");
        return error_response(&e);
    }

    let request_id = new_request_id();
    let is_streaming = req.stream.unwrap_or(false);
    let tool_count = req.tools.as_ref().map_or(0, Vec::len);

    info!(
        request_id = %request_id,
        model = %req.model,
        stream = is_streaming,
        messages = req.messages.len(),
        tools = tool_count,
        "Request"
    );
    state.journal.record(JournalEvent::RequestAccepted {
        request_id: request_id.clone(),
        model: req.model.clone(),
        stream: is_streaming,
        tools: tool_count,
    });

    if is_streaming {
        handle_streaming(state, &req, &request_id).await
    } else {
        match state.orchestrator.run(&req, &request_id).await {
            Ok(message) => Json(message).into_response(),
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Request failed");
                error_response(&e)
            }
        }
    }
}

async fn handle_streaming(state: Arc<AppState>, req: &MessagesRequest, request_id: &str) -> Response {
    let events = match state.orchestrator.start_stream(req, request_id).await {
        Ok(s) => s,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "Streaming setup failed");
            return error_response(&e);
        }
    };

    let sse = events.map(|event| -> std::result::Result<Event, Infallible> { Ok(to_sse(&event)) });

    Sse::new(sse).keep_alive(KeepAlive::default()).into_response()
}

fn to_sse(event: &StreamEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().event(event.event_name()).data(data),
        Err(e) => {
            let body = ErrorResponse::api_error(format!("Failed to encode event: {e}"));
            Event::default()
                .event("error")
                .data(serde_json::to_string(&body).unwrap_or_default())
        }
    }
}

async fn handle_count_tokens(body: Bytes) -> Response {
    let req: CountTokensRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            let err = ErrorResponse::invalid_request(format!("Invalid request body: {e}"));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    let input_tokens = tokens::estimate_input(req.system.as_ref(), &req.messages, req.tools.as_deref());
    Json(CountTokensResponse { input_tokens }).into_response()
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let target = state.orchestrator.router().target();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": target.kind.as_str(),
        "tools": state.orchestrator.tools_enabled(),
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.router().target().models.advertised()).into_response()
}

#[derive(Debug, Deserialize)]
struct JournalQuery {
    limit: Option<usize>,
}

async fn handle_journal(State(state): State<Arc<AppState>>, Query(query): Query<JournalQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_JOURNAL_LIMIT);
    Json(state.journal.recent(limit)).into_response()
}
