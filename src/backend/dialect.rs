//! Per-backend wire conventions as plain data.
//!
//! The router and translators are written once; every difference between
//! backends (endpoint shape, auth header, content representation, supported
//! sampling parameters, error envelope, status table) lives in a [`Dialect`].

use crate::error::{ApiErrorKind, ProxyError};
use crate::translate::anthropic_types::ErrorResponse;
use crate::translate::openai_types::{ChatErrorResponse, DatabricksErrorResponse};

/// Request/response body family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Anthropic Messages format, forwarded without translation.
    Anthropic,
    /// Chat-completions format.
    ChatCompletions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `x-api-key: <key>`
    XApiKey,
}

/// How message content is laid out in chat-completions messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentShape {
    /// Array of typed parts; images are carried as `image_url` parts.
    Parts,
    /// A single string per message; non-text content is dropped.
    Flattened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorEnvelope {
    /// `{"type":"error","error":{"type":...,"message":...}}`
    Anthropic,
    /// `{"error":{"message":...,"type":...,"code":...}}`
    OpenAi,
    /// `{"error_code":...,"message":...}`
    Databricks,
}

#[derive(Debug)]
pub struct Dialect {
    pub name: &'static str,
    pub wire: WireFormat,
    /// Path appended to the base URL; `{model}` is replaced by the target model.
    pub endpoint: &'static str,
    pub auth: AuthScheme,
    pub extra_headers: &'static [(&'static str, &'static str)],
    /// Prefix the backend expects on model names, e.g. `openrouter/`.
    pub model_prefix: Option<&'static str>,
    /// The model is addressed by the URL and must not appear in the body.
    pub model_in_path: bool,
    pub content_shape: ContentShape,
    pub supports_top_k: bool,
    pub supports_stream_usage: bool,
    pub supports_parallel_tool_calls: bool,
    pub error_envelope: ErrorEnvelope,
    pub status_map: &'static [(u16, ApiErrorKind)],
}

const COMMON_STATUS_MAP: &[(u16, ApiErrorKind)] = &[
    (400, ApiErrorKind::InvalidRequest),
    (401, ApiErrorKind::Authentication),
    (403, ApiErrorKind::Permission),
    (404, ApiErrorKind::NotFound),
    (413, ApiErrorKind::RequestTooLarge),
    (429, ApiErrorKind::RateLimit),
    (500, ApiErrorKind::Api),
    (502, ApiErrorKind::Api),
    (503, ApiErrorKind::Overloaded),
    (529, ApiErrorKind::Overloaded),
];

// OpenRouter answers 402 when the account is out of credits
const OPENROUTER_STATUS_MAP: &[(u16, ApiErrorKind)] = &[
    (400, ApiErrorKind::InvalidRequest),
    (401, ApiErrorKind::Authentication),
    (402, ApiErrorKind::Permission),
    (403, ApiErrorKind::Permission),
    (404, ApiErrorKind::NotFound),
    (408, ApiErrorKind::Api),
    (413, ApiErrorKind::RequestTooLarge),
    (429, ApiErrorKind::RateLimit),
    (500, ApiErrorKind::Api),
    (502, ApiErrorKind::Api),
    (503, ApiErrorKind::Overloaded),
    (529, ApiErrorKind::Overloaded),
];

pub static OPENROUTER: Dialect = Dialect {
    name: "openrouter",
    wire: WireFormat::ChatCompletions,
    endpoint: "/chat/completions",
    auth: AuthScheme::Bearer,
    extra_headers: &[("X-Title", "anthropic-gateway")],
    model_prefix: None,
    model_in_path: false,
    content_shape: ContentShape::Parts,
    supports_top_k: true,
    supports_stream_usage: true,
    supports_parallel_tool_calls: true,
    error_envelope: ErrorEnvelope::OpenAi,
    status_map: OPENROUTER_STATUS_MAP,
};

pub static LITELLM_OPENROUTER: Dialect = Dialect {
    name: "litellm_openrouter",
    wire: WireFormat::ChatCompletions,
    endpoint: "/v1/chat/completions",
    auth: AuthScheme::Bearer,
    extra_headers: &[],
    model_prefix: Some("openrouter/"),
    model_in_path: false,
    content_shape: ContentShape::Parts,
    supports_top_k: true,
    supports_stream_usage: true,
    supports_parallel_tool_calls: true,
    error_envelope: ErrorEnvelope::OpenAi,
    status_map: COMMON_STATUS_MAP,
};

pub static LITELLM_ANTHROPIC: Dialect = Dialect {
    name: "litellm",
    wire: WireFormat::Anthropic,
    endpoint: "/v1/messages",
    auth: AuthScheme::XApiKey,
    extra_headers: &[("anthropic-version", "2023-06-01")],
    model_prefix: None,
    model_in_path: false,
    content_shape: ContentShape::Parts,
    supports_top_k: true,
    supports_stream_usage: true,
    supports_parallel_tool_calls: true,
    error_envelope: ErrorEnvelope::Anthropic,
    status_map: COMMON_STATUS_MAP,
};

pub static AZURE_DATABRICKS: Dialect = Dialect {
    name: "azure_databricks",
    wire: WireFormat::ChatCompletions,
    endpoint: "/serving-endpoints/{model}/invocations",
    auth: AuthScheme::Bearer,
    extra_headers: &[],
    model_prefix: None,
    model_in_path: true,
    content_shape: ContentShape::Flattened,
    supports_top_k: false,
    supports_stream_usage: false,
    supports_parallel_tool_calls: false,
    error_envelope: ErrorEnvelope::Databricks,
    status_map: COMMON_STATUS_MAP,
};

impl Dialect {
    /// True for the identity dialect: requests and responses are already
    /// Anthropic-shaped.
    pub fn is_native(&self) -> bool {
        self.wire == WireFormat::Anthropic
    }

    pub fn endpoint_url(&self, base_url: &str, model: &str) -> String {
        let path = self.endpoint.replace("{model}", model);
        format!("{}{}", base_url.trim_end_matches('/'), path)
    }

    /// Apply the dialect's model prefix unless the name already carries it.
    pub fn qualify_model(&self, model: &str) -> String {
        match self.model_prefix {
            Some(prefix) if !model.starts_with(prefix) => format!("{prefix}{model}"),
            _ => model.to_string(),
        }
    }

    pub fn error_kind_for_status(&self, status: u16) -> ApiErrorKind {
        self.status_map
            .iter()
            .find(|(code, _)| *code == status)
            .map(|(_, kind)| *kind)
            .unwrap_or(if status >= 500 {
                ApiErrorKind::Api
            } else {
                ApiErrorKind::InvalidRequest
            })
    }

    /// Turn a non-2xx backend answer into a [`ProxyError::Backend`].
    ///
    /// The status table decides the kind; the envelope only supplies the
    /// message. A native backend that names its own error type is trusted.
    pub fn parse_error(&self, status: u16, body: &str) -> ProxyError {
        let mut kind = self.error_kind_for_status(status);
        let message = match self.error_envelope {
            ErrorEnvelope::Anthropic => serde_json::from_str::<ErrorResponse>(body)
                .ok()
                .map(|e| {
                    if e.error.error_type != ApiErrorKind::Api || status >= 500 {
                        kind = e.error.error_type;
                    }
                    e.error.message
                }),
            ErrorEnvelope::OpenAi => serde_json::from_str::<ChatErrorResponse>(body)
                .ok()
                .map(|e| e.error.message),
            ErrorEnvelope::Databricks => serde_json::from_str::<DatabricksErrorResponse>(body)
                .ok()
                .map(|e| format!("{}: {}", e.error_code, e.message))
                // Databricks gateways sometimes answer with the OpenAI envelope
                .or_else(|| {
                    serde_json::from_str::<ChatErrorResponse>(body)
                        .ok()
                        .map(|e| e.error.message)
                }),
        };

        let message = message.unwrap_or_else(|| {
            format!(
                "{} returned status {}: {}",
                self.name,
                status,
                truncate(body, 500)
            )
        });

        ProxyError::backend(kind, status, message)
    }
}

pub(crate) fn truncate(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_substitutes_model() {
        assert_eq!(
            AZURE_DATABRICKS.endpoint_url("https://adb-1.azuredatabricks.net/", "claude-sonnet"),
            "https://adb-1.azuredatabricks.net/serving-endpoints/claude-sonnet/invocations"
        );
        assert_eq!(
            OPENROUTER.endpoint_url("https://openrouter.ai/api/v1", "ignored"),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }

    #[test]
    fn test_model_prefix_applied_once() {
        assert_eq!(
            LITELLM_OPENROUTER.qualify_model("anthropic/claude-3.5-sonnet"),
            "openrouter/anthropic/claude-3.5-sonnet"
        );
        assert_eq!(
            LITELLM_OPENROUTER.qualify_model("openrouter/x"),
            "openrouter/x"
        );
        assert_eq!(OPENROUTER.qualify_model("x"), "x");
    }

    #[test]
    fn test_status_tables() {
        assert_eq!(OPENROUTER.error_kind_for_status(402), ApiErrorKind::Permission);
        assert_eq!(
            AZURE_DATABRICKS.error_kind_for_status(402),
            ApiErrorKind::InvalidRequest
        );
        assert_eq!(AZURE_DATABRICKS.error_kind_for_status(503), ApiErrorKind::Overloaded);
        assert_eq!(OPENROUTER.error_kind_for_status(599), ApiErrorKind::Api);
        assert_eq!(OPENROUTER.error_kind_for_status(429), ApiErrorKind::RateLimit);
    }

    #[test]
    fn test_parse_error_envelopes() {
        let err = OPENROUTER.parse_error(
            429,
            r#"{"error":{"message":"Rate limit exceeded","code":429}}"#,
        );
        match err {
            ProxyError::Backend { kind, status, message } => {
                assert_eq!(kind, ApiErrorKind::RateLimit);
                assert_eq!(status, 429);
                assert_eq!(message, "Rate limit exceeded");
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = AZURE_DATABRICKS.parse_error(
            400,
            r#"{"error_code":"BAD_REQUEST","message":"max_tokens too large"}"#,
        );
        assert_eq!(err.kind(), ApiErrorKind::InvalidRequest);
        assert!(err.to_string().contains("BAD_REQUEST: max_tokens too large"));

        let err = LITELLM_ANTHROPIC.parse_error(
            400,
            r#"{"type":"error","error":{"type":"request_too_large","message":"too big"}}"#,
        );
        assert_eq!(err.kind(), ApiErrorKind::RequestTooLarge);
    }

    #[test]
    fn test_unparseable_error_body_keeps_status() {
        let err = AZURE_DATABRICKS.parse_error(503, "<html>upstream down</html>");
        assert_eq!(err.kind(), ApiErrorKind::Overloaded);
        assert!(err.to_string().contains("upstream down"));
    }
}
