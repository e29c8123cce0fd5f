//! Error types for the gateway.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::translate::anthropic_types::ErrorResponse;

/// Anthropic error vocabulary. Every failure surfaced to a client is tagged
/// with exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum ApiErrorKind {
    #[serde(rename = "invalid_request_error")]
    InvalidRequest,
    #[serde(rename = "authentication_error")]
    Authentication,
    #[serde(rename = "permission_error")]
    Permission,
    #[serde(rename = "not_found_error")]
    NotFound,
    RequestTooLarge,
    #[serde(rename = "rate_limit_error")]
    RateLimit,
    #[serde(rename = "api_error")]
    Api,
    #[serde(rename = "overloaded_error")]
    Overloaded,
}

impl ApiErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request_error",
            Self::Authentication => "authentication_error",
            Self::Permission => "permission_error",
            Self::NotFound => "not_found_error",
            Self::RequestTooLarge => "request_too_large",
            Self::RateLimit => "rate_limit_error",
            Self::Api => "api_error",
            Self::Overloaded => "overloaded_error",
        }
    }

    /// Parse an Anthropic `error.type` string. Unknown types become `api_error`.
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "invalid_request_error" => Self::InvalidRequest,
            "authentication_error" => Self::Authentication,
            "permission_error" => Self::Permission,
            "not_found_error" => Self::NotFound,
            "request_too_large" => Self::RequestTooLarge,
            "rate_limit_error" => Self::RateLimit,
            "overloaded_error" => Self::Overloaded,
            _ => Self::Api,
        }
    }

    /// HTTP status the gateway answers with for this kind.
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Authentication => 401,
            Self::Permission => 403,
            Self::NotFound => 404,
            Self::RequestTooLarge => 413,
            Self::RateLimit => 429,
            Self::Api => 500,
            Self::Overloaded => 529,
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Backend error ({status}, {}): {message}", kind.as_str())]
    Backend {
        kind: ApiErrorKind,
        status: u16,
        message: String,
    },

    #[error("{operation} timed out after {}s", after.as_secs_f64())]
    Timeout {
        operation: String,
        after: Duration,
    },

    #[error("Translation error: {message}")]
    Translation { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    pub fn backend(kind: ApiErrorKind, status: u16, msg: impl Into<String>) -> Self {
        Self::Backend {
            kind,
            status,
            message: msg.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation {
            message: msg.into(),
        }
    }

    /// Anthropic error type for this failure.
    pub fn kind(&self) -> ApiErrorKind {
        match self {
            Self::Validation { .. } => ApiErrorKind::InvalidRequest,
            Self::Backend { kind, .. } => *kind,
            _ => ApiErrorKind::Api,
        }
    }

    /// HTTP status to answer the client with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Backend { kind, .. } => kind.http_status(),
            Self::Timeout { .. } => 504,
            Self::Http(_) | Self::Translation { .. } | Self::Json(_) => 502,
            _ => 500,
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            Self::Validation { message } | Self::Backend { message, .. } => {
                ErrorResponse::new(self.kind(), message.clone())
            }
            other => ErrorResponse::new(other.kind(), other.to_string()),
        }
    }

    /// Whether the router may retry the call that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { kind, .. } => *kind == ApiErrorKind::RateLimit,
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}

impl From<String> for ApiErrorKind {
    fn from(name: String) -> Self {
        Self::from_type_name(&name)
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
