//! Backend selection and the uniform call contract.
//!
//! One [`BackendTarget`] is built at startup from configuration; the
//! [`BackendRouter`] wraps it with an HTTP client and exposes `send_sync` and
//! `send_stream` for every kind alike.

pub mod dialect;
pub mod kind;
pub mod router;

pub use dialect::Dialect;
pub use kind::BackendKind;
pub use router::{BackendRouter, EventStream};

use crate::config::GatewayConfig;
use crate::error::{ProxyError, Result};
use crate::models::ModelMapper;
use std::fmt;
use std::time::Duration;

/// Everything the router needs to reach the configured backend. Read-only
/// after startup.
#[derive(Clone)]
pub struct BackendTarget {
    pub kind: BackendKind,
    pub dialect: &'static Dialect,
    pub base_url: String,
    credential: String,
    pub models: ModelMapper,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Top-level request fields removed before forwarding natively.
    pub drop_params: Vec<String>,
}

impl BackendTarget {
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        Self::from_config_with(config, |key| std::env::var(key).ok())
    }

    /// Build the target, reading the credential through `lookup`.
    pub fn from_config_with(
        config: &GatewayConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let backend = &config.backend;
        let kind = backend.kind;
        let dialect = kind.dialect();

        let base_url = backend.effective_base_url().ok_or_else(|| {
            ProxyError::config(format!("Backend '{kind}' requires backend.base_url"))
        })?;

        let key_env = backend.effective_api_key_env();
        let credential = lookup(&key_env)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                ProxyError::config(format!(
                    "Environment variable '{key_env}' not set. Set it with the {kind} credential."
                ))
            })?;

        Ok(Self {
            kind,
            dialect,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential,
            models: ModelMapper::new(backend, dialect),
            request_timeout: Duration::from_secs(backend.request_timeout_secs),
            stream_idle_timeout: Duration::from_secs(backend.stream_idle_timeout_secs),
            max_retries: backend.max_retries,
            initial_backoff: Duration::from_millis(backend.initial_backoff_ms),
            drop_params: config.params.drop.clone(),
        })
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }
}

impl fmt::Debug for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendTarget")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("credential", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}
