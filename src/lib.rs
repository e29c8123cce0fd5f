//! Anthropic Messages API gateway.
//!
//! Accepts Anthropic-shaped requests, forwards them to one configured backend
//! (OpenRouter, LiteLLM, Azure Databricks or LiteLLM in front of OpenRouter)
//! and returns Anthropic-shaped messages or SSE streams. `tool_use` blocks can
//! be executed server-side by sandboxed built-in tools.

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod server;
pub mod tools;
pub mod translate;

pub use backend::{BackendKind, BackendRouter, BackendTarget};
pub use config::GatewayConfig;
pub use error::{ProxyError, Result};
pub use logging::SharedJournal;
pub use orchestrator::Orchestrator;
pub use server::{build_router, AppState};
