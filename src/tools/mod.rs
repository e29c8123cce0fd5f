//! Server-side tool execution.
//!
//! Every built-in tool implements [`ToolHandler`]: `validate` checks the input
//! without touching the filesystem or network, `execute` does the work. The
//! [`registry::ToolRegistry`] maps model-visible names to handlers and the
//! [`dispatcher::Dispatcher`] runs one assistant turn's `tool_use` blocks.

pub mod dispatcher;
pub mod fetch;
pub mod files;
pub mod registry;
pub mod sandbox;
pub mod search;
pub mod shell;

pub use dispatcher::Dispatcher;
pub use registry::{BuiltinTool, ToolRegistry};
pub use sandbox::Sandbox;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::backend::dialect::truncate;
use crate::translate::anthropic_types::{ContentBlock, ToolResultContent};

/// Tool failures. These never abort a turn; the dispatcher turns each one
/// into an `is_error` tool_result the model can read.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Path '{path}' is outside the tool root")]
    PathEscape { path: String },

    #[error("Command rejected: {message}")]
    CommandRejected { message: String },

    #[error("Domain '{domain}' is not in the allowed domain list")]
    DomainRejected { domain: String },

    #[error("{tool} timed out after {}s", after.as_secs_f64())]
    Timeout { tool: String, after: Duration },

    #[error("Unknown tool '{name}'. Available tools: {available}")]
    UnknownTool { name: String, available: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{message}")]
    ExecutionFailed { message: String },
}

impl ToolError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }
}

/// What a handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Json(Value),
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Json(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

/// Per-invocation context handed to `execute`.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub request_id: String,
    pub tool_use_id: String,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Model-visible tool name.
    fn name(&self) -> &'static str;

    /// Check the input without side effects. A failure here means `execute`
    /// is never called.
    fn validate(&self, input: &Value) -> Result<(), ToolError>;

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;
}

/// Outcome of one `tool_use` block, in the shape the next backend turn needs.
#[derive(Debug, Clone)]
pub struct ToolExecutionResult {
    pub tool_use_id: String,
    pub tool_name: String,
    pub output: ToolOutput,
    pub is_error: bool,
    pub duration: Duration,
}

impl ToolExecutionResult {
    pub fn success(tool_use_id: &str, tool_name: &str, output: ToolOutput, duration: Duration) -> Self {
        Self {
            tool_use_id: tool_use_id.to_string(),
            tool_name: tool_name.to_string(),
            output,
            is_error: false,
            duration,
        }
    }

    pub fn failure(tool_use_id: &str, tool_name: &str, error: &ToolError, duration: Duration) -> Self {
        Self {
            tool_use_id: tool_use_id.to_string(),
            tool_name: tool_name.to_string(),
            output: ToolOutput::Text(error.to_string()),
            is_error: true,
            duration,
        }
    }

    pub fn into_content_block(self) -> ContentBlock {
        ContentBlock::ToolResult {
            tool_use_id: self.tool_use_id,
            content: Some(ToolResultContent::Text(self.output.as_text())),
            is_error: self.is_error.then_some(true),
        }
    }
}

/// Deserialize a tool's input struct, mapping serde errors to `InvalidInput`.
pub fn parse_input<T: DeserializeOwned>(input: &Value) -> Result<T, ToolError> {
    T::deserialize(input).map_err(|e| ToolError::invalid(e.to_string()))
}

/// Cut `text` to at most `max_bytes`, noting how much was dropped.
pub fn truncate_output(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let kept = truncate(&text, max_bytes);
    let omitted = text.len() - kept.len();
    format!("{kept}\n... [output truncated, {omitted} bytes omitted]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct PathInput {
        file_path: String,
    }

    #[test]
    fn test_parse_input_reports_missing_field() {
        let err = parse_input::<PathInput>(&json!({"path": "a"})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput { .. }));
        assert!(err.to_string().contains("file_path"));

        let ok = parse_input::<PathInput>(&json!({"file_path": "a"})).unwrap();
        assert_eq!(ok.file_path, "a");
    }

    #[test]
    fn test_truncate_output_marks_cut() {
        assert_eq!(truncate_output("short".into(), 10), "short");

        let cut = truncate_output("é".repeat(10), 5);
        assert!(cut.starts_with("éé\n"));
        assert!(cut.contains("16 bytes omitted"));
    }

    #[test]
    fn test_error_result_becomes_flagged_block() {
        let err = ToolError::invalid("bad");
        let result = ToolExecutionResult::failure("toolu_1", "Read", &err, Duration::ZERO);
        match result.into_content_block() {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "toolu_1");
                assert_eq!(is_error, Some(true));
                assert_eq!(content.unwrap().as_text(), "Invalid input: bad");
            }
            other => panic!("unexpected block {other:?}"),
        }
    }
}
