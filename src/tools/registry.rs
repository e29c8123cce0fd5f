//! The closed set of built-in tools and the name lookup over them.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::fetch::WebFetchTool;
use super::files::{EditTool, ReadTool, WriteTool};
use super::sandbox::Sandbox;
use super::search::{GlobTool, GrepTool, LsTool};
use super::shell::BashTool;
use super::{ToolContext, ToolError, ToolHandler, ToolOutput};
use crate::config::ToolsConfig;
use crate::error::{ProxyError, Result};

/// One variant per built-in tool. New tools are added here.
#[derive(Debug, Clone)]
pub enum BuiltinTool {
    Read(ReadTool),
    Write(WriteTool),
    Edit(EditTool),
    Glob(GlobTool),
    Grep(GrepTool),
    Ls(LsTool),
    Bash(BashTool),
    WebFetch(WebFetchTool),
}

impl BuiltinTool {
    fn handler(&self) -> &dyn ToolHandler {
        match self {
            Self::Read(t) => t,
            Self::Write(t) => t,
            Self::Edit(t) => t,
            Self::Glob(t) => t,
            Self::Grep(t) => t,
            Self::Ls(t) => t,
            Self::Bash(t) => t,
            Self::WebFetch(t) => t,
        }
    }
}

#[async_trait]
impl ToolHandler for BuiltinTool {
    fn name(&self) -> &'static str {
        self.handler().name()
    }

    fn validate(&self, input: &Value) -> std::result::Result<(), ToolError> {
        self.handler().validate(input)
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> std::result::Result<ToolOutput, ToolError> {
        self.handler().execute(input, ctx).await
    }
}

/// Name to handler map. Built once at startup, then shared read-only.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, BuiltinTool>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every built-in tool, confined to the configured root.
    pub fn from_config(config: &ToolsConfig) -> Result<Self> {
        let root = config.root_dir()?;
        let sandbox = Sandbox::new(&root).map_err(|e| {
            ProxyError::config(format!("Tool root {} is not usable: {e}", root.display()))
        })?;
        let depth = config.max_depth;
        let max_out = config.max_output_bytes;

        let mut registry = Self::empty();
        registry.register(BuiltinTool::Read(ReadTool::new(sandbox.clone(), max_out)));
        registry.register(BuiltinTool::Write(WriteTool::new(sandbox.clone())));
        registry.register(BuiltinTool::Edit(EditTool::new(sandbox.clone())));
        registry.register(BuiltinTool::Glob(GlobTool::new(sandbox.clone(), depth, max_out)));
        registry.register(BuiltinTool::Grep(GrepTool::new(sandbox.clone(), depth, max_out)));
        registry.register(BuiltinTool::Ls(LsTool::new(sandbox.clone(), depth, max_out)));
        registry.register(BuiltinTool::Bash(BashTool::new(
            sandbox.clone(),
            &config.shell_whitelist,
            max_out,
        )));
        registry.register(BuiltinTool::WebFetch(WebFetchTool::new(
            config.allowed_domains.clone(),
            Duration::from_secs(config.timeout_secs),
            max_out,
        )?));

        info!(
            root = %sandbox.root().display(),
            tools = %registry.names().join(", "),
            shell_prefixes = config.shell_whitelist.len(),
            allowed_domains = config.allowed_domains.len(),
            "Tool registry ready"
        );
        Ok(registry)
    }

    /// Add or replace a tool under its model-visible name.
    pub fn register(&mut self, tool: BuiltinTool) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&BuiltinTool> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_from_config_registers_all_builtins() {
        let dir = tempdir().unwrap();
        let config = ToolsConfig {
            root: Some(dir.path().to_path_buf()),
            ..ToolsConfig::default()
        };

        let registry = ToolRegistry::from_config(&config).unwrap();
        assert_eq!(
            registry.names(),
            vec!["Bash", "Edit", "Glob", "Grep", "LS", "Read", "WebFetch", "Write"]
        );
        assert!(registry.get("Unknown").is_none());
    }

    #[tokio::test]
    async fn test_builtin_delegates_to_handler() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        let sandbox = Sandbox::new(dir.path()).unwrap();

        let mut registry = ToolRegistry::empty();
        registry.register(BuiltinTool::Read(ReadTool::new(sandbox, 1000)));
        let read = registry.get("Read").unwrap();

        assert!(read.validate(&json!({"file_path": "a.txt"})).is_ok());
        let out = read
            .execute(json!({"file_path": "a.txt"}), &ToolContext::default())
            .await
            .unwrap();
        assert_eq!(out.as_text(), "     1\talpha");
    }

    #[test]
    fn test_missing_root_is_config_error() {
        let config = ToolsConfig {
            root: Some("/definitely/not/here".into()),
            ..ToolsConfig::default()
        };
        let err = ToolRegistry::from_config(&config).unwrap_err();
        assert!(matches!(err, ProxyError::Config { .. }));
    }
}
