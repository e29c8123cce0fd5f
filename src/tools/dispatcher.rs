use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::Value;
use tracing::{info, warn};

use super::registry::ToolRegistry;
use super::{ToolContext, ToolError, ToolExecutionResult, ToolHandler, ToolOutput};
use crate::logging::{JournalEvent, SharedJournal};
use crate::translate::anthropic_types::ContentBlock;

/// Runs the `tool_use` blocks of one assistant turn.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    journal: SharedJournal,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration, journal: SharedJournal) -> Self {
        Self {
            registry,
            timeout,
            journal,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute every `tool_use` in `blocks` concurrently. Results come back in
    /// the order the blocks were emitted, one per `tool_use`, and failures are
    /// results rather than errors.
    pub async fn dispatch(&self, blocks: &[ContentBlock], request_id: &str) -> Vec<ToolExecutionResult> {
        let calls = blocks.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some(self.run_one(id, name, input.clone(), request_id)),
            _ => None,
        });
        join_all(calls).await
    }

    async fn run_one(&self, id: &str, name: &str, input: Value, request_id: &str) -> ToolExecutionResult {
        let ctx = ToolContext {
            request_id: request_id.to_string(),
            tool_use_id: id.to_string(),
        };

        let started = Instant::now();
        let outcome = self.invoke(name, input, &ctx).await;
        let duration = started.elapsed();

        let result = match outcome {
            Ok(output) => ToolExecutionResult::success(id, name, output, duration),
            Err(e) => {
                warn!(tool = name, tool_use_id = id, error = %e, "Tool failed");
                ToolExecutionResult::failure(id, name, &e, duration)
            }
        };

        info!(
            tool = name,
            tool_use_id = id,
            is_error = result.is_error,
            duration_ms = duration.as_millis() as u64,
            "Tool executed"
        );
        self.journal.record(JournalEvent::ToolExecuted {
            request_id: request_id.to_string(),
            tool: name.to_string(),
            tool_use_id: id.to_string(),
            is_error: result.is_error,
            duration_ms: duration.as_millis() as u64,
        });

        result
    }

    async fn invoke(&self, name: &str, input: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let tool = self.registry.get(name).ok_or_else(|| ToolError::UnknownTool {
            name: name.to_string(),
            available: self.registry.names().join(", "),
        })?;

        tool.validate(&input)?;

        tokio::time::timeout(self.timeout, tool.execute(input, ctx))
            .await
            .map_err(|_| ToolError::Timeout {
                tool: name.to_string(),
                after: self.timeout,
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::files::{ReadTool, WriteTool};
    use crate::tools::registry::BuiltinTool;
    use crate::tools::sandbox::Sandbox;
    use crate::tools::search::LsTool;
    use crate::tools::shell::BashTool;
    use serde_json::json;
    use tempfile::tempdir;

    fn tool_use(id: &str, name: &str, input: Value) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input,
        }
    }

    fn dispatcher(dir: &tempfile::TempDir, timeout: Duration) -> (Dispatcher, SharedJournal) {
        let sandbox = Sandbox::new(dir.path()).unwrap();
        let mut registry = ToolRegistry::empty();
        registry.register(BuiltinTool::Read(ReadTool::new(sandbox.clone(), 10_000)));
        registry.register(BuiltinTool::Write(WriteTool::new(sandbox.clone())));
        registry.register(BuiltinTool::Ls(LsTool::new(sandbox.clone(), 3, 10_000)));
        registry.register(BuiltinTool::Bash(BashTool::new(
            sandbox,
            &["sleep".to_string()],
            10_000,
        )));
        let journal = SharedJournal::in_memory();
        (
            Dispatcher::new(Arc::new(registry), timeout, journal.clone()),
            journal,
        )
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_result() {
        let dir = tempdir().unwrap();
        let (dispatcher, journal) = dispatcher(&dir, Duration::from_secs(5));

        let results = dispatcher
            .dispatch(&[tool_use("toolu_1", "Teleport", json!({}))], "req_1")
            .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].is_error);
        let text = results[0].output.as_text();
        assert!(text.contains("Unknown tool 'Teleport'"));
        assert!(text.contains("Read"));
        assert_eq!(journal.recent(10).len(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_skips_execution() {
        let dir = tempdir().unwrap();
        let (dispatcher, _) = dispatcher(&dir, Duration::from_secs(5));

        // Write with an escaping path must not create anything
        let results = dispatcher
            .dispatch(
                &[tool_use("toolu_1", "Write", json!({"file_path": "../escaped.txt", "content": "x"}))],
                "req_1",
            )
            .await;

        assert!(results[0].is_error);
        assert!(results[0].output.as_text().contains("outside the tool root"));
        assert!(!dir.path().parent().unwrap().join("escaped.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_results_keep_emission_order() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "bee").unwrap();
        let (dispatcher, _) = dispatcher(&dir, Duration::from_secs(5));

        // A is the slowest; B and C finish first
        let blocks = vec![
            ContentBlock::text("thinking out loud"),
            tool_use("toolu_a", "Bash", json!({"command": "sleep 0.3"})),
            tool_use("toolu_b", "Read", json!({"file_path": "b.txt"})),
            tool_use("toolu_c", "LS", json!({})),
        ];
        let results = dispatcher.dispatch(&blocks, "req_1").await;

        let ids: Vec<&str> = results.iter().map(|r| r.tool_use_id.as_str()).collect();
        assert_eq!(ids, vec!["toolu_a", "toolu_b", "toolu_c"]);
        assert!(results.iter().all(|r| !r.is_error));
        assert!(results[1].output.as_text().contains("bee"));
    }

    #[cfg(target_os = "linux")]
    fn running(args: &str) -> bool {
        let wanted = args.replace(' ', "\0");
        std::fs::read_dir("/proc")
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().chars().all(|c| c.is_ascii_digit()))
            .filter_map(|e| std::fs::read(e.path().join("cmdline")).ok())
            .any(|cmdline| String::from_utf8_lossy(&cmdline).contains(&wanted))
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropping_dispatch_kills_child() {
        let dir = tempdir().unwrap();
        let (dispatcher, _) = dispatcher(&dir, Duration::from_secs(30));
        let command = "sleep 9.4172";
        let blocks = vec![tool_use("toolu_1", "Bash", json!({"command": command}))];

        let mut call = Box::pin(dispatcher.dispatch(&blocks, "req_1"));
        let started = async {
            while !running(command) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::select! {
            _ = &mut call => panic!("command finished before it was dropped"),
            waited = tokio::time::timeout(Duration::from_secs(5), started) => waited.unwrap(),
        }

        drop(call);

        let deadline = Instant::now() + Duration::from_secs(5);
        while running(command) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!running(command), "child survived its dropped dispatch");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_error_result() {
        let dir = tempdir().unwrap();
        let (dispatcher, _) = dispatcher(&dir, Duration::from_millis(100));

        let started = Instant::now();
        let results = dispatcher
            .dispatch(&[tool_use("toolu_1", "Bash", json!({"command": "sleep 5"}))], "req_1")
            .await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(results[0].is_error);
        assert!(results[0].output.as_text().contains("timed out"));
    }
}
