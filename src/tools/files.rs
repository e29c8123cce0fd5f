//! File tools: `Read`, `Write`, `Edit`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::fs;
use tracing::debug;

use super::sandbox::Sandbox;
use super::{parse_input, truncate_output, ToolContext, ToolError, ToolHandler, ToolOutput};

const DEFAULT_LINE_LIMIT: usize = 2000;
const MAX_LINE_CHARS: usize = 2000;

#[derive(Debug, Deserialize)]
struct ReadInput {
    file_path: String,
    /// Lines to skip before output starts.
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WriteInput {
    file_path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct EditInput {
    file_path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

async fn read_text(sandbox: &Sandbox, requested: &str) -> Result<(std::path::PathBuf, String), ToolError> {
    let path = sandbox.resolve(requested)?;
    let metadata = fs::metadata(&path)
        .await
        .map_err(|_| ToolError::failed(format!("File not found: {requested}")))?;
    if !metadata.is_file() {
        return Err(ToolError::failed(format!("Path is not a file: {requested}")));
    }

    let content = fs::read_to_string(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::InvalidData {
            ToolError::failed(format!("File is binary or not valid UTF-8: {requested}"))
        } else {
            ToolError::Io(e)
        }
    })?;
    Ok((path, content))
}

/// Reads a file inside the root, numbered like `cat -n`.
#[derive(Debug, Clone)]
pub struct ReadTool {
    sandbox: Sandbox,
    max_output_bytes: usize,
}

impl ReadTool {
    pub fn new(sandbox: Sandbox, max_output_bytes: usize) -> Self {
        Self {
            sandbox,
            max_output_bytes,
        }
    }

    fn format_lines<'a>(lines: impl Iterator<Item = &'a str>, offset: usize) -> String {
        lines
            .enumerate()
            .map(|(i, line)| {
                let line = match line.char_indices().nth(MAX_LINE_CHARS) {
                    Some((cut, _)) => format!("{}...", &line[..cut]),
                    None => line.to_string(),
                };
                format!("{:>6}\t{}", offset + i + 1, line)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl ToolHandler for ReadTool {
    fn name(&self) -> &'static str {
        "Read"
    }

    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        let input: ReadInput = parse_input(input)?;
        if input.limit == Some(0) {
            return Err(ToolError::invalid("limit must be at least 1"));
        }
        self.sandbox.normalize(&input.file_path).map(|_| ())
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let input: ReadInput = parse_input(&input)?;
        let (_, content) = read_text(&self.sandbox, &input.file_path).await?;

        if content.is_empty() {
            return Ok(ToolOutput::text("(file is empty)"));
        }

        let offset = input.offset.unwrap_or(0);
        let limit = input.limit.unwrap_or(DEFAULT_LINE_LIMIT);
        let output = Self::format_lines(content.lines().skip(offset).take(limit), offset);

        Ok(ToolOutput::Text(truncate_output(output, self.max_output_bytes)))
    }
}

/// Creates or overwrites a file inside the root, creating parent directories.
#[derive(Debug, Clone)]
pub struct WriteTool {
    sandbox: Sandbox,
}

impl WriteTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl ToolHandler for WriteTool {
    fn name(&self) -> &'static str {
        "Write"
    }

    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        let input: WriteInput = parse_input(input)?;
        self.sandbox.normalize(&input.file_path).map(|_| ())
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let input: WriteInput = parse_input(&input)?;
        let path = self.sandbox.resolve(&input.file_path)?;

        if path.is_dir() {
            return Err(ToolError::failed(format!(
                "Path is a directory: {}",
                input.file_path
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, input.content.as_bytes()).await?;

        debug!(path = %path.display(), bytes = input.content.len(), "Wrote file");
        Ok(ToolOutput::text(format!(
            "Wrote {} bytes to {}",
            input.content.len(),
            self.sandbox.display(&path)
        )))
    }
}

/// Exact string replacement in an existing file.
#[derive(Debug, Clone)]
pub struct EditTool {
    sandbox: Sandbox,
}

impl EditTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl ToolHandler for EditTool {
    fn name(&self) -> &'static str {
        "Edit"
    }

    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        let input: EditInput = parse_input(input)?;
        if input.old_string.is_empty() {
            return Err(ToolError::invalid("old_string must not be empty"));
        }
        if input.old_string == input.new_string {
            return Err(ToolError::invalid("old_string and new_string are identical"));
        }
        self.sandbox.normalize(&input.file_path).map(|_| ())
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let input: EditInput = parse_input(&input)?;
        let (path, content) = read_text(&self.sandbox, &input.file_path).await?;

        let count = content.matches(input.old_string.as_str()).count();
        if count == 0 {
            return Err(ToolError::failed(
                "old_string was not found in the file. It must match exactly.",
            ));
        }
        if count > 1 && !input.replace_all {
            return Err(ToolError::failed(format!(
                "old_string appears {count} times in the file. Make it unique or set replace_all."
            )));
        }

        let updated = if input.replace_all {
            content.replace(&input.old_string, &input.new_string)
        } else {
            content.replacen(&input.old_string, &input.new_string, 1)
        };
        fs::write(&path, updated).await?;

        Ok(ToolOutput::text(format!(
            "Made {count} replacement(s) in {}",
            self.sandbox.display(&path)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sandbox(dir: &tempfile::TempDir) -> Sandbox {
        Sandbox::new(dir.path()).unwrap()
    }

    #[tokio::test]
    async fn test_read_numbers_lines_with_offset_and_limit() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "one\ntwo\nthree\nfour\n").unwrap();

        let tool = ReadTool::new(sandbox(&dir), 10_000);
        let ctx = ToolContext::default();
        let out = tool
            .execute(json!({"file_path": "notes.txt", "offset": 1, "limit": 2}), &ctx)
            .await
            .unwrap()
            .as_text();

        assert_eq!(out, "     2\ttwo\n     3\tthree");
    }

    #[test]
    fn test_read_missing_file_fails() {
        let dir = tempdir().unwrap();
        let tool = ReadTool::new(sandbox(&dir), 10_000);
        let err = tokio_test::block_on(tool.execute(json!({"file_path": "absent.txt"}), &ToolContext::default()))
            .unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[test]
    fn test_read_validation_rejects_escape() {
        let dir = tempdir().unwrap();
        let tool = ReadTool::new(sandbox(&dir), 10_000);
        let err = tool
            .validate(&json!({"file_path": "../../etc/passwd"}))
            .unwrap_err();
        assert!(matches!(err, ToolError::PathEscape { .. }));
    }

    #[tokio::test]
    async fn test_write_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let tool = WriteTool::new(sandbox(&dir));

        let out = tool
            .execute(
                json!({"file_path": "nested/deep/out.txt", "content": "hello"}),
                &ToolContext::default(),
            )
            .await
            .unwrap();

        assert!(out.as_text().contains("Wrote 5 bytes"));
        let written = std::fs::read_to_string(dir.path().join("nested/deep/out.txt")).unwrap();
        assert_eq!(written, "hello");
    }

    #[tokio::test]
    async fn test_edit_requires_unique_match_unless_replace_all() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("code.rs");
        std::fs::write(&file, "let a = 1;\nlet b = 1;\n").unwrap();
        let tool = EditTool::new(sandbox(&dir));
        let ctx = ToolContext::default();

        let err = tool
            .execute(
                json!({"file_path": "code.rs", "old_string": "= 1", "new_string": "= 2"}),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("appears 2 times"));

        let out = tool
            .execute(
                json!({"file_path": "code.rs", "old_string": "= 1", "new_string": "= 2", "replace_all": true}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.as_text().contains("2 replacement(s)"));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "let a = 2;\nlet b = 2;\n");
    }

    #[test]
    fn test_edit_validation_rejects_noop() {
        let dir = tempdir().unwrap();
        let tool = EditTool::new(sandbox(&dir));
        assert!(tool
            .validate(&json!({"file_path": "a", "old_string": "x", "new_string": "x"}))
            .is_err());
        assert!(tool
            .validate(&json!({"file_path": "a", "old_string": "", "new_string": "x"}))
            .is_err());
    }
}
