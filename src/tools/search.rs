//! Search tools: `Glob`, `Grep`, `LS`. All walks are bounded by the
//! configured depth and never leave the sandbox root.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::Value;
use walkdir::WalkDir;

use super::sandbox::{is_skipped_dir, Sandbox};
use super::{parse_input, truncate_output, ToolContext, ToolError, ToolHandler, ToolOutput};

const DEFAULT_HEAD_LIMIT: usize = 100;
const MAX_LS_ENTRIES: usize = 1000;

fn skipped(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry.file_name().to_str().map(is_skipped_dir).unwrap_or(false)
}

/// Resolve the optional `path` argument, defaulting to the root.
fn search_base(sandbox: &Sandbox, path: Option<&str>) -> Result<PathBuf, ToolError> {
    match path {
        Some(p) => sandbox.resolve(p),
        None => Ok(sandbox.root().to_path_buf()),
    }
}

/// Raised when the future awaiting a walk is dropped, so a timed-out
/// search stops instead of finishing on the blocking pool.
#[derive(Debug, Clone, Default)]
struct Cancel(Arc<AtomicBool>);

impl Cancel {
    fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

struct CancelOnDrop(Cancel);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0 .0.store(true, Ordering::Relaxed);
    }
}

async fn blocking<T, F>(work: F) -> Result<T, ToolError>
where
    T: Send + 'static,
    F: FnOnce(&Cancel) -> Result<T, ToolError> + Send + 'static,
{
    let cancel = Cancel::default();
    let _guard = CancelOnDrop(cancel.clone());
    tokio::task::spawn_blocking(move || work(&cancel))
        .await
        .map_err(|e| ToolError::failed(format!("search task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// Glob
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GlobInput {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

/// Files matching a glob pattern, newest first.
#[derive(Debug, Clone)]
pub struct GlobTool {
    sandbox: Sandbox,
    max_depth: usize,
    max_output_bytes: usize,
}

impl GlobTool {
    pub fn new(sandbox: Sandbox, max_depth: usize, max_output_bytes: usize) -> Self {
        Self {
            sandbox,
            max_depth,
            max_output_bytes,
        }
    }

    fn check_pattern(pattern: &str) -> Result<glob::Pattern, ToolError> {
        if pattern.trim().is_empty() {
            return Err(ToolError::invalid("pattern must not be empty"));
        }
        if Path::new(pattern).is_absolute() || pattern.split(['/', '\\']).any(|part| part == "..") {
            return Err(ToolError::PathEscape {
                path: pattern.to_string(),
            });
        }
        glob::Pattern::new(pattern).map_err(|e| ToolError::invalid(format!("Invalid glob pattern: {e}")))
    }

    /// Depth-limited walk of `base`, matching each file's path relative to it.
    fn find(
        sandbox: &Sandbox,
        base: &Path,
        pattern: &glob::Pattern,
        max_depth: usize,
        cancel: &Cancel,
    ) -> Vec<PathBuf> {
        let options = glob::MatchOptions {
            require_literal_separator: true,
            ..glob::MatchOptions::new()
        };

        let mut files: Vec<PathBuf> = WalkDir::new(base)
            .max_depth(max_depth)
            .into_iter()
            .filter_entry(|e| !skipped(e))
            .take_while(|_| !cancel.is_set())
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .strip_prefix(base)
                    .map(|rel| pattern.matches_path_with(rel, options))
                    .unwrap_or(false)
            })
            .map(walkdir::DirEntry::into_path)
            .filter(|path| sandbox.contains(path))
            .collect();

        files.sort_by_cached_key(|path| {
            std::cmp::Reverse(path.metadata().and_then(|m| m.modified()).ok())
        });
        files
    }
}

#[async_trait]
impl ToolHandler for GlobTool {
    fn name(&self) -> &'static str {
        "Glob"
    }

    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        let input: GlobInput = parse_input(input)?;
        Self::check_pattern(&input.pattern)?;
        if let Some(path) = &input.path {
            self.sandbox.normalize(path)?;
        }
        Ok(())
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let input: GlobInput = parse_input(&input)?;
        let pattern = Self::check_pattern(&input.pattern)?;
        let base = search_base(&self.sandbox, input.path.as_deref())?;

        let sandbox = self.sandbox.clone();
        let max_depth = self.max_depth;
        let files = blocking(move |cancel| Ok(Self::find(&sandbox, &base, &pattern, max_depth, cancel))).await?;

        if files.is_empty() {
            return Ok(ToolOutput::text("No files found matching pattern"));
        }
        let listing = files
            .iter()
            .map(|p| self.sandbox.display(p))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolOutput::Text(truncate_output(listing, self.max_output_bytes)))
    }
}

// ---------------------------------------------------------------------------
// Grep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum OutputMode {
    Content,
    #[default]
    FilesWithMatches,
    Count,
}

#[derive(Debug, Deserialize)]
struct GrepInput {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    glob: Option<String>,
    #[serde(default)]
    output_mode: OutputMode,
    #[serde(default)]
    head_limit: Option<usize>,
    #[serde(rename = "-i", default)]
    case_insensitive: bool,
}

/// Regex search over file contents.
#[derive(Debug, Clone)]
pub struct GrepTool {
    sandbox: Sandbox,
    max_depth: usize,
    max_output_bytes: usize,
}

impl GrepTool {
    pub fn new(sandbox: Sandbox, max_depth: usize, max_output_bytes: usize) -> Self {
        Self {
            sandbox,
            max_depth,
            max_output_bytes,
        }
    }

    fn compile(input: &GrepInput) -> Result<(Regex, Option<glob::Pattern>), ToolError> {
        let regex = RegexBuilder::new(&input.pattern)
            .case_insensitive(input.case_insensitive)
            .build()
            .map_err(|e| ToolError::invalid(format!("Invalid regex pattern: {e}")))?;
        let filter = input
            .glob
            .as_deref()
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| ToolError::invalid(format!("Invalid glob filter: {e}")))?;
        Ok((regex, filter))
    }

    #[allow(clippy::too_many_arguments)]
    fn search(
        sandbox: &Sandbox,
        base: &Path,
        regex: &Regex,
        filter: Option<&glob::Pattern>,
        mode: OutputMode,
        head_limit: usize,
        max_depth: usize,
        cancel: &Cancel,
    ) -> Vec<String> {
        let mut results = Vec::new();

        let walker = WalkDir::new(base)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !skipped(e))
            .take_while(|_| !cancel.is_set())
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file());

        for entry in walker {
            let path = entry.path();
            if let Some(filter) = filter {
                let name = entry.file_name().to_string_lossy();
                let rel = path.strip_prefix(base).unwrap_or(path);
                if !filter.matches(&name) && !filter.matches_path(rel) {
                    continue;
                }
            }

            // Binary or unreadable files are skipped
            let Ok(content) = std::fs::read_to_string(path) else {
                continue;
            };
            let shown = sandbox.display(path);

            match mode {
                OutputMode::FilesWithMatches => {
                    if regex.is_match(&content) {
                        results.push(shown);
                    }
                }
                OutputMode::Count => {
                    let count = content.lines().filter(|line| regex.is_match(line)).count();
                    if count > 0 {
                        results.push(format!("{shown}:{count}"));
                    }
                }
                OutputMode::Content => {
                    for (idx, line) in content.lines().enumerate() {
                        if regex.is_match(line) {
                            results.push(format!("{shown}:{}:{line}", idx + 1));
                            if results.len() >= head_limit {
                                break;
                            }
                        }
                    }
                }
            }

            if results.len() >= head_limit {
                results.truncate(head_limit);
                break;
            }
        }
        results
    }
}

#[async_trait]
impl ToolHandler for GrepTool {
    fn name(&self) -> &'static str {
        "Grep"
    }

    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        let input: GrepInput = parse_input(input)?;
        Self::compile(&input)?;
        if input.head_limit == Some(0) {
            return Err(ToolError::invalid("head_limit must be at least 1"));
        }
        if let Some(path) = &input.path {
            self.sandbox.normalize(path)?;
        }
        Ok(())
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let input: GrepInput = parse_input(&input)?;
        let (regex, filter) = Self::compile(&input)?;
        let base = search_base(&self.sandbox, input.path.as_deref())?;
        let head_limit = input.head_limit.unwrap_or(DEFAULT_HEAD_LIMIT).max(1);
        let mode = input.output_mode;

        let sandbox = self.sandbox.clone();
        let max_depth = self.max_depth;
        let results = blocking(move |cancel| {
            Ok(Self::search(
                &sandbox,
                &base,
                &regex,
                filter.as_ref(),
                mode,
                head_limit,
                max_depth,
                cancel,
            ))
        })
        .await?;

        if results.is_empty() {
            return Ok(ToolOutput::text("No matches found"));
        }
        Ok(ToolOutput::Text(truncate_output(
            results.join("\n"),
            self.max_output_bytes,
        )))
    }
}

// ---------------------------------------------------------------------------
// LS
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LsInput {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    ignore: Vec<String>,
}

/// Indented directory tree, directories first.
#[derive(Debug, Clone)]
pub struct LsTool {
    sandbox: Sandbox,
    max_depth: usize,
    max_output_bytes: usize,
}

impl LsTool {
    pub fn new(sandbox: Sandbox, max_depth: usize, max_output_bytes: usize) -> Self {
        Self {
            sandbox,
            max_depth,
            max_output_bytes,
        }
    }

    fn compile_ignores(patterns: &[String]) -> Result<Vec<glob::Pattern>, ToolError> {
        patterns
            .iter()
            .map(|p| glob::Pattern::new(p).map_err(|e| ToolError::invalid(format!("Invalid ignore pattern '{p}': {e}"))))
            .collect()
    }

    fn tree(
        base: &Path,
        display_base: String,
        ignores: &[glob::Pattern],
        max_depth: usize,
        cancel: &Cancel,
    ) -> Result<String, ToolError> {
        if !base.is_dir() {
            return Err(ToolError::failed(format!("Not a directory: {display_base}")));
        }

        let mut lines = vec![format!("- {display_base}/")];
        let mut count = 0usize;

        let walker = WalkDir::new(base)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by(|a, b| {
                b.file_type()
                    .is_dir()
                    .cmp(&a.file_type().is_dir())
                    .then_with(|| a.file_name().cmp(b.file_name()))
            })
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !skipped(e) && !ignores.iter().any(|p| p.matches(&name))
            })
            .take_while(|_| !cancel.is_set())
            .filter_map(|e| e.ok());

        for entry in walker {
            if count == MAX_LS_ENTRIES {
                lines.push(format!("... (stopped after {MAX_LS_ENTRIES} entries)"));
                break;
            }
            let indent = "  ".repeat(entry.depth());
            let name = entry.file_name().to_string_lossy();
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            lines.push(format!("{indent}- {name}{suffix}"));
            count += 1;
        }

        Ok(lines.join("\n"))
    }
}

#[async_trait]
impl ToolHandler for LsTool {
    fn name(&self) -> &'static str {
        "LS"
    }

    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        let input: LsInput = parse_input(input)?;
        Self::compile_ignores(&input.ignore)?;
        if let Some(path) = &input.path {
            self.sandbox.normalize(path)?;
        }
        Ok(())
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let input: LsInput = parse_input(&input)?;
        let ignores = Self::compile_ignores(&input.ignore)?;
        let base = search_base(&self.sandbox, input.path.as_deref())?;
        let display_base = self.sandbox.display(&base);

        let max_depth = self.max_depth;
        let listing = blocking(move |cancel| Self::tree(&base, display_base, &ignores, max_depth, cancel)).await?;
        Ok(ToolOutput::Text(truncate_output(listing, self.max_output_bytes)))
    }
}
