//! `Bash`: whitelisted command execution without a shell.
//!
//! The command line is split with quote awareness and run directly, so no
//! expansion, redirection or chaining can happen. Input that a shell would
//! interpret is rejected rather than quoted away.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use super::sandbox::Sandbox;
use super::{parse_input, truncate_output, ToolContext, ToolError, ToolHandler, ToolOutput};

/// Rejected anywhere outside single quotes.
const METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '>', '<', '`', '(', ')', '{', '}', '*', '?', '!', '~', '\\',
];

#[derive(Debug, Deserialize)]
struct BashInput {
    command: String,
}

/// Split a command line into arguments.
///
/// Single quotes are literal. Double quotes group words but may not contain
/// characters a shell would expand. Unquoted metacharacters and newlines are
/// errors.
pub fn tokenize(command: &str) -> Result<Vec<String>, ToolError> {
    let reject = |message: String| ToolError::CommandRejected { message };

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\n' | '\r' => return Err(reject("newlines are not allowed".into())),
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some('\n') | Some('\r') => return Err(reject("newlines are not allowed".into())),
                        Some(inner) => current.push(inner),
                        None => return Err(reject("unterminated single quote".into())),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(inner @ ('$' | '`' | '\\' | '!')) => {
                            return Err(reject(format!("'{inner}' is not allowed inside double quotes")))
                        }
                        Some('\n') | Some('\r') => return Err(reject("newlines are not allowed".into())),
                        Some(inner) => current.push(inner),
                        None => return Err(reject("unterminated double quote".into())),
                    }
                }
            }
            c if METACHARACTERS.contains(&c) => {
                return Err(reject(format!("shell metacharacter '{c}' is not allowed")))
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }

    if tokens.is_empty() {
        return Err(reject("empty command".into()));
    }
    Ok(tokens)
}

fn escapes(value: &str) -> bool {
    let absolute = value.starts_with('/') || std::path::Path::new(value).is_absolute();
    let parent = value.split(['/', '\\']).any(|part| part == "..");
    absolute || parent
}

/// Every reading of `arg` that names a location outside the working
/// directory: the argument itself, the value of `key=value`, and for options
/// a path glued to the flag (`-o/tmp/x`, `-C../up`). A glued path is taken
/// from the first `/` or `..`, so `-osrc/x` is checked as `/x` too.
fn path_candidates(arg: &str) -> Vec<&str> {
    let mut candidates = vec![arg];
    if let Some((_, value)) = arg.split_once('=') {
        candidates.push(value);
    }
    if arg.starts_with('-') {
        let flag = arg.trim_start_matches('-');
        if let Some(pos) = flag.find('/') {
            candidates.push(&flag[pos..]);
        }
        if let Some(pos) = flag.find("..") {
            candidates.push(&flag[pos..]);
        }
    }
    candidates.retain(|c| escapes(c));
    candidates
}

#[derive(Debug, Clone)]
pub struct BashTool {
    sandbox: Sandbox,
    /// Each entry is a whitelisted command prefix, already split into words.
    whitelist: Vec<Vec<String>>,
    max_output_bytes: usize,
}

impl BashTool {
    pub fn new(sandbox: Sandbox, whitelist: &[String], max_output_bytes: usize) -> Self {
        let whitelist = whitelist
            .iter()
            .map(|entry| entry.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|words| !words.is_empty())
            .collect();
        Self {
            sandbox,
            whitelist,
            max_output_bytes,
        }
    }

    fn allowed(&self, tokens: &[String]) -> bool {
        self.whitelist
            .iter()
            .any(|prefix| tokens.len() >= prefix.len() && tokens[..prefix.len()] == prefix[..])
    }

    /// Tokenize and check everything that can be checked without I/O.
    fn plan(&self, command: &str) -> Result<Vec<String>, ToolError> {
        let tokens = tokenize(command)?;
        if !self.allowed(&tokens) {
            return Err(ToolError::CommandRejected {
                message: format!("'{}' is not in the command whitelist", tokens[0]),
            });
        }
        for path in tokens[1..].iter().flat_map(|arg| path_candidates(arg)) {
            self.sandbox.normalize(path)?;
        }
        Ok(tokens)
    }
}

#[async_trait]
impl ToolHandler for BashTool {
    fn name(&self) -> &'static str {
        "Bash"
    }

    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        let input: BashInput = parse_input(input)?;
        self.plan(&input.command).map(|_| ())
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let input: BashInput = parse_input(&input)?;
        let tokens = self.plan(&input.command)?;
        for path in tokens[1..].iter().flat_map(|arg| path_candidates(arg)) {
            self.sandbox.resolve(path)?;
        }

        debug!(program = %tokens[0], args = tokens.len() - 1, "Running command");
        let output = Command::new(&tokens[0])
            .args(&tokens[1..])
            .current_dir(self.sandbox.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ToolError::failed(format!("Failed to run '{}': {e}", tokens[0])))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        let text = truncate_output(text, self.max_output_bytes);

        if output.status.success() {
            Ok(ToolOutput::Text(text))
        } else {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Err(ToolError::failed(format!("Command exited with status {code}\n{text}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn tool(dir: &tempfile::TempDir, whitelist: &[&str]) -> BashTool {
        let whitelist: Vec<String> = whitelist.iter().map(|s| s.to_string()).collect();
        BashTool::new(Sandbox::new(dir.path()).unwrap(), &whitelist, 10_000)
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            tokenize(r#"git commit -m "fix the bug" 'a|b'"#).unwrap(),
            vec!["git", "commit", "-m", "fix the bug", "a|b"]
        );
        assert_eq!(tokenize("echo ''").unwrap(), vec!["echo", ""]);
    }

    #[test]
    fn test_tokenize_rejects_metacharacters() {
        for cmd in [
            "ls; rm -rf /",
            "ls | sh",
            "echo $(id)",
            "echo `id`",
            "cat < x",
            "ls > out",
            "sleep 1 &",
            "ls *",
            "echo \"$HOME\"",
            "ls\nrm x",
            "ls ~",
            "echo 'open",
        ] {
            let err = tokenize(cmd).unwrap_err();
            assert!(matches!(err, ToolError::CommandRejected { .. }), "{cmd:?}");
        }
    }

    #[test]
    fn test_whitelist_matches_word_prefix() {
        let dir = tempdir().unwrap();
        let bash = tool(&dir, &["ls", "git status"]);

        assert!(bash.validate(&json!({"command": "ls -la"})).is_ok());
        assert!(bash.validate(&json!({"command": "git status --short"})).is_ok());
        assert!(bash.validate(&json!({"command": "git push"})).is_err());
        assert!(bash.validate(&json!({"command": "lsof"})).is_err());
        assert!(bash.validate(&json!({"command": "/bin/ls"})).is_err());
    }

    #[test]
    fn test_path_arguments_confined() {
        let dir = tempdir().unwrap();
        let bash = tool(&dir, &["cat"]);

        let err = bash
            .validate(&json!({"command": "cat ../../etc/passwd"}))
            .unwrap_err();
        assert!(matches!(err, ToolError::PathEscape { .. }));
        assert!(bash.validate(&json!({"command": "cat /etc/passwd"})).is_err());
        assert!(bash.validate(&json!({"command": "cat --file=/etc/passwd"})).is_err());
        assert!(bash.validate(&json!({"command": "cat notes.txt"})).is_ok());
    }

    #[test]
    fn test_path_glued_to_option_confined() {
        let dir = tempdir().unwrap();
        let bash = tool(&dir, &["sort", "tar", "dd"]);

        for cmd in [
            "sort -o/tmp/escaped.txt notes.txt",
            "sort -o../escaped.txt notes.txt",
            "tar -xvf/etc/archive.tar",
            "tar -C/etc -xf a.tar",
            "dd if=notes.txt of=/tmp/escaped.txt",
        ] {
            let err = bash.validate(&json!({"command": cmd})).unwrap_err();
            assert!(matches!(err, ToolError::PathEscape { .. }), "{cmd:?}");
        }
        assert!(bash.validate(&json!({"command": "sort -osorted.txt notes.txt"})).is_ok());
        assert!(bash.validate(&json!({"command": "sort -o sorted/out.txt notes.txt"})).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_glued_output_path_writes_nothing_outside() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "b\na\n").unwrap();
        let bash = tool(&dir, &["sort"]);

        let target = outside.path().join("escaped.txt");
        let command = format!("sort -o{} notes.txt", target.display());
        let err = bash
            .execute(json!({"command": command}), &ToolContext::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ToolError::PathEscape { .. }));
        assert!(!target.exists());
    }

    #[test]
    fn test_empty_whitelist_rejects_everything() {
        let dir = tempdir().unwrap();
        let bash = tool(&dir, &[]);
        assert!(bash.validate(&json!({"command": "ls"})).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_in_root_and_reports_failure() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hi there").unwrap();
        let bash = tool(&dir, &["cat"]);
        let ctx = ToolContext::default();

        let out = bash
            .execute(json!({"command": "cat hello.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.as_text(), "hi there");

        let err = bash
            .execute(json!({"command": "cat missing.txt"}), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with status"));
    }
}
