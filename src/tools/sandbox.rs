//! Path confinement for file, search and shell tools.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use super::ToolError;

/// Directories never descended into by search tools.
pub const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules"];

/// A canonical root directory that tool paths must stay inside.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            root: root.as_ref().canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lexical check: resolve `requested` against the root and collapse `.`
    /// and `..` without touching the filesystem. Escapes are rejected here.
    pub fn normalize(&self, requested: &str) -> Result<PathBuf, ToolError> {
        if requested.trim().is_empty() {
            return Err(ToolError::invalid("path must not be empty"));
        }
        if requested.contains('\0') {
            return Err(ToolError::invalid("path contains a NUL byte"));
        }

        let requested_path = Path::new(requested);
        let joined = if requested_path.is_absolute() {
            requested_path.to_path_buf()
        } else {
            self.root.join(requested_path)
        };

        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::Prefix(_) | Component::RootDir => normalized.push(component.as_os_str()),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(self.escape(requested));
                    }
                }
                Component::Normal(part) => normalized.push(part),
            }
        }

        if !normalized.starts_with(&self.root) {
            return Err(self.escape(requested));
        }
        Ok(normalized)
    }

    /// Full check: the lexical pass, then canonicalize the longest existing
    /// ancestor so a symlink inside the root cannot point outside it.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, ToolError> {
        let normalized = self.normalize(requested)?;

        let mut existing = normalized.as_path();
        let mut missing: Vec<OsString> = Vec::new();
        let real = loop {
            match existing.canonicalize() {
                Ok(real) => break real,
                Err(_) if existing.symlink_metadata().is_ok() => {
                    // Dangling symlink; its target is unknowable
                    return Err(self.escape(requested));
                }
                Err(_) => {
                    let name = existing.file_name().ok_or_else(|| self.escape(requested))?;
                    missing.push(name.to_os_string());
                    existing = existing.parent().ok_or_else(|| self.escape(requested))?;
                }
            }
        };

        let mut resolved = real;
        for part in missing.iter().rev() {
            resolved.push(part);
        }

        if !resolved.starts_with(&self.root) {
            return Err(self.escape(requested));
        }
        Ok(resolved)
    }

    /// Whether an already-discovered path (e.g. a glob hit) really lies inside
    /// the root once symlinks are followed.
    pub fn contains(&self, path: &Path) -> bool {
        path.canonicalize()
            .map(|real| real.starts_with(&self.root))
            .unwrap_or(false)
    }

    /// Path relative to the root for tool output.
    pub fn display(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }

    fn escape(&self, requested: &str) -> ToolError {
        ToolError::PathEscape {
            path: requested.to_string(),
        }
    }
}

pub fn is_skipped_dir(name: &str) -> bool {
    SKIPPED_DIRS.contains(&name)
}
