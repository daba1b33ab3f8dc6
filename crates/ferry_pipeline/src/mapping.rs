//! Watch rules, file identity and the events the pipeline consumes.

use regex::Regex;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::{PipelineError, Result};

/// A watch rule: files under `source_root` whose name matches `pattern` are
/// transferred below `target_root`.
///
/// Immutable once built; shared between the watcher and every task.
#[derive(Debug, Clone)]
pub struct FileMapping {
    pattern: Regex,
    source_root: PathBuf,
    target_root: String,
}

impl FileMapping {
    /// Build a mapping. `pattern` must match the whole file name.
    pub fn new(pattern: &str, source_root: impl Into<PathBuf>, target_root: &str) -> Result<Self> {
        let source_root = source_root.into();
        if pattern.is_empty() {
            return Err(PipelineError::InvalidMapping("empty pattern".to_string()));
        }
        if source_root.as_os_str().is_empty() {
            return Err(PipelineError::InvalidMapping("empty source path".to_string()));
        }
        if target_root.is_empty() {
            return Err(PipelineError::InvalidMapping("empty target path".to_string()));
        }
        let pattern = Regex::new(&format!("^(?:{})$", pattern))?;
        Ok(Self {
            pattern,
            source_root,
            target_root: target_root.to_string(),
        })
    }

    /// Parse a `pattern|sourcePath|targetPath` rule line.
    pub fn parse_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() != 3 {
            return Err(PipelineError::InvalidMapping(format!(
                "expected 'pattern|sourcePath|targetPath', got '{}'",
                line.trim()
            )));
        }
        Self::new(parts[0].trim(), parts[1].trim(), parts[2].trim())
    }

    /// Parse a whole mapping document. Blank lines and `#` comments are skipped.
    pub fn parse_all(content: &str) -> Result<Vec<Self>> {
        let mut mappings = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mapping = Self::parse_line(trimmed).map_err(|e| {
                PipelineError::InvalidMapping(format!("line {}: {}", idx + 1, e))
            })?;
            mappings.push(mapping);
        }
        Ok(mappings)
    }

    pub fn pattern(&self) -> &str {
        let raw = self.pattern.as_str();
        raw.strip_prefix("^(?:")
            .and_then(|s| s.strip_suffix(")$"))
            .unwrap_or(raw)
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn target_root(&self) -> &str {
        &self.target_root
    }

    /// Whether the file name of `path` matches this rule's pattern.
    pub fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.pattern.is_match(&name.to_string_lossy()))
            .unwrap_or(false)
    }

    /// Remote logical path for `local`: the `source_root` prefix is replaced
    /// by `target_root`. Remote paths always use forward slashes.
    pub fn remote_path_for(&self, local: &Path) -> Result<String> {
        let rel = local
            .strip_prefix(&self.source_root)
            .map_err(|_| PipelineError::OutsideSourceRoot {
                path: local.to_path_buf(),
                root: self.source_root.clone(),
            })?;
        let rel = normalize_path_to_forward_slashes(rel);
        if rel.is_empty() {
            return Err(PipelineError::InvalidMapping(format!(
                "'{}' is the source root itself, not a file below it",
                local.display()
            )));
        }
        let target = self.target_root.trim_end_matches('/');
        Ok(format!("{}/{}", target, rel))
    }
}

impl fmt::Display for FileMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.pattern(),
            self.source_root.display(),
            self.target_root
        )
    }
}

/// Join path components with forward slashes regardless of platform.
fn normalize_path_to_forward_slashes(path: &Path) -> String {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Canonical absolute path identifying "the same file" across events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey(PathBuf);

impl FileKey {
    /// Canonicalize `path`; falls back to an absolute, uncanonicalized path
    /// when the file no longer exists.
    pub fn for_path(path: &Path) -> Self {
        if let Ok(canonical) = std::fs::canonicalize(path) {
            return FileKey(canonical);
        }
        if path.is_absolute() {
            return FileKey(path.to_path_buf());
        }
        match std::env::current_dir() {
            Ok(cwd) => FileKey(cwd.join(path)),
            Err(_) => FileKey(path.to_path_buf()),
        }
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// A raw filesystem change, as produced by a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(PathBuf),
    Modified(PathBuf),
}

impl FileEvent {
    pub fn path(&self) -> &Path {
        match self {
            FileEvent::Created(path) | FileEvent::Modified(path) => path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FileEvent::Created(_) => "created",
            FileEvent::Modified(_) => "modified",
        }
    }
}
