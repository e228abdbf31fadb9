//! Workspace path validation for sandboxed code.
//!
//! Every path a sandbox hands to a tool is checked here before any I/O.
//! Traversal patterns are rejected on the raw string, then the path is
//! resolved against the workspace root with symlinks followed, and the
//! resolved location must stay inside the resolved root.

use std::path::{Component, Path, PathBuf};

use toolweave_core::{Result, WeaveError};

/// Raw-string patterns that are always an attack, before any
/// normalization: literal traversal, URL-encoded traversal or
/// separators, and NUL bytes.
const ENCODED_ATTACK_PATTERNS: &[&str] = &["%2e", "%2f", "%5c", "%00", "%252e", "%252f"];

#[derive(Debug)]
pub struct WorkspaceGuard {
    root: PathBuf,
}

impl WorkspaceGuard {
    /// The root must exist; it is resolved once so later containment
    /// checks compare real paths on both sides.
    pub fn new(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .map_err(|e| WeaveError::WorkspaceInvalid(format!("{}: {}", root.display(), e)))?;
        if !root.is_dir() {
            return Err(WeaveError::WorkspaceInvalid(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate one candidate path. Returns the resolved absolute path
    /// on success; all failures happen before any I/O on the target.
    pub fn validate(&self, candidate: &str) -> Result<PathBuf> {
        if candidate.is_empty() {
            return Err(WeaveError::PathInvalid("empty path".into()));
        }
        if candidate.contains('\0') {
            return Err(WeaveError::PathTraversalAttack("NUL byte in path".into()));
        }
        let lowered = candidate.to_lowercase();
        for pattern in ENCODED_ATTACK_PATTERNS {
            if lowered.contains(pattern) {
                return Err(WeaveError::PathTraversalAttack(format!(
                    "encoded traversal in {:?}",
                    candidate
                )));
            }
        }

        let path = Path::new(candidate);
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(WeaveError::PathTraversalAttack(format!(
                "parent traversal in {:?}",
                candidate
            )));
        }

        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        let resolved = resolve_with_symlinks(&joined)?;
        if !resolved.starts_with(&self.root) {
            return Err(WeaveError::PathOutsideWorkspace(format!(
                "{:?} resolves outside the workspace",
                candidate
            )));
        }
        Ok(resolved)
    }
}

/// Canonicalize the deepest existing ancestor, then re-append the
/// not-yet-existing tail. New files validate against where they would
/// actually land, with any symlinked ancestors resolved.
fn resolve_with_symlinks(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(real) => {
                let mut resolved = real;
                for part in tail.iter().rev() {
                    resolved.push(part);
                }
                return Ok(resolved);
            }
            Err(_) => {
                let Some(name) = existing.file_name() else {
                    return Err(WeaveError::PathInvalid(format!(
                        "{} has no existing ancestor",
                        path.display()
                    )));
                };
                tail.push(name.to_os_string());
                existing = existing
                    .parent()
                    .map(Path::to_path_buf)
                    .ok_or_else(|| {
                        WeaveError::PathInvalid(format!("{} cannot be resolved", path.display()))
                    })?;
            }
        }
    }
}

/// Argument keys that carry host paths and therefore get validated
/// before an RPC is dispatched.
const PATH_ARG_KEYS: &[&str] = &[
    "path",
    "file",
    "file_path",
    "filepath",
    "dir",
    "directory",
    "source",
    "src",
    "dest",
    "destination",
    "target",
];

/// Validate every path-bearing argument of a tool call. Non-object args
/// pass through untouched.
pub fn validate_tool_args(guard: &WorkspaceGuard, args: &serde_json::Value) -> Result<()> {
    let Some(map) = args.as_object() else {
        return Ok(());
    };
    for (key, value) in map {
        if PATH_ARG_KEYS.contains(&key.as_str()) {
            if let Some(s) = value.as_str() {
                guard.validate(s)?;
            }
        }
        if value.is_object() {
            validate_tool_args(guard, value)?;
        }
    }
    Ok(())
}
