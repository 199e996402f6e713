//! Sandbox path resolution.
//!
//! Every path handed to the store goes through [`PathResolver`] before any
//! storage access. Paths are normalized lexically, then the longest existing
//! ancestor is canonicalized so that symlinked intermediate directories are
//! followed before the containment check, not after.

use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use url::Url;

/// Gatekeeper that maps logical paths to absolute paths inside the sandbox root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// Create a resolver for an existing root directory.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        let canonical = fs::canonicalize(root).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::invalid_store(root, "directory does not exist")
            } else {
                Error::from(e)
            }
        })?;

        if !canonical.is_dir() {
            return Err(Error::invalid_store(root, "not a directory"));
        }

        Ok(Self { root: canonical })
    }

    /// The canonical sandbox root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a logical path relative to the sandbox root.
    pub fn resolve(&self, logical: &str) -> Result<PathBuf> {
        self.resolve_in(&self.root, logical)
    }

    /// Resolve a logical path relative to `base`, which must itself be inside the root.
    ///
    /// Accepts relative paths, absolute paths, and `file://` URIs. The returned
    /// path names a symlink leaf rather than its target, but the target must
    /// also lie inside the root.
    pub fn resolve_in(&self, base: &Path, logical: &str) -> Result<PathBuf> {
        let path = strip_file_scheme(logical)?;
        let joined = if path.is_absolute() {
            path
        } else {
            base.join(path)
        };
        let normalized = normalize_lexical(&joined);

        let resolved = match (normalized.parent(), normalized.file_name()) {
            (Some(parent), Some(leaf)) => {
                let parent = canonicalize_with_tail(parent)?;
                let candidate = parent.join(leaf);
                self.check_symlink_leaf(&candidate, logical)?;
                candidate
            }
            _ => canonicalize_with_tail(&normalized)?,
        };

        if !self.contains(&resolved) {
            tracing::debug!(path = %logical, resolved = %resolved.display(), "rejected out-of-scope path");
            return Err(Error::out_of_scope(logical));
        }

        Ok(resolved)
    }

    /// Whether an absolute, already-resolved path lies within the root.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Whether a resolved path is the sandbox root itself.
    pub fn is_root(&self, path: &Path) -> bool {
        path == self.root
    }

    /// The `file://` URI for a resolved path.
    pub fn to_uri(&self, path: &Path) -> String {
        Url::from_file_path(path)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| format!("file://{}", path.display()))
    }

    /// A symlink leaf is allowed only if what it points at stays inside the root.
    fn check_symlink_leaf(&self, candidate: &Path, logical: &str) -> Result<()> {
        let is_symlink = fs::symlink_metadata(candidate)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_symlink {
            return Ok(());
        }

        let target = match fs::canonicalize(candidate) {
            Ok(target) => target,
            Err(_) => {
                // Dangling link: judge the target lexically.
                let link = fs::read_link(candidate)?;
                let absolute = match candidate.parent() {
                    Some(parent) if link.is_relative() => parent.join(link),
                    _ => link,
                };
                canonicalize_with_tail(&normalize_lexical(&absolute))?
            }
        };

        if self.contains(&target) {
            Ok(())
        } else {
            tracing::debug!(path = %logical, target = %target.display(), "rejected symlink escaping sandbox");
            Err(Error::out_of_scope(logical))
        }
    }
}

/// Accept `file://` URIs as well as plain paths.
fn strip_file_scheme(logical: &str) -> Result<PathBuf> {
    if !logical.starts_with("file:") {
        return Ok(PathBuf::from(logical));
    }

    Url::parse(logical)
        .ok()
        .and_then(|url| url.to_file_path().ok())
        .ok_or_else(|| Error::out_of_scope(logical))
}

/// Resolve `.` and `..` components without touching the filesystem.
///
/// `..` never pops past the filesystem root or a path prefix.
pub(crate) fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Canonicalize the longest existing ancestor of a normalized path and
/// re-append the remaining tail.
fn canonicalize_with_tail(path: &Path) -> io::Result<PathBuf> {
    let mut ancestor = path;
    let mut tail: Vec<&OsStr> = Vec::new();

    loop {
        match fs::canonicalize(ancestor) {
            Ok(canonical) => {
                let mut result = canonical;
                for part in tail.iter().rev() {
                    result.push(part);
                }
                return Ok(result);
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    || e.kind() == io::ErrorKind::NotADirectory => {}
            Err(e) => return Err(e),
        }

        match (ancestor.file_name(), ancestor.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name);
                ancestor = parent;
            }
            _ => return Ok(path.to_path_buf()),
        }
    }
}
