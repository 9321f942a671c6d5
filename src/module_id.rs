//! Module identifiers
//!
//! Every map in the dev server (client-known modules, build inputs, module
//! graphs, cache keys) is keyed by a [`ModuleId`]: a project-root-relative
//! path with `/` separators and no `.`/`..` components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Marker separating third-party code from app code
const NODE_MODULES: &str = "node_modules/";

/// Normalized, project-root-relative module path
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(String);

impl ModuleId {
    /// Wrap an already-normalized relative path
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Normalize `path` against the project `root`.
    ///
    /// Relative paths are taken relative to `root`. Returns `None` for paths
    /// that fall outside the project.
    pub fn from_path(root: &Path, path: &Path) -> Option<Self> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        let cleaned = clean_path(&joined);
        let relative = cleaned.strip_prefix(clean_path(root)).ok()?;
        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(Self(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Absolute filesystem path of this module under `root`
    pub fn to_path(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }

    /// Third-party modules run without live-update instrumentation
    pub fn is_third_party(&self) -> bool {
        self.0.contains(NODE_MODULES)
    }

    /// Whether this module lives inside `node_modules/<package>/`
    pub fn is_in_package(&self, package: &str) -> bool {
        self.0.contains(&format!("{}{}/", NODE_MODULES, package))
    }

    /// File extension without the dot, if any
    pub fn extension(&self) -> Option<&str> {
        let file = self.0.rsplit('/').next()?;
        let (_, ext) = file.rsplit_once('.')?;
        Some(ext)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ModuleId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lexically resolve `.` and `..` components without touching the filesystem
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
