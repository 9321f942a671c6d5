//! Module specifier resolution
//!
//! Implements relative, absolute and bare-specifier (node_modules) resolution
//! with platform-aware extension probing, `package.json` entry-point lookup,
//! and a per-build result cache.

use rustc_hash::FxHashMap as HashMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::config::Platform;
use crate::module_id::{clean_path, ModuleId};

/// `package.json` fields consulted for a package entry point, in priority order
const MAIN_FIELDS: [&str; 4] = ["react-native", "browser", "main", "module"];

#[derive(Debug, Default, Deserialize)]
struct PackageManifest {
    #[serde(flatten)]
    fields: serde_json::Map<String, serde_json::Value>,
}

impl PackageManifest {
    fn load(path: &Path) -> Option<Self> {
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// First string-valued main field
    fn entry(&self) -> Option<&str> {
        MAIN_FIELDS
            .iter()
            .find_map(|field| self.fields.get(*field).and_then(|v| v.as_str()))
    }
}

/// Resolver rooted at the project directory
#[derive(Debug)]
pub struct Resolver {
    root: PathBuf,
    /// File extensions to try when probing, most specific first
    extensions: Vec<String>,
    /// Cached (specifier, from dir) → resolved module
    cache: Mutex<HashMap<(String, PathBuf), ModuleId>>,
}

impl Resolver {
    pub fn new(root: &Path, platform: Platform) -> Self {
        let mut extensions = Vec::new();
        for prefix in ["native", platform.as_str()] {
            for ext in ["tsx", "ts", "jsx", "js"] {
                extensions.push(format!(".{}.{}", prefix, ext));
            }
        }
        for ext in ["tsx", "ts", "jsx", "js", "json"] {
            extensions.push(format!(".{}", ext));
        }

        Self {
            root: clean_path(root),
            extensions,
            cache: Mutex::new(HashMap::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `specifier` as imported from module `from`.
    ///
    /// Handles relative paths (`./`, `../`), absolute paths, and bare
    /// specifiers. Returns `None` when nothing inside the project matches.
    pub fn resolve(&self, specifier: &str, from: &ModuleId) -> Option<ModuleId> {
        let from_dir = from
            .to_path(&self.root)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        let key = (specifier.to_string(), from_dir.clone());
        if let Some(cached) = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(&key) {
            return Some(cached.clone());
        }

        let path = if specifier.starts_with("./") || specifier.starts_with("../") || specifier == "." {
            self.try_resolve_file(&clean_path(&from_dir.join(specifier)))
        } else if specifier.starts_with('/') {
            self.try_resolve_file(Path::new(specifier))
        } else {
            self.resolve_bare(specifier, &from_dir)
        }?;

        let id = ModuleId::from_path(&self.root, &path)?;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, id.clone());
        Some(id)
    }

    /// Resolve the configured entry file
    pub fn resolve_entry(&self, entry_file: &str) -> Option<ModuleId> {
        let path = self.try_resolve_file(&clean_path(&self.root.join(entry_file)))?;
        ModuleId::from_path(&self.root, &path)
    }

    /// Drop all cached resolutions
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Walk up from `from_dir` looking in each `node_modules`
    fn resolve_bare(&self, specifier: &str, from_dir: &Path) -> Option<PathBuf> {
        let (package, subpath) = parse_bare(specifier);
        let mut dir = from_dir.to_path_buf();

        loop {
            let candidate = dir.join("node_modules").join(&package);
            if candidate.is_dir() {
                if let Some(ref sub) = subpath {
                    return self.try_resolve_file(&candidate.join(sub));
                }
                if let Some(entry) = PackageManifest::load(&candidate.join("package.json"))
                    .as_ref()
                    .and_then(PackageManifest::entry)
                {
                    if let Some(found) = self.try_resolve_file(&clean_path(&candidate.join(entry))) {
                        return Some(found);
                    }
                }
                if let Some(found) = self.try_resolve_file(&candidate.join("index")) {
                    return Some(found);
                }
            }
            if dir == self.root || !dir.pop() {
                return None;
            }
        }
    }

    /// Try the path as-is, then with each extension, then as a directory
    fn try_resolve_file(&self, path: &Path) -> Option<PathBuf> {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        let base = path.as_os_str().to_string_lossy();
        for ext in &self.extensions {
            let with_ext = PathBuf::from(format!("{}{}", base, ext));
            if with_ext.is_file() {
                return Some(with_ext);
            }
        }
        if path.is_dir() {
            for ext in &self.extensions {
                let index = path.join(format!("index{}", ext));
                if index.is_file() {
                    return Some(index);
                }
            }
        }
        None
    }
}

/// Split a bare specifier into package name and subpath
fn parse_bare(specifier: &str) -> (String, Option<String>) {
    let parts: Vec<&str> = if specifier.starts_with('@') {
        specifier.splitn(3, '/').collect()
    } else {
        specifier.splitn(2, '/').collect()
    };
    let name_parts = if specifier.starts_with('@') { 2 } else { 1 };
    if parts.len() > name_parts {
        (
            parts[..name_parts].join("/"),
            Some(parts[name_parts].to_string()),
        )
    } else {
        (specifier.to_string(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_relative_with_extension_search() {
        let dir = tempdir().unwrap();
        write(dir.path(), "src/App.tsx", "");
        write(dir.path(), "src/Leaf.tsx", "");
        let resolver = Resolver::new(dir.path(), Platform::Ios);

        let id = resolver.resolve("./Leaf", &"src/App.tsx".into()).unwrap();
        assert_eq!(id.as_str(), "src/Leaf.tsx");
        let up = resolver.resolve("../src/Leaf.tsx", &"src/App.tsx".into()).unwrap();
        assert_eq!(up.as_str(), "src/Leaf.tsx");
    }

    #[test]
    fn test_platform_extension_preferred() {
        let dir = tempdir().unwrap();
        write(dir.path(), "src/Button.js", "");
        write(dir.path(), "src/Button.ios.js", "");
        write(dir.path(), "src/Button.android.js", "");

        let ios = Resolver::new(dir.path(), Platform::Ios);
        assert_eq!(ios.resolve("./Button", &"src/App.js".into()).unwrap().as_str(), "src/Button.ios.js");
        let android = Resolver::new(dir.path(), Platform::Android);
        assert_eq!(
            android.resolve("./Button", &"src/App.js".into()).unwrap().as_str(),
            "src/Button.android.js"
        );
    }

    #[test]
    fn test_directory_index() {
        let dir = tempdir().unwrap();
        write(dir.path(), "src/screens/index.ts", "");
        let resolver = Resolver::new(dir.path(), Platform::Ios);
        let id = resolver.resolve("./screens", &"src/App.js".into()).unwrap();
        assert_eq!(id.as_str(), "src/screens/index.ts");
    }

    #[test]
    fn test_bare_package_main_fields() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "node_modules/lib/package.json",
            r#"{"main": "dist/main.js", "react-native": "src/native.js"}"#,
        );
        write(dir.path(), "node_modules/lib/src/native.js", "");
        write(dir.path(), "node_modules/lib/dist/main.js", "");
        write(dir.path(), "node_modules/lib/util.js", "");
        let resolver = Resolver::new(dir.path(), Platform::Ios);

        let id = resolver.resolve("lib", &"src/App.js".into()).unwrap();
        assert_eq!(id.as_str(), "node_modules/lib/src/native.js");
        let sub = resolver.resolve("lib/util", &"src/App.js".into()).unwrap();
        assert_eq!(sub.as_str(), "node_modules/lib/util.js");
    }

    #[test]
    fn test_bare_package_index_fallback() {
        let dir = tempdir().unwrap();
        write(dir.path(), "node_modules/@scope/pkg/index.js", "");
        let resolver = Resolver::new(dir.path(), Platform::Android);
        let id = resolver.resolve("@scope/pkg", &"src/deep/App.js".into()).unwrap();
        assert_eq!(id.as_str(), "node_modules/@scope/pkg/index.js");
    }

    #[test]
    fn test_unresolvable() {
        let dir = tempdir().unwrap();
        let resolver = Resolver::new(dir.path(), Platform::Ios);
        assert!(resolver.resolve("./missing", &"src/App.js".into()).is_none());
        assert!(resolver.resolve("missing-pkg", &"src/App.js".into()).is_none());
    }

    #[test]
    fn test_parse_bare() {
        assert_eq!(parse_bare("lodash"), ("lodash".to_string(), None));
        assert_eq!(parse_bare("lodash/fp"), ("lodash".to_string(), Some("fp".to_string())));
        assert_eq!(parse_bare("@scope/pkg"), ("@scope/pkg".to_string(), None));
        assert_eq!(
            parse_bare("@scope/pkg/lib/util"),
            ("@scope/pkg".to_string(), Some("lib/util".to_string()))
        );
    }
}
