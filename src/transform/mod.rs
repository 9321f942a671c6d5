//! Transform pipeline
//!
//! A module's source text flows through an ordered list of [`TransformStage`]s.
//! Each stage declares a [`StageFilter`]; matching stages run in declared
//! order, either in-process or on the [`WorkerPool`] by name. Every stage
//! receives and returns the same [`TransformData`] record.
//!
//! The final output is cached per (path, hmr flag, js target) and validated
//! against a fingerprint of the raw file bytes, so an unchanged file skips the
//! whole chain.

pub mod pool;
pub mod stages;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::cache::{Fingerprint, PersistentCache};
use crate::config::JsTarget;
use crate::error::{Diagnostic, Diagnostics, Error, Result};
use crate::module_id::ModuleId;

pub use pool::WorkerPool;
pub use stages::JsonModuleStage;

/// Package selector matching first-party code
pub const APP_CODE: &str = "<app-code>";

/// Name of the persisted cache domain holding transform output
pub const CACHE_NAME: &str = "transform-cache";

/// The record every stage receives and returns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformData {
    pub code: String,
    /// Loader class (`js`, `jsx`, `ts`, `tsx`, `json`, ...)
    pub loader: String,
    pub relative_path: String,
    /// Whether the output is destined for a live-patchable bundle
    pub hmr: bool,
}

/// Loader class for a module, derived from its extension
pub fn loader_for(id: &ModuleId) -> String {
    match id.extension() {
        Some("js") | None => "jsx".to_string(),
        Some(ext) => ext.to_string(),
    }
}

/// Which files a stage applies to. Every populated criterion must match.
#[derive(Debug, Clone, Default)]
pub struct StageFilter {
    pub loaders: Option<Vec<String>>,
    /// Package names; [`APP_CODE`] selects first-party modules
    pub packages: Option<Vec<String>>,
    pub content_test: Option<Regex>,
}

impl StageFilter {
    pub fn loaders(loaders: &[&str]) -> Self {
        Self {
            loaders: Some(loaders.iter().map(|l| l.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn with_packages(mut self, packages: &[&str]) -> Self {
        self.packages = Some(packages.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn with_content_test(mut self, test: Regex) -> Self {
        self.content_test = Some(test);
        self
    }

    pub fn matches(&self, data: &TransformData) -> bool {
        if let Some(ref loaders) = self.loaders {
            if !loaders.iter().any(|l| *l == data.loader) {
                return false;
            }
        }

        if let Some(ref packages) = self.packages {
            if !in_matching_package(packages, &data.relative_path) {
                return false;
            }
        }

        if let Some(ref test) = self.content_test {
            if !test.is_match(&data.code) {
                return false;
            }
        }

        true
    }
}

fn in_matching_package(packages: &[String], relative_path: &str) -> bool {
    let id = ModuleId::from(relative_path);
    if !id.is_third_party() {
        return packages.iter().any(|p| p == APP_CODE);
    }
    packages.iter().any(|p| id.is_in_package(p))
}

/// A transform implementation.
///
/// Implementations dispatched to the worker pool run concurrently on several
/// threads and must not share mutable state.
pub trait Transform: Send + Sync {
    fn transform(&self, data: TransformData) -> Result<TransformData>;
}

impl<F> Transform for F
where
    F: Fn(TransformData) -> Result<TransformData> + Send + Sync,
{
    fn transform(&self, data: TransformData) -> Result<TransformData> {
        self(data)
    }
}

/// Where a stage's implementation runs
#[derive(Clone)]
pub enum StageRunner {
    InProcess(Arc<dyn Transform>),
    /// Dispatched to the worker pool under this registered name
    Pooled(String),
}

impl fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageRunner::InProcess(_) => f.write_str("InProcess(<fn>)"),
            StageRunner::Pooled(name) => write!(f, "Pooled({})", name),
        }
    }
}

/// One named, filtered step of the pipeline
#[derive(Debug, Clone)]
pub struct TransformStage {
    pub name: String,
    pub filter: StageFilter,
    pub runner: StageRunner,
}

impl TransformStage {
    pub fn in_process(name: &str, filter: StageFilter, transform: impl Transform + 'static) -> Self {
        Self {
            name: name.to_string(),
            filter,
            runner: StageRunner::InProcess(Arc::new(transform)),
        }
    }

    /// In-process stage backed by a closure
    pub fn from_fn<F>(name: &str, filter: StageFilter, f: F) -> Self
    where
        F: Fn(TransformData) -> Result<TransformData> + Send + Sync + 'static,
    {
        Self::in_process(name, filter, f)
    }

    pub fn pooled(name: &str, filter: StageFilter) -> Self {
        Self {
            name: name.to_string(),
            filter,
            runner: StageRunner::Pooled(name.to_string()),
        }
    }
}

/// Ordered, cached chain of transform stages
pub struct TransformPipeline {
    stages: Vec<TransformStage>,
    pool: Option<Arc<WorkerPool>>,
    cache: Arc<PersistentCache<TransformData>>,
    target: JsTarget,
}

impl fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("stages", &self.stages.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("target", &self.target)
            .finish()
    }
}

impl TransformPipeline {
    pub fn new(
        stages: Vec<TransformStage>,
        cache: Arc<PersistentCache<TransformData>>,
        target: JsTarget,
    ) -> Self {
        Self {
            stages,
            pool: None,
            cache,
            target,
        }
    }

    /// Attach the pool that runs [`StageRunner::Pooled`] stages
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn target(&self) -> JsTarget {
        self.target
    }

    pub fn cache(&self) -> &Arc<PersistentCache<TransformData>> {
        &self.cache
    }

    /// Cache slot for a module in a given mode
    pub fn cache_key(&self, id: &ModuleId, hmr: bool) -> String {
        format!("{}|hmr={}|{}", id, hmr, self.target.as_str())
    }

    /// Transform a module's raw bytes, serving the cached result when the
    /// fingerprint of `raw` matches the stored one
    pub async fn transform(&self, id: &ModuleId, raw: &[u8], hmr: bool) -> Result<TransformData> {
        let key = self.cache_key(id, hmr);
        let fingerprint = Fingerprint::of(raw);

        if let Some(cached) = self.cache.get(&key, &fingerprint) {
            trace!(module = %id, "transform cache hit");
            return Ok(cached);
        }

        let code = String::from_utf8(raw.to_vec()).map_err(|_| {
            Error::Transform(Diagnostics::single(
                Diagnostic::new("pipeline", "file is not valid UTF-8").with_file(id.as_str()),
            ))
        })?;

        let data = TransformData {
            code,
            loader: loader_for(id),
            relative_path: id.to_string(),
            hmr,
        };
        let output = self.run_stages(data).await?;
        self.cache.insert(key, fingerprint, output.clone());
        Ok(output)
    }

    async fn run_stages(&self, mut data: TransformData) -> Result<TransformData> {
        for stage in &self.stages {
            if !stage.filter.matches(&data) {
                continue;
            }
            trace!(stage = %stage.name, module = %data.relative_path, "running transform stage");

            let file = data.relative_path.clone();
            let result = match &stage.runner {
                StageRunner::InProcess(transform) => transform.transform(data),
                StageRunner::Pooled(name) => match self.pool {
                    Some(ref pool) => pool.run(name, data).await,
                    None => Err(Error::internal(format!(
                        "stage '{}' needs a worker pool but none is configured",
                        name
                    ))),
                },
            };
            data = result.map_err(|e| attribute_error(e, &stage.name, &file))?;
        }
        Ok(data)
    }
}

/// Fill in the stage name and file on diagnostics a stage left blank
fn attribute_error(error: Error, stage: &str, file: &str) -> Error {
    match error {
        Error::Transform(Diagnostics(list)) => Error::Transform(Diagnostics(
            list.into_iter()
                .map(|mut d| {
                    if d.origin.is_empty() {
                        d.origin = stage.to_string();
                    }
                    if d.file.is_none() {
                        d.file = Some(file.to_string());
                    }
                    d
                })
                .collect(),
        )),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn pipeline(stages: Vec<TransformStage>) -> (TransformPipeline, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let cache = Arc::new(PersistentCache::open(dir.path(), CACHE_NAME));
        (TransformPipeline::new(stages, cache, JsTarget::Jsc), dir)
    }

    fn data(path: &str, loader: &str, code: &str) -> TransformData {
        TransformData {
            code: code.to_string(),
            loader: loader.to_string(),
            relative_path: path.to_string(),
            hmr: true,
        }
    }

    #[test]
    fn test_loader_for() {
        assert_eq!(loader_for(&"src/a.js".into()), "jsx");
        assert_eq!(loader_for(&"src/a.tsx".into()), "tsx");
        assert_eq!(loader_for(&"src/data.json".into()), "json");
    }

    #[test]
    fn test_filter_loaders() {
        let filter = StageFilter::loaders(&["ts", "tsx"]);
        assert!(filter.matches(&data("src/a.tsx", "tsx", "")));
        assert!(!filter.matches(&data("src/a.js", "jsx", "")));
    }

    #[test]
    fn test_filter_packages() {
        let filter = StageFilter::default().with_packages(&[APP_CODE, "react-native"]);
        assert!(filter.matches(&data("src/a.js", "jsx", "")));
        assert!(filter.matches(&data("node_modules/react-native/index.js", "jsx", "")));
        assert!(!filter.matches(&data("node_modules/lodash/index.js", "jsx", "")));

        let third_party_only = StageFilter::default().with_packages(&["react-native"]);
        assert!(!third_party_only.matches(&data("src/a.js", "jsx", "")));
    }

    #[test]
    fn test_filter_content_test() {
        let filter = StageFilter::default().with_content_test(Regex::new("'worklet'").unwrap());
        assert!(filter.matches(&data("src/a.js", "jsx", "function f() { 'worklet'; }")));
        assert!(!filter.matches(&data("src/a.js", "jsx", "function f() {}")));
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let (pipeline, _dir) = pipeline(vec![
            TransformStage::from_fn("first", StageFilter::default(), |mut d: TransformData| {
                d.code.push_str("//first");
                Ok(d)
            }),
            TransformStage::from_fn("skipped", StageFilter::loaders(&["ts"]), |mut d: TransformData| {
                d.code.push_str("//skipped");
                Ok(d)
            }),
            TransformStage::from_fn("second", StageFilter::default(), |mut d: TransformData| {
                d.code.push_str("//second");
                Ok(d)
            }),
        ]);

        let out = pipeline.transform(&"src/a.js".into(), b"x", true).await.unwrap();
        assert_eq!(out.code, "x//first//second");
    }

    #[tokio::test]
    async fn test_cache_idempotence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (pipeline, _dir) = pipeline(vec![TransformStage::from_fn(
            "stub",
            StageFilter::default(),
            move |mut d: TransformData| {
                counter.fetch_add(1, Ordering::SeqCst);
                d.code = d.code.to_uppercase();
                Ok(d)
            },
        )]);

        let id: ModuleId = "src/a.js".into();
        let first = pipeline.transform(&id, b"let a = 1;", true).await.unwrap();
        let second = pipeline.transform(&id, b"let a = 1;", true).await.unwrap();
        assert_eq!(first.code.as_bytes(), second.code.as_bytes());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A different mode is a different slot
        pipeline.transform(&id, b"let a = 1;", false).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Changed content invalidates the slot
        let changed = pipeline.transform(&id, b"let a = 2;", true).await.unwrap();
        assert_eq!(changed.code, "LET A = 2;");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stage_error_is_attributed() {
        let (pipeline, _dir) = pipeline(vec![TransformStage::from_fn(
            "svg",
            StageFilter::default(),
            |_d: TransformData| Err(Error::Transform(Diagnostics::single(Diagnostic::new("", "bad svg")))),
        )]);

        let err = pipeline.transform(&"src/icon.svg".into(), b"<svg", true).await.unwrap_err();
        let diagnostic = &err.diagnostics().unwrap().0[0];
        assert_eq!(diagnostic.origin, "svg");
        assert_eq!(diagnostic.file.as_deref(), Some("src/icon.svg"));
    }

    #[tokio::test]
    async fn test_pooled_stage_without_pool_is_internal_error() {
        let (pipeline, _dir) = pipeline(vec![TransformStage::pooled("heavy", StageFilter::default())]);
        let err = pipeline.transform(&"src/a.js".into(), b"x", true).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
