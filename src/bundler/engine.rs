//! The built-in bundler engine
//!
//! Walks the import graph breadth-first from a set of roots, loading each
//! level concurrently: read, transform through the pipeline, scan
//! specifiers, resolve them, and rewrite them to module ids. The engine keeps
//! an incremental handle (one record per module, validated by fingerprint), so
//! a rebuild only reprocesses files whose bytes changed.

use futures::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

use super::emit::Emitter;
use super::resolver::Resolver;
use super::scan::{rewrite_specifiers, scan_imports};
use crate::cache::Fingerprint;
use crate::config::Platform;
use crate::error::{Diagnostic, Diagnostics, Error, Result, SourceLocation};
use crate::module_id::ModuleId;
use crate::source_map::SourceMap;
use crate::transform::TransformPipeline;

/// Compiled output of one build
#[derive(Debug, Clone)]
pub struct BuildArtifact {
    pub code: String,
    pub map: SourceMap,
    /// Every module the build touched, with the ids it imports
    pub inputs: BTreeMap<ModuleId, Vec<ModuleId>>,
}

/// What to build
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    /// Modules the walk starts from, registered last in this order
    pub roots: Vec<ModuleId>,
    /// Modules the consumer already holds: listed in `inputs` but neither
    /// loaded nor emitted, and their imports are not followed
    pub stubs: BTreeSet<ModuleId>,
    /// Run the roots as soon as they are registered. Hot payloads leave this
    /// off so the client runtime can require each root on its own.
    pub invoke_roots: bool,
    pub hmr: bool,
    /// Generated file name recorded in the source map
    pub file: String,
}

#[derive(Debug, Clone)]
struct ModuleRecord {
    fingerprint: Fingerprint,
    hmr: bool,
    code: String,
    imports: Vec<ModuleId>,
}

/// Graph-walking bundler with an incremental handle
pub struct BundlerEngine {
    root: PathBuf,
    resolver: Resolver,
    pipeline: Arc<TransformPipeline>,
    records: Mutex<HashMap<ModuleId, ModuleRecord>>,
    builds: AtomicU64,
}

impl std::fmt::Debug for BundlerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundlerEngine")
            .field("root", &self.root)
            .field("builds", &self.builds.load(Ordering::Relaxed))
            .finish()
    }
}

impl BundlerEngine {
    pub fn new(root: &Path, platform: Platform, pipeline: Arc<TransformPipeline>) -> Self {
        let resolver = Resolver::new(root, platform);
        Self {
            root: resolver.root().to_path_buf(),
            resolver,
            pipeline,
            records: Mutex::new(HashMap::new()),
            builds: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a previous build left module records to reuse
    pub fn has_handle(&self) -> bool {
        self.builds.load(Ordering::Relaxed) > 0
    }

    pub fn pipeline(&self) -> &Arc<TransformPipeline> {
        &self.pipeline
    }

    /// Resolve the configured entry file to a module id
    pub fn resolve_entry(&self, entry_file: &str) -> Result<ModuleId> {
        self.resolver.resolve_entry(entry_file).ok_or_else(|| {
            Error::build(Diagnostic::new(
                "resolver",
                format!("Could not resolve entry point '{}'", entry_file),
            ))
        })
    }

    pub async fn build(&self, request: &BuildRequest) -> Result<BuildArtifact> {
        self.resolver.clear_cache();

        let roots: BTreeSet<&ModuleId> = request.roots.iter().collect();
        let mut inputs: BTreeMap<ModuleId, Vec<ModuleId>> = BTreeMap::new();
        let mut outputs: HashMap<ModuleId, String> = HashMap::new();
        let mut level: Vec<ModuleId> = request.roots.clone();

        while !level.is_empty() {
            let mut to_load = Vec::new();
            for id in level.drain(..) {
                if inputs.contains_key(&id) || to_load.contains(&id) {
                    continue;
                }
                if request.stubs.contains(&id) && !roots.contains(&id) {
                    inputs.insert(id, Vec::new());
                    continue;
                }
                to_load.push(id);
            }

            let loaded =
                try_join_all(to_load.iter().map(|id| self.load_module(id, request.hmr))).await?;

            for (id, record) in to_load.into_iter().zip(loaded) {
                level.extend(record.imports.iter().cloned());
                inputs.insert(id.clone(), record.imports);
                outputs.insert(id, record.code);
            }
        }

        let mut emitter = Emitter::new(&request.file);
        for (id, code) in inputs.keys().filter_map(|id| outputs.get(id).map(|c| (id, c))) {
            if !roots.contains(id) {
                emitter.module(id, code, false)?;
            }
        }
        for id in &request.roots {
            if let Some(code) = outputs.get(id) {
                emitter.module(id, code, request.invoke_roots)?;
            }
        }
        let (code, map) = emitter.finish();

        self.builds.fetch_add(1, Ordering::Relaxed);
        debug!(
            modules = inputs.len(),
            emitted = outputs.len(),
            roots = request.roots.len(),
            "build finished"
        );
        Ok(BuildArtifact { code, map, inputs })
    }

    async fn load_module(&self, id: &ModuleId, hmr: bool) -> Result<ModuleRecord> {
        let raw = tokio::fs::read(id.to_path(&self.root)).await.map_err(|e| {
            Error::build(
                Diagnostic::new("bundler", format!("Could not read file: {}", e)).with_file(id.as_str()),
            )
        })?;
        let fingerprint = Fingerprint::of(&raw);

        if let Some(record) = self.cached_record(id, &fingerprint, hmr) {
            trace!(module = %id, "reusing module record");
            return Ok(record);
        }

        let data = self.pipeline.transform(id, &raw, hmr).await?;
        let refs = scan_imports(&data.code);

        let mut resolved = Vec::with_capacity(refs.len());
        let mut failures = Vec::new();
        for r in &refs {
            match self.resolver.resolve(&r.specifier, id) {
                Some(target) => resolved.push(target),
                None => failures.push(
                    Diagnostic::new("resolver", format!("Could not resolve \"{}\"", r.specifier))
                        .with_file(id.as_str())
                        .at(SourceLocation::from_offset(&data.code, r.start), &data.code),
                ),
            }
        }
        if !failures.is_empty() {
            return Err(Error::Build(Diagnostics(failures)));
        }

        let mut targets = resolved.iter();
        let code = rewrite_specifiers(&data.code, &refs, |_| {
            targets.next().map(|t| t.to_string()).unwrap_or_default()
        });

        let mut imports: Vec<ModuleId> = Vec::new();
        for target in resolved {
            if !imports.contains(&target) {
                imports.push(target);
            }
        }

        let record = ModuleRecord {
            fingerprint,
            hmr,
            code,
            imports,
        };
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), record.clone());
        Ok(record)
    }

    fn cached_record(&self, id: &ModuleId, fingerprint: &Fingerprint, hmr: bool) -> Option<ModuleRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .get(id)
            .filter(|r| r.fingerprint == *fingerprint && r.hmr == hmr)
            .cloned()
    }
}
