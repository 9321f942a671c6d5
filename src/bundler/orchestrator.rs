//! Full-bundle and hot-payload builds for one (platform, entry) pair
//!
//! A full bundle is streamed in a fixed order:
//!
//! 1. `globalThis.$LIVE_SOCKET_URL = '...';`
//! 2. the client runtime banner
//! 3. `globalThis.$UPDATE_MODULE_GRAPH({...});` for the whole build
//! 4. the application code, registering its modules through the runtime
//!
//! Hot payloads contain the graph delta for the modules new to the client,
//! followed by their code; modules the client already holds are stubbed out.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, Level};

use super::emit::{module_graph_statement, override_cjs_helper};
use super::engine::{BuildArtifact, BuildRequest, BundlerEngine};
use crate::cache::PersistentCache;
use crate::config::{BundleTarget, DevConfig, Platform};
use crate::error::Result;
use crate::module_id::ModuleId;
use crate::runtime::BANNER;
use crate::session::ClientKnownModules;
use crate::source_map::SourceMap;
use crate::transform::{TransformData, TransformPipeline, TransformStage, WorkerPool};

/// Streamed in place of the bundle when a full build fails
pub const BUILD_FAILED_STATEMENT: &str =
    "throw new Error('\\n\\nBuild failed, check your terminal');\n";

/// File name of full-build output inside a session namespace
const BUNDLE_FILE: &str = "index.bundle.js";

/// File name of the most recent hot payload, written at debug verbosity
const LATEST_HMR_FILE: &str = "latest-hmr.js";

/// Code and map for one hot update
#[derive(Debug, Clone)]
pub struct HmrPayload {
    pub modules_to_hot_replace: Vec<ModuleId>,
    /// Every module whose code the payload carries, added to the client's
    /// known set when the payload was built
    pub shipped: BTreeSet<ModuleId>,
    pub code: String,
    pub map: SourceMap,
}

/// Owns the bundler engine configured for one [`BundleTarget`]
#[derive(Debug)]
pub struct BuildOrchestrator {
    target: BundleTarget,
    engine: BundlerEngine,
    cache_dir: PathBuf,
}

impl BuildOrchestrator {
    pub fn new(root: &Path, cache_dir: &Path, target: BundleTarget, pipeline: Arc<TransformPipeline>) -> Self {
        Self {
            engine: BundlerEngine::new(root, target.platform, pipeline),
            cache_dir: cache_dir.to_path_buf(),
            target,
        }
    }

    pub fn target(&self) -> &BundleTarget {
        &self.target
    }

    pub fn engine(&self) -> &BundlerEngine {
        &self.engine
    }

    /// Isolated full-build output directory for one client
    pub fn output_dir(&self, namespace: &str) -> PathBuf {
        self.cache_dir.join(self.target.platform.as_str()).join(namespace)
    }

    /// Build the whole app and stream it to `output`.
    ///
    /// `known` is emptied first and, on success, holds exactly the build's
    /// inputs. On failure the stream ends with a throwing statement and the
    /// error is returned.
    pub async fn build_full_bundle<W>(
        &self,
        socket_url: &str,
        namespace: &str,
        known: &mut ClientKnownModules,
        output: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        known.clear();

        let artifact = match self.full_build(namespace).await {
            Ok(artifact) => artifact,
            Err(e) => {
                output.write_all(BUILD_FAILED_STATEMENT.as_bytes()).await?;
                output.flush().await?;
                return Err(e);
            }
        };

        let preamble = format!("globalThis.$LIVE_SOCKET_URL = '{}';\n", socket_url);
        output.write_all(preamble.as_bytes()).await?;
        output.write_all(BANNER.as_bytes()).await?;
        if !BANNER.ends_with('\n') {
            output.write_all(b"\n").await?;
        }
        output
            .write_all(module_graph_statement(&artifact.inputs, None)?.as_bytes())
            .await?;

        let mut bundle = tokio::fs::File::open(self.output_dir(namespace).join(BUNDLE_FILE)).await?;
        tokio::io::copy(&mut bundle, output).await?;
        output.flush().await?;

        known.replace(artifact.inputs.into_keys());
        Ok(())
    }

    /// Run the engine from the entry point and write the rewritten output
    /// and its map into the client's namespace
    async fn full_build(&self, namespace: &str) -> Result<BuildArtifact> {
        let started = Instant::now();
        let cold = !self.engine.has_handle();
        let entry = self.engine.resolve_entry(&self.target.entry_file)?;

        let artifact = self
            .engine
            .build(&BuildRequest {
                roots: vec![entry],
                stubs: BTreeSet::new(),
                invoke_roots: true,
                hmr: true,
                file: BUNDLE_FILE.to_string(),
            })
            .await?;

        let code = override_cjs_helper(&artifact.code);
        let header_lines = 2 + BANNER.lines().count();
        let map = artifact.map.clone().offset_lines(header_lines);

        let dir = self.output_dir(namespace);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(BUNDLE_FILE), code).await?;
        tokio::fs::write(dir.join(format!("{}.map", BUNDLE_FILE)), map.to_json()?).await?;

        info!(
            platform = %self.target.platform,
            modules = artifact.inputs.len(),
            cold,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "full bundle built"
        );
        Ok(artifact)
    }

    /// Build the hot payload for a change batch.
    ///
    /// Returns `None` when the client holds none of the changed modules.
    /// Every changed id leaves `known` either way; modules shipped in the
    /// payload are added back. On failure `known` is restored exactly.
    pub async fn build_hmr_payload(
        &self,
        known: &mut ClientKnownModules,
        changed: &[ModuleId],
    ) -> Result<Option<HmrPayload>> {
        let snapshot = known.snapshot();
        let modules_to_hot_replace = known.begin_hmr(changed);
        if modules_to_hot_replace.is_empty() {
            debug!(changed = changed.len(), "no changed module is known to the client");
            return Ok(None);
        }

        match self.hmr_build(known, modules_to_hot_replace).await {
            Ok(payload) => Ok(Some(payload)),
            Err(e) => {
                known.restore(snapshot);
                Err(e)
            }
        }
    }

    async fn hmr_build(
        &self,
        known: &mut ClientKnownModules,
        modules_to_hot_replace: Vec<ModuleId>,
    ) -> Result<HmrPayload> {
        let started = Instant::now();
        let artifact = self
            .engine
            .build(&BuildRequest {
                roots: modules_to_hot_replace.clone(),
                stubs: known.snapshot(),
                invoke_roots: false,
                hmr: true,
                file: "<hmr-payload>".to_string(),
            })
            .await?;

        let in_payload: BTreeSet<ModuleId> = artifact
            .inputs
            .keys()
            .filter(|id| !known.contains(id))
            .cloned()
            .collect();

        let graph = module_graph_statement(&artifact.inputs, Some(&in_payload))?;
        let code = format!("{}{}", graph, override_cjs_helper(&artifact.code));
        let map = artifact.map.offset_lines(graph.lines().count());

        info!(
            modules = ?modules_to_hot_replace.iter().map(ModuleId::as_str).collect::<Vec<_>>(),
            shipped = in_payload.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "hot update built"
        );

        if tracing::enabled!(Level::DEBUG) {
            let path = self.cache_dir.join(LATEST_HMR_FILE);
            if let Err(e) = tokio::fs::create_dir_all(&self.cache_dir).await {
                debug!(error = %e, "could not create cache dir for debug payload");
            } else if let Err(e) = tokio::fs::write(&path, &code).await {
                debug!(path = %path.display(), error = %e, "could not write debug payload");
            }
        }

        known.record(in_payload.iter().cloned());
        Ok(HmrPayload {
            modules_to_hot_replace,
            shipped: in_payload,
            code,
            map,
        })
    }
}

/// Lazily created orchestrators, one per [`BundleTarget`], sharing one
/// transform cache and worker pool
pub struct OrchestratorRegistry {
    root: PathBuf,
    config: DevConfig,
    cache: Arc<PersistentCache<TransformData>>,
    stages: Vec<TransformStage>,
    pool: Option<Arc<WorkerPool>>,
    orchestrators: Mutex<HashMap<BundleTarget, Arc<BuildOrchestrator>>>,
}

impl std::fmt::Debug for OrchestratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorRegistry")
            .field("root", &self.root)
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl OrchestratorRegistry {
    pub fn new(
        root: &Path,
        config: DevConfig,
        cache: Arc<PersistentCache<TransformData>>,
        stages: Vec<TransformStage>,
        pool: Option<Arc<WorkerPool>>,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            cache,
            stages,
            pool,
            orchestrators: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &DevConfig {
        &self.config
    }

    /// Absolute cache directory
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(&self.config.cache_dir)
    }

    pub fn cache(&self) -> &Arc<PersistentCache<TransformData>> {
        &self.cache
    }

    /// The orchestrator for `platform`, created on first use
    pub fn get(&self, platform: Platform) -> Arc<BuildOrchestrator> {
        let target = BundleTarget::new(&self.config, platform);
        let mut orchestrators = self.orchestrators.lock().unwrap_or_else(PoisonError::into_inner);
        orchestrators
            .entry(target.clone())
            .or_insert_with(|| {
                debug!(platform = %platform, entry = %target.entry_file, "creating build orchestrator");
                let mut pipeline =
                    TransformPipeline::new(self.stages.clone(), Arc::clone(&self.cache), target.js_target);
                if let Some(ref pool) = self.pool {
                    pipeline = pipeline.with_pool(Arc::clone(pool));
                }
                Arc::new(BuildOrchestrator::new(
                    &self.root,
                    &self.cache_dir(),
                    target,
                    Arc::new(pipeline),
                ))
            })
            .clone()
    }

    /// Write the transform cache to disk
    pub fn persist_cache(&self) -> Result<()> {
        self.cache.persist()
    }
}
