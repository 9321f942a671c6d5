//! Shared helpers for integration tests

use livebundle::transform::{StageFilter, TransformData, CACHE_NAME};
use livebundle::{DevConfig, ModuleId, OrchestratorRegistry, PersistentCache, TransformStage};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// A small app: the entry renders a screen, the screen renders a leaf
/// component and uses a helper
pub const APP: &[(&str, &str)] = &[
    ("index.js", "import App from './src/App';\nregister(App);\n"),
    (
        "src/App.jsx",
        "import Leaf from './Leaf';\nimport { label } from './util';\nexport default function App() { return Leaf(label); }\n",
    ),
    ("src/Leaf.tsx", "export default function Leaf() { return 'leaf'; }\n"),
    ("src/util.js", "import config from './config.json';\nexport const label = config.label;\n"),
    ("src/config.json", "{ \"label\": \"hello\" }\n"),
];

/// Scratch project on disk
pub struct Project {
    dir: TempDir,
}

#[allow(dead_code)]
impl Project {
    pub fn new(files: &[(&str, &str)]) -> Self {
        let project = Self {
            dir: TempDir::new().unwrap(),
        };
        for (path, content) in files {
            project.write(path, content);
        }
        project
    }

    pub fn app() -> Self {
        Self::new(APP)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, path: &str, content: &str) {
        let full = self.dir.path().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, content).unwrap();
    }

    pub fn cache(&self) -> Arc<PersistentCache<TransformData>> {
        Arc::new(PersistentCache::open(
            &self.root().join(DevConfig::default().cache_dir),
            CACHE_NAME,
        ))
    }

    /// Registry with the built-in JSON stage only
    pub fn registry(&self) -> Arc<OrchestratorRegistry> {
        self.registry_with(self.cache(), vec![livebundle::JsonModuleStage::stage()])
    }

    pub fn registry_with(
        &self,
        cache: Arc<PersistentCache<TransformData>>,
        stages: Vec<TransformStage>,
    ) -> Arc<OrchestratorRegistry> {
        let config = DevConfig {
            watch_debounce_ms: 20,
            ..DevConfig::default()
        };
        Arc::new(OrchestratorRegistry::new(self.root(), config, cache, stages, None))
    }
}

/// A pass-through stage for script files that counts its calls
#[allow(dead_code)]
pub fn counting_stage() -> (TransformStage, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let stage = TransformStage::from_fn(
        "count",
        StageFilter::loaders(&["js", "jsx", "ts", "tsx"]),
        move |data: TransformData| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(data)
        },
    );
    (stage, calls)
}

#[allow(dead_code)]
pub fn ids(list: &[&str]) -> Vec<ModuleId> {
    list.iter().map(|s| ModuleId::from(*s)).collect()
}
