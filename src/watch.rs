//! Filesystem watch bridge
//!
//! Wraps a recursive `notify` watch of the project root. Raw events are
//! coalesced until the tree has been quiet for the debounce window, then
//! published as one batch of normalized, deduplicated [`ModuleId`]s to every
//! subscriber.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::module_id::ModuleId;

/// One coalesced set of changed modules
pub type ChangeBatch = Arc<Vec<ModuleId>>;

/// Directories whose contents never trigger rebuilds
const ALWAYS_IGNORED: [&str; 2] = [".git", "node_modules/.cache"];

/// Batches published before slow subscribers start missing them
const BATCH_BACKLOG: usize = 64;

/// Project-root watcher publishing change batches
pub struct WatchBridge {
    _watcher: RecommendedWatcher,
    sender: broadcast::Sender<ChangeBatch>,
    coalescer: JoinHandle<()>,
}

impl std::fmt::Debug for WatchBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchBridge")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// Turns absolute event paths into module ids
#[derive(Debug, Clone)]
struct PathNormalizer {
    roots: Vec<PathBuf>,
    ignored: Vec<PathBuf>,
}

impl PathNormalizer {
    fn new(root: &Path, ignored: &[PathBuf]) -> Self {
        let mut roots = vec![root.to_path_buf()];
        if let Ok(canonical) = root.canonicalize() {
            if canonical != root {
                roots.push(canonical);
            }
        }
        let ignored = ignored
            .iter()
            .cloned()
            .chain(ALWAYS_IGNORED.iter().map(PathBuf::from))
            .collect();
        Self { roots, ignored }
    }

    fn normalize(&self, path: &Path) -> Option<ModuleId> {
        if path.is_dir() {
            return None;
        }
        let id = self.roots.iter().find_map(|root| ModuleId::from_path(root, path))?;
        let relative = Path::new(id.as_str());
        if self.ignored.iter().any(|ignored| relative.starts_with(ignored)) {
            return None;
        }
        Some(id)
    }

    /// Normalize a batch of raw paths, keeping first-seen order
    fn batch(&self, paths: impl IntoIterator<Item = PathBuf>) -> Vec<ModuleId> {
        let mut batch: Vec<ModuleId> = Vec::new();
        for path in paths {
            if let Some(id) = self.normalize(&path) {
                if !batch.contains(&id) {
                    batch.push(id);
                }
            }
        }
        batch
    }
}

impl WatchBridge {
    /// Watch `root` recursively. Paths under any of `ignored` (relative to
    /// `root`) are dropped.
    pub fn start(root: &Path, ignored: &[PathBuf], debounce: Duration) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();
        let (sender, _) = broadcast::channel(BATCH_BACKLOG);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if is_change(&event.kind) {
                    let _ = raw_tx.send(event.paths);
                }
            }
            Err(e) => warn!(error = %e, "file watch error"),
        })
        .map_err(|e| Error::internal(format!("failed to create watcher: {}", e)))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| Error::internal(format!("failed to watch {}: {}", root.display(), e)))?;

        let normalizer = PathNormalizer::new(root, ignored);
        let coalescer = tokio::spawn(coalesce(raw_rx, sender.clone(), normalizer, debounce));
        debug!(root = %root.display(), "watching project");

        Ok(Self {
            _watcher: watcher,
            sender,
            coalescer,
        })
    }

    /// Receive every batch published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.sender.subscribe()
    }
}

impl Drop for WatchBridge {
    fn drop(&mut self) {
        self.coalescer.abort();
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

async fn coalesce(
    mut raw_rx: mpsc::UnboundedReceiver<Vec<PathBuf>>,
    sender: broadcast::Sender<ChangeBatch>,
    normalizer: PathNormalizer,
    debounce: Duration,
) {
    while let Some(first) = raw_rx.recv().await {
        let mut paths = first;
        // Keep extending the batch until the tree is quiet
        loop {
            match tokio::time::timeout(debounce, raw_rx.recv()).await {
                Ok(Some(more)) => paths.extend(more),
                Ok(None) => break,
                Err(_) => break,
            }
        }

        let batch = normalizer.batch(paths);
        if batch.is_empty() {
            continue;
        }
        trace!(modules = ?batch, "publishing change batch");
        // No subscribers is fine: nobody holds a bundle yet
        let _ = sender.send(Arc::new(batch));
    }
}
