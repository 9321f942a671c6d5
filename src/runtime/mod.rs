//! Client runtime
//!
//! The module registry and refresh resolver that live on the device. Every
//! bundle ships the script form ([`BANNER`]); [`ClientRuntime`] is the same
//! algorithm over Rust closures, so hosts and tests can drive patches
//! without a script engine.
//!
//! A patch is applied in three steps:
//!
//! 1. merge the graph delta, then drop cached exports of every id in it
//! 2. install the new factories and re-run each replaced module
//! 3. walk importers from each replaced module up to the nearest refresh
//!    boundaries; if every walk finds one, re-run the walked modules and
//!    repaint once, otherwise ask the host for a full reload

pub mod exports;
pub mod global;
pub mod graph;
pub mod refresh;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::module_id::ModuleId;

pub use exports::{ExportEntry, ExportValue, Exports};
pub use graph::ModuleGraph;
pub use refresh::{is_refresh_boundary, ComponentCheck, LikelyComponentCheck, NoopHost, RefreshHost};

/// Script form of the runtime, prepended to every served bundle
pub const BANNER: &str = include_str!("require.runtime.js");

/// Failures inside the registry
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuntimeError {
    #[error("Module {0} not found in run cache")]
    NotFound(ModuleId),

    #[error("Module {id} threw: {message}")]
    Thrown { id: ModuleId, message: String },

    #[error("no client runtime installed on this thread")]
    NotInstalled,
}

impl RuntimeError {
    pub fn thrown(id: &ModuleId, message: impl Into<String>) -> Self {
        RuntimeError::Thrown {
            id: id.clone(),
            message: message.into(),
        }
    }
}

/// A module body. Runs with the module's scope, at most once per
/// evaluation.
pub type Factory = Rc<dyn Fn(&ModuleScope<'_>) -> Result<(), RuntimeError>>;

/// What a running module sees: its own exports and `require`
pub struct ModuleScope<'a> {
    runtime: &'a ClientRuntime,
    id: ModuleId,
    exports: Exports,
}

impl ModuleScope<'_> {
    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    pub fn require(&self, id: &str) -> Result<Exports, RuntimeError> {
        self.runtime.require(&ModuleId::from(id))
    }

    /// `exports.key = value`
    pub fn export(&self, key: &str, value: ExportValue) {
        self.exports.borrow_mut().set(key, value);
    }

    /// `module.exports = value`
    pub fn set_exports(&self, value: ExportValue) {
        *self.exports.borrow_mut() = value;
    }

    pub fn exports(&self) -> Exports {
        Rc::clone(&self.exports)
    }

    /// A failure to return from the factory
    pub fn throw(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::thrown(&self.id, message)
    }
}

/// A hot update as the device receives it
#[derive(Clone, Default)]
pub struct Patch {
    pub graph: BTreeMap<ModuleId, Vec<ModuleId>>,
    pub factories: Vec<(ModuleId, Factory)>,
    pub modules_to_hot_replace: Vec<ModuleId>,
}

impl fmt::Debug for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Patch")
            .field("graph", &self.graph)
            .field("factories", &self.factories.iter().map(|(id, _)| id).collect::<Vec<_>>())
            .field("modules_to_hot_replace", &self.modules_to_hot_replace)
            .finish()
    }
}

/// How a patch landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    HotSwapped {
        boundaries: BTreeSet<ModuleId>,
        rerun: BTreeSet<ModuleId>,
    },
    FullReload,
}

#[derive(Default)]
struct RegistryState {
    run_cache: HashMap<ModuleId, Factory>,
    result_cache: HashMap<ModuleId, Exports>,
    graph: ModuleGraph,
    entry: Option<ModuleId>,
}

/// Boundary search state for one patch
#[derive(Default)]
struct BoundaryWalk {
    visited: BTreeSet<ModuleId>,
    boundaries: BTreeSet<ModuleId>,
}

/// Module registry, graph and refresh resolver for one device
pub struct ClientRuntime {
    state: RefCell<RegistryState>,
    check: Box<dyn ComponentCheck>,
    host: Box<dyn RefreshHost>,
}

impl fmt::Debug for ClientRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("ClientRuntime")
            .field("factories", &state.run_cache.len())
            .field("evaluated", &state.result_cache.len())
            .field("graph", &state.graph.len())
            .field("entry", &state.entry)
            .finish()
    }
}

impl ClientRuntime {
    pub fn new(host: impl RefreshHost + 'static) -> Self {
        Self {
            state: RefCell::new(RegistryState::default()),
            check: Box::new(LikelyComponentCheck),
            host: Box::new(host),
        }
    }

    pub fn with_component_check(mut self, check: impl ComponentCheck + 'static) -> Self {
        self.check = Box::new(check);
        self
    }

    /// Mark the application entry; it is never treated as a boundary
    pub fn set_entry(&self, id: &ModuleId) {
        self.state.borrow_mut().entry = Some(id.clone());
    }

    /// Install or replace a module body without running it
    pub fn register_factory(&self, id: &ModuleId, factory: Factory) {
        self.state.borrow_mut().run_cache.insert(id.clone(), factory);
    }

    pub fn has_factory(&self, id: &ModuleId) -> bool {
        self.state.borrow().run_cache.contains_key(id)
    }

    /// Cached exports, without evaluating
    pub fn cached_exports(&self, id: &ModuleId) -> Option<Exports> {
        self.state.borrow().result_cache.get(id).cloned()
    }

    pub fn importers(&self, id: &ModuleId) -> Vec<ModuleId> {
        self.state.borrow().graph.importers(id).cloned().collect()
    }

    /// Evaluate a module once and return its exports.
    ///
    /// The exports are cached before the body runs, so a circular require
    /// sees them partially filled. A body that fails is uncached again.
    pub fn require(&self, id: &ModuleId) -> Result<Exports, RuntimeError> {
        let factory = {
            let state = self.state.borrow();
            if let Some(exports) = state.result_cache.get(id) {
                return Ok(Rc::clone(exports));
            }
            match state.run_cache.get(id) {
                Some(factory) => Rc::clone(factory),
                None => return Err(RuntimeError::NotFound(id.clone())),
            }
        };

        let exports: Exports = Rc::new(RefCell::new(ExportValue::empty_object()));
        self.state
            .borrow_mut()
            .result_cache
            .insert(id.clone(), Rc::clone(&exports));

        let scope = ModuleScope {
            runtime: self,
            id: id.clone(),
            exports: Rc::clone(&exports),
        };
        if let Err(e) = factory(&scope) {
            self.state.borrow_mut().result_cache.remove(id);
            return Err(e);
        }

        if !id.is_third_party() {
            self.register_exports(id, &exports.borrow());
        }
        Ok(exports)
    }

    fn register_exports(&self, id: &ModuleId, exports: &ExportValue) {
        self.host.register(exports, &format!("{} %exports%", id));
        for entry in exports.plain_entries() {
            self.host.register(&entry.value, &format!("{}%exports%{}", id, entry.key));
        }
    }

    /// Merge a graph delta, then drop the cached exports of every id in it
    pub fn update_module_graph(&self, delta: &BTreeMap<ModuleId, Vec<ModuleId>>) {
        let mut state = self.state.borrow_mut();
        state.graph.update(delta);
        for id in delta.keys() {
            state.result_cache.remove(id);
        }
    }

    /// Apply one hot update end to end
    pub fn apply_patch(&self, patch: Patch) -> RefreshOutcome {
        self.update_module_graph(&patch.graph);
        for (id, factory) in patch.factories {
            self.register_factory(&id, factory);
        }
        for id in &patch.modules_to_hot_replace {
            if let Err(e) = self.require(id) {
                error!(module = %id, error = %e, "replaced module failed to evaluate");
            }
        }
        self.perform_refresh(&patch.modules_to_hot_replace)
    }

    /// Resolve the replaced modules to refresh boundaries and repaint, or
    /// fall back to a full reload
    pub fn perform_refresh(&self, modules_to_hot_replace: &[ModuleId]) -> RefreshOutcome {
        let mut walk = BoundaryWalk::default();
        let mut can_refresh = true;
        for id in modules_to_hot_replace {
            if !self.has_factory(id) {
                error!(module = %id, "replaced module has no factory, the module graph is out of sync");
                can_refresh = false;
                continue;
            }
            can_refresh &= self.find_refresh_boundaries(id, &mut walk);
        }
        if walk.boundaries.is_empty() {
            can_refresh = false;
        }

        if !can_refresh {
            warn!(modules = ?modules_to_hot_replace, "Full refresh needed");
            self.host.full_reload("update reached the entry point without a refresh boundary");
            return RefreshOutcome::FullReload;
        }

        info!(rerun = walk.visited.len(), boundaries = ?walk.boundaries, "refreshing");
        {
            let mut state = self.state.borrow_mut();
            for id in &walk.visited {
                state.result_cache.remove(id);
            }
        }
        for boundary in &walk.boundaries {
            if let Err(e) = self.require(boundary) {
                error!(module = %boundary, error = %e, "refresh boundary failed to re-evaluate");
            }
        }
        self.host.perform_refresh();

        RefreshOutcome::HotSwapped {
            boundaries: walk.boundaries,
            rerun: walk.visited,
        }
    }

    fn find_refresh_boundaries(&self, id: &ModuleId, walk: &mut BoundaryWalk) -> bool {
        // Revisits inside a cycle do not fail the path
        if !walk.visited.insert(id.clone()) {
            return true;
        }

        let (is_entry, exports, importers) = {
            let state = self.state.borrow();
            (
                state.entry.as_ref() == Some(id),
                state.result_cache.get(id).cloned(),
                state.graph.importers(id).cloned().collect::<Vec<_>>(),
            )
        };

        if !is_entry {
            if let Some(exports) = exports {
                if is_refresh_boundary(&exports.borrow(), self.check.as_ref()) {
                    debug!(module = %id, "refresh boundary");
                    walk.boundaries.insert(id.clone());
                    return true;
                }
            }
        }

        debug!(module = %id, importers = ?importers, "not a refresh boundary");
        if importers.is_empty() {
            return false;
        }
        importers
            .iter()
            .all(|importer| self.find_refresh_boundaries(importer, walk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Records every host call
    #[derive(Default)]
    struct RecordingHost {
        registered: RefCell<Vec<String>>,
        refreshes: Cell<usize>,
        reloads: Cell<usize>,
    }

    impl RefreshHost for Rc<RecordingHost> {
        fn register(&self, _value: &ExportValue, family: &str) {
            self.registered.borrow_mut().push(family.to_string());
        }

        fn perform_refresh(&self) {
            self.refreshes.set(self.refreshes.get() + 1);
        }

        fn full_reload(&self, _reason: &str) {
            self.reloads.set(self.reloads.get() + 1);
        }
    }

    fn id(s: &str) -> ModuleId {
        ModuleId::from(s)
    }

    fn component(name: &'static str) -> Factory {
        Rc::new(move |scope: &ModuleScope<'_>| {
            scope.set_exports(ExportValue::function(name));
            Ok(())
        })
    }

    /// A module that requires `deps` and exports plain data
    fn plain(deps: &'static [&'static str]) -> Factory {
        Rc::new(move |scope: &ModuleScope<'_>| {
            for dep in deps {
                scope.require(dep)?;
            }
            scope.export("value", ExportValue::data(1));
            Ok(())
        })
    }

    /// index.js → a.js → b.js → c.js with C, then B, as components
    fn chain(host: &Rc<RecordingHost>) -> ClientRuntime {
        let runtime = ClientRuntime::new(Rc::clone(host));
        let mut graph = BTreeMap::new();
        graph.insert(id("index.js"), vec![id("a.js")]);
        graph.insert(id("a.js"), vec![id("b.js")]);
        graph.insert(id("b.js"), vec![id("c.js")]);
        graph.insert(id("c.js"), vec![]);
        runtime.update_module_graph(&graph);

        runtime.register_factory(&id("index.js"), plain(&["a.js"]));
        runtime.register_factory(&id("a.js"), plain(&["b.js"]));
        runtime.register_factory(&id("b.js"), plain(&["c.js"]));
        runtime.register_factory(&id("c.js"), component("C"));
        runtime.set_entry(&id("index.js"));
        runtime.require(&id("index.js")).unwrap();
        runtime
    }

    /// What the server ships for one replaced module: its graph entry and body
    fn patch(replace: &str, deps: &[&str], factory: Factory) -> Patch {
        Patch {
            graph: BTreeMap::from([(id(replace), deps.iter().map(|d| id(d)).collect())]),
            factories: vec![(id(replace), factory)],
            modules_to_hot_replace: vec![id(replace)],
        }
    }

    fn set(ids: &[&str]) -> BTreeSet<ModuleId> {
        ids.iter().map(|s| id(s)).collect()
    }

    #[test]
    fn test_component_leaf_is_its_own_boundary() {
        let host = Rc::new(RecordingHost::default());
        let runtime = chain(&host);

        let outcome = runtime.apply_patch(patch("c.js", &[], component("C")));
        assert_eq!(
            outcome,
            RefreshOutcome::HotSwapped {
                boundaries: set(&["c.js"]),
                rerun: set(&["c.js"]),
            }
        );
        assert_eq!(host.refreshes.get(), 1);
        assert_eq!(host.reloads.get(), 0);
    }

    #[test]
    fn test_walk_stops_at_component_importer() {
        let host = Rc::new(RecordingHost::default());
        let runtime = chain(&host);
        // B becomes a component, C stops being one
        runtime.register_factory(
            &id("b.js"),
            Rc::new(|scope: &ModuleScope<'_>| {
                scope.require("c.js")?;
                scope.set_exports(ExportValue::function("B"));
                Ok(())
            }),
        );
        runtime.update_module_graph(&BTreeMap::from([(id("b.js"), vec![id("c.js")])]));
        runtime.require(&id("b.js")).unwrap();

        let outcome = runtime.apply_patch(patch("c.js", &[], plain(&[])));
        assert_eq!(
            outcome,
            RefreshOutcome::HotSwapped {
                boundaries: set(&["b.js"]),
                rerun: set(&["b.js", "c.js"]),
            }
        );
        assert_eq!(host.refreshes.get(), 1);
    }

    #[test]
    fn test_no_boundary_forces_full_reload() {
        let host = Rc::new(RecordingHost::default());
        let runtime = chain(&host);

        let outcome = runtime.apply_patch(patch("c.js", &[], plain(&[])));
        assert_eq!(outcome, RefreshOutcome::FullReload);
        assert_eq!(host.reloads.get(), 1);
        assert_eq!(host.refreshes.get(), 0);
    }

    #[test]
    fn test_entry_is_never_a_boundary() {
        let host = Rc::new(RecordingHost::default());
        let runtime = ClientRuntime::new(Rc::clone(&host));
        runtime.update_module_graph(&BTreeMap::from([(id("index.js"), vec![])]));
        runtime.register_factory(&id("index.js"), component("App"));
        runtime.set_entry(&id("index.js"));
        runtime.require(&id("index.js")).unwrap();

        let outcome = runtime.apply_patch(patch("index.js", &[], component("App")));
        assert_eq!(outcome, RefreshOutcome::FullReload);
    }

    #[test]
    fn test_missing_factory_forces_full_reload() {
        let host = Rc::new(RecordingHost::default());
        let runtime = chain(&host);
        let outcome = runtime.perform_refresh(&[id("ghost.js")]);
        assert_eq!(outcome, RefreshOutcome::FullReload);
    }

    #[test]
    fn test_circular_require_sees_partial_exports() {
        let host = Rc::new(RecordingHost::default());
        let runtime = ClientRuntime::new(Rc::clone(&host));
        let seen = Rc::new(RefCell::new(None));

        runtime.register_factory(
            &id("a.js"),
            Rc::new(|scope: &ModuleScope<'_>| {
                scope.export("early", ExportValue::data("yes"));
                scope.require("b.js")?;
                scope.export("late", ExportValue::data("yes"));
                Ok(())
            }),
        );
        let seen_in_b = Rc::clone(&seen);
        runtime.register_factory(
            &id("b.js"),
            Rc::new(move |scope: &ModuleScope<'_>| {
                let a = scope.require("a.js")?;
                *seen_in_b.borrow_mut() = Some(a.borrow().clone());
                Ok(())
            }),
        );

        let a = runtime.require(&id("a.js")).unwrap();
        let partial = seen.borrow().clone().unwrap();
        assert!(partial.get("early").is_some());
        assert!(partial.get("late").is_none());
        assert!(a.borrow().get("late").is_some());
    }

    #[test]
    fn test_factory_runs_once_and_failures_uncache() {
        let host = Rc::new(RecordingHost::default());
        let runtime = ClientRuntime::new(Rc::clone(&host));
        let runs = Rc::new(Cell::new(0));

        let counter = Rc::clone(&runs);
        runtime.register_factory(
            &id("flaky.js"),
            Rc::new(move |scope: &ModuleScope<'_>| {
                counter.set(counter.get() + 1);
                if counter.get() == 1 {
                    return Err(scope.throw("first run fails"));
                }
                Ok(())
            }),
        );

        assert!(runtime.require(&id("flaky.js")).is_err());
        assert!(runtime.cached_exports(&id("flaky.js")).is_none());
        runtime.require(&id("flaky.js")).unwrap();
        runtime.require(&id("flaky.js")).unwrap();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn test_third_party_modules_skip_registration() {
        let host = Rc::new(RecordingHost::default());
        let runtime = ClientRuntime::new(Rc::clone(&host));
        runtime.register_factory(&id("node_modules/lib/index.js"), component("Lib"));
        runtime.register_factory(&id("src/Leaf.tsx"), component("Leaf"));

        runtime.require(&id("node_modules/lib/index.js")).unwrap();
        assert!(host.registered.borrow().is_empty());

        runtime.require(&id("src/Leaf.tsx")).unwrap();
        assert_eq!(*host.registered.borrow(), vec!["src/Leaf.tsx %exports%".to_string()]);
    }

    #[test]
    fn test_graph_update_evicts_listed_modules() {
        let host = Rc::new(RecordingHost::default());
        let runtime = chain(&host);
        assert!(runtime.cached_exports(&id("b.js")).is_some());

        runtime.update_module_graph(&BTreeMap::from([(id("b.js"), vec![id("c.js")])]));
        assert!(runtime.cached_exports(&id("b.js")).is_none());
        assert!(runtime.cached_exports(&id("c.js")).is_some());
        assert_eq!(runtime.importers(&id("c.js")), vec![id("b.js")]);
    }

    #[test]
    fn test_cycle_with_boundary_refreshes() {
        let host = Rc::new(RecordingHost::default());
        let runtime = ClientRuntime::new(Rc::clone(&host));
        let mut graph = BTreeMap::new();
        graph.insert(id("index.js"), vec![id("Screen.js")]);
        graph.insert(id("Screen.js"), vec![id("util.js")]);
        graph.insert(id("util.js"), vec![id("helpers.js")]);
        graph.insert(id("helpers.js"), vec![id("util.js")]);
        runtime.update_module_graph(&graph);
        runtime.register_factory(&id("index.js"), plain(&["Screen.js"]));
        runtime.register_factory(
            &id("Screen.js"),
            Rc::new(|scope: &ModuleScope<'_>| {
                scope.require("util.js")?;
                scope.set_exports(ExportValue::function("Screen"));
                Ok(())
            }),
        );
        runtime.register_factory(&id("util.js"), plain(&["helpers.js"]));
        runtime.register_factory(&id("helpers.js"), plain(&["util.js"]));
        runtime.set_entry(&id("index.js"));
        runtime.require(&id("index.js")).unwrap();

        let outcome = runtime.apply_patch(patch("util.js", &["helpers.js"], plain(&["helpers.js"])));
        assert_eq!(
            outcome,
            RefreshOutcome::HotSwapped {
                boundaries: set(&["Screen.js"]),
                rerun: set(&["Screen.js", "helpers.js", "util.js"]),
            }
        );
    }
}
