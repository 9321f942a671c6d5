//! Thread-wide runtime slot
//!
//! Patch code does not hold a reference to the runtime; it reaches the one
//! installed on the current thread, the way bundled script reaches
//! `globalThis.$COMMONJS`, `$UPDATE_MODULE_GRAPH` and `$PERFORM_REFRESH`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use super::{ClientRuntime, Factory, Patch, RefreshOutcome, RuntimeError};
use crate::module_id::ModuleId;

thread_local! {
    static RUNTIME: RefCell<Option<Rc<ClientRuntime>>> = const { RefCell::new(None) };
}

/// Install `runtime` for this thread, returning the one it replaces
pub fn install(runtime: Rc<ClientRuntime>) -> Option<Rc<ClientRuntime>> {
    RUNTIME.with(|slot| slot.borrow_mut().replace(runtime))
}

pub fn uninstall() -> Option<Rc<ClientRuntime>> {
    RUNTIME.with(|slot| slot.borrow_mut().take())
}

pub fn installed() -> Option<Rc<ClientRuntime>> {
    RUNTIME.with(|slot| slot.borrow().clone())
}

/// Run `f` against the installed runtime. The slot is released before `f`
/// runs, so module bodies may use this module again.
pub fn with<R>(f: impl FnOnce(&ClientRuntime) -> R) -> Result<R, RuntimeError> {
    let runtime = installed().ok_or(RuntimeError::NotInstalled)?;
    Ok(f(&runtime))
}

/// `$COMMONJS`: register a module body
pub fn commonjs(id: &str, factory: Factory) -> Result<(), RuntimeError> {
    with(|runtime| runtime.register_factory(&ModuleId::from(id), factory))
}

/// `$UPDATE_MODULE_GRAPH`
pub fn update_module_graph(delta: &BTreeMap<ModuleId, Vec<ModuleId>>) -> Result<(), RuntimeError> {
    with(|runtime| runtime.update_module_graph(delta))
}

/// `$PERFORM_REFRESH`
pub fn perform_refresh(modules_to_hot_replace: &[ModuleId]) -> Result<RefreshOutcome, RuntimeError> {
    with(|runtime| runtime.perform_refresh(modules_to_hot_replace))
}

pub fn apply_patch(patch: Patch) -> Result<RefreshOutcome, RuntimeError> {
    with(|runtime| runtime.apply_patch(patch))
}
