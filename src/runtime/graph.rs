//! Client-side module graph

use std::collections::{BTreeMap, BTreeSet};

use crate::module_id::ModuleId;

/// Imports per module plus the inverted importer view.
///
/// Updates merge additively: an id present in a delta replaces that id's
/// import list, ids absent from it are left alone.
#[derive(Debug, Clone, Default)]
pub struct ModuleGraph {
    imports: BTreeMap<ModuleId, BTreeSet<ModuleId>>,
    importers: BTreeMap<ModuleId, BTreeSet<ModuleId>>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a graph delta and keep the inverted view in step
    pub fn update<'a, I>(&mut self, delta: I)
    where
        I: IntoIterator<Item = (&'a ModuleId, &'a Vec<ModuleId>)>,
    {
        for (id, imports) in delta {
            if let Some(previous) = self.imports.remove(id) {
                for dep in &previous {
                    if let Some(set) = self.importers.get_mut(dep) {
                        set.remove(id);
                        if set.is_empty() {
                            self.importers.remove(dep);
                        }
                    }
                }
            }
            for dep in imports {
                self.importers.entry(dep.clone()).or_default().insert(id.clone());
            }
            self.imports.insert(id.clone(), imports.iter().cloned().collect());
        }
    }

    pub fn imports(&self, id: &ModuleId) -> impl Iterator<Item = &ModuleId> {
        self.imports.get(id).into_iter().flatten()
    }

    pub fn importers(&self, id: &ModuleId) -> impl Iterator<Item = &ModuleId> {
        self.importers.get(id).into_iter().flatten()
    }

    pub fn has_importers(&self, id: &ModuleId) -> bool {
        self.importers.get(id).is_some_and(|set| !set.is_empty())
    }

    pub fn contains(&self, id: &ModuleId) -> bool {
        self.imports.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.imports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.imports.is_empty()
    }
}
