//! Bundle code emission
//!
//! Every module is emitted as one registration call:
//!
//! ```js
//! __commonJS({"src/Leaf.tsx": function (exports, module, require) {
//! ...module code, line for line...
//! }});
//! ```
//!
//! The bundle opens with a small self-contained `__commonJS` helper. Bundles
//! served to a live client get that helper swapped for the runtime's registry
//! by [`override_cjs_helper`], which keeps the line count so source maps stay
//! valid.

use std::collections::{BTreeMap, BTreeSet};
use tracing::error;

use crate::error::Result;
use crate::module_id::ModuleId;
use crate::source_map::{SourceMap, SourceMapBuilder};

/// Standalone module registry emitted at the top of every build
pub const CJS_HELPER: &str = "\
var __modules = {}, __results = {}, __require = (id) => __results[id] ? __results[id].exports : (__results[id] = { exports: {} }, __modules[id](__results[id].exports, __results[id], __require), __results[id].exports);
var __commonJS = (cb) => { var id = Object.keys(cb)[0]; __modules[id] = cb[id]; return () => __require(id); };
";

/// What the helper becomes in bundles served to a live client
pub const LIVE_CJS_HELPER: &str = "var __commonJS = globalThis.$COMMONJS;";

/// Route module registration through the live registry.
///
/// Logs an error and returns the code untouched when the helper is missing.
pub fn override_cjs_helper(code: &str) -> String {
    match code.find(CJS_HELPER) {
        Some(start) => {
            let padding = "\n".repeat(CJS_HELPER.lines().count());
            let mut out = String::with_capacity(code.len());
            out.push_str(&code[..start]);
            out.push_str(LIVE_CJS_HELPER);
            out.push_str(&padding);
            out.push_str(&code[start + CJS_HELPER.len()..]);
            out
        }
        None => {
            error!("failed to replace the module registration helper, live updates will not work");
            code.to_string()
        }
    }
}

/// `globalThis.$UPDATE_MODULE_GRAPH({...});` for the inputs selected by `only`
pub fn module_graph_statement(
    inputs: &BTreeMap<ModuleId, Vec<ModuleId>>,
    only: Option<&BTreeSet<ModuleId>>,
) -> Result<String> {
    let selected: BTreeMap<&ModuleId, &Vec<ModuleId>> = inputs
        .iter()
        .filter(|(id, _)| only.map_or(true, |set| set.contains(*id)))
        .collect();
    Ok(format!(
        "globalThis.$UPDATE_MODULE_GRAPH({});\n",
        serde_json::to_string(&selected)?
    ))
}

/// Accumulates module registrations and their line mappings
#[derive(Debug)]
pub struct Emitter {
    code: String,
    line: u32,
    map: SourceMapBuilder,
}

impl Emitter {
    pub fn new(file: &str) -> Self {
        let mut map = SourceMapBuilder::new();
        map.set_file(file);
        Self {
            code: CJS_HELPER.to_string(),
            line: CJS_HELPER.lines().count() as u32,
            map,
        }
    }

    /// Emit one module. `invoke` runs it as soon as it is registered.
    pub fn module(&mut self, id: &ModuleId, code: &str, invoke: bool) -> Result<()> {
        let key = serde_json::to_string(id.as_str())?;
        self.code.push_str(&format!(
            "__commonJS({{{}: function (exports, module, require) {{\n",
            key
        ));
        self.line += 1;

        let source = self.map.add_source(id.as_str());
        for (original_line, text) in code.lines().enumerate() {
            self.map.add_line(self.line, source, original_line as u32);
            self.code.push_str(text);
            self.code.push('\n');
            self.line += 1;
        }

        self.code.push_str(if invoke { "}})();\n" } else { "}});\n" });
        self.line += 1;
        Ok(())
    }

    pub fn finish(self) -> (String, SourceMap) {
        (self.code, self.map.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_module_wrapping() {
        let mut emitter = Emitter::new("index.bundle");
        emitter.module(&"src/Leaf.tsx".into(), "module.exports = 1;", false).unwrap();
        emitter.module(&"index.js".into(), "require('src/Leaf.tsx');", true).unwrap();
        let (code, map) = emitter.finish();

        let body = code.strip_prefix(CJS_HELPER).unwrap();
        assert_eq!(
            body,
            "__commonJS({\"src/Leaf.tsx\": function (exports, module, require) {\n\
             module.exports = 1;\n\
             }});\n\
             __commonJS({\"index.js\": function (exports, module, require) {\n\
             require('src/Leaf.tsx');\n\
             }})();\n"
        );
        assert_eq!(map.sources, vec!["src/Leaf.tsx", "index.js"]);
    }

    #[test]
    fn test_map_lines_follow_module_code() {
        let mut emitter = Emitter::new("index.bundle");
        emitter.module(&"a.js".into(), "one\ntwo", false).unwrap();
        let (code, map) = emitter.finish();

        let helper_lines = CJS_HELPER.lines().count();
        let lines: Vec<&str> = code.lines().collect();
        assert_eq!(lines[helper_lines + 1], "one");
        // Helper lines and the wrapper line carry no mappings
        let groups: Vec<&str> = map.mappings.split(';').collect();
        assert!(groups[..=helper_lines].iter().all(|g| g.is_empty()));
        assert_eq!(groups[helper_lines + 1], "AAAA");
        assert_eq!(groups[helper_lines + 2], "AACA");
    }

    #[test]
    fn test_override_keeps_line_count() {
        let mut emitter = Emitter::new("index.bundle");
        emitter.module(&"a.js".into(), "x", true).unwrap();
        let (code, _) = emitter.finish();

        let live = override_cjs_helper(&code);
        assert!(live.starts_with(LIVE_CJS_HELPER));
        assert!(!live.contains("__modules"));
        assert_eq!(live.lines().count(), code.lines().count());
    }

    #[test]
    fn test_override_without_helper_is_noop() {
        assert_eq!(override_cjs_helper("console.log(1);"), "console.log(1);");
    }

    #[test]
    fn test_graph_statement_filter() {
        let mut inputs = BTreeMap::new();
        inputs.insert(ModuleId::from("a.js"), vec![ModuleId::from("b.js")]);
        inputs.insert(ModuleId::from("b.js"), vec![]);

        let all = module_graph_statement(&inputs, None).unwrap();
        assert_eq!(all, "globalThis.$UPDATE_MODULE_GRAPH({\"a.js\":[\"b.js\"],\"b.js\":[]});\n");

        let only: BTreeSet<ModuleId> = [ModuleId::from("b.js")].into_iter().collect();
        let some = module_graph_statement(&inputs, Some(&only)).unwrap();
        assert_eq!(some, "globalThis.$UPDATE_MODULE_GRAPH({\"b.js\":[]});\n");
    }
}
