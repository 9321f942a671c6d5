//! Module export values as seen by the refresh resolver

use std::cell::RefCell;
use std::rc::Rc;

/// A module's `module.exports`, shared so that a circular require observes
/// the exports assigned so far
pub type Exports = Rc<RefCell<ExportValue>>;

/// The slice of a script value the resolver needs to judge components
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ExportValue {
    #[default]
    Undefined,
    /// Numbers, strings and other plain data
    Data(String),
    /// A callable, by name
    Function(String),
    /// Own enumerable properties, in definition order
    Object(Vec<ExportEntry>),
}

/// One property of an exports object
#[derive(Debug, Clone, PartialEq)]
pub struct ExportEntry {
    pub key: String,
    pub value: ExportValue,
    /// Defined through a getter
    pub accessor: bool,
}

impl ExportValue {
    pub fn function(name: &str) -> Self {
        ExportValue::Function(name.to_string())
    }

    pub fn data(value: impl ToString) -> Self {
        ExportValue::Data(value.to_string())
    }

    pub fn empty_object() -> Self {
        ExportValue::Object(Vec::new())
    }

    pub fn is_object(&self) -> bool {
        matches!(self, ExportValue::Object(_))
    }

    /// Property lookup on an object value
    pub fn get(&self, key: &str) -> Option<&ExportValue> {
        match self {
            ExportValue::Object(entries) => entries.iter().find(|e| e.key == key).map(|e| &e.value),
            _ => None,
        }
    }

    /// Set a plain property. A non-object value becomes an empty object first,
    /// matching `exports.key = value` on a fresh module.
    pub fn set(&mut self, key: &str, value: ExportValue) {
        self.define(key, value, false);
    }

    /// Define a property backed by a getter
    pub fn set_accessor(&mut self, key: &str, value: ExportValue) {
        self.define(key, value, true);
    }

    fn define(&mut self, key: &str, value: ExportValue, accessor: bool) {
        if !self.is_object() {
            *self = ExportValue::empty_object();
        }
        if let ExportValue::Object(entries) = self {
            match entries.iter_mut().find(|e| e.key == key) {
                Some(entry) => {
                    entry.value = value;
                    entry.accessor = accessor;
                }
                None => entries.push(ExportEntry {
                    key: key.to_string(),
                    value,
                    accessor,
                }),
            }
        }
    }

    /// Plain (non-getter) properties of an object value
    pub fn plain_entries(&self) -> impl Iterator<Item = &ExportEntry> {
        let entries: &[ExportEntry] = match self {
            ExportValue::Object(entries) => entries,
            _ => &[],
        };
        entries.iter().filter(|e| !e.accessor)
    }
}
