//! Component detection and the host's refresh hooks

use super::exports::ExportValue;

/// Decides whether an export value is a UI component
pub trait ComponentCheck {
    fn is_likely_component(&self, value: &ExportValue) -> bool;
}

/// Functions named in PascalCase
#[derive(Debug, Clone, Copy, Default)]
pub struct LikelyComponentCheck;

impl ComponentCheck for LikelyComponentCheck {
    fn is_likely_component(&self, value: &ExportValue) -> bool {
        match value {
            ExportValue::Function(name) => name.chars().next().is_some_and(|c| c.is_ascii_uppercase()),
            _ => false,
        }
    }
}

impl<F> ComponentCheck for F
where
    F: Fn(&ExportValue) -> bool,
{
    fn is_likely_component(&self, value: &ExportValue) -> bool {
        self(value)
    }
}

/// Whether a module's exports let it absorb an update in place: the exports
/// are a component themselves, or an object of at least one export where
/// every export is a plain component property
pub fn is_refresh_boundary(exports: &ExportValue, check: &dyn ComponentCheck) -> bool {
    if check.is_likely_component(exports) {
        return true;
    }
    match exports {
        ExportValue::Object(entries) if !entries.is_empty() => entries
            .iter()
            .all(|entry| !entry.accessor && check.is_likely_component(&entry.value)),
        _ => false,
    }
}

/// What the runtime asks of the UI layer
pub trait RefreshHost {
    /// Associate a live value with a stable family id
    fn register(&self, value: &ExportValue, family: &str);

    /// Re-render with the re-registered component families
    fn perform_refresh(&self);

    /// Throw away all state and restart the application
    fn full_reload(&self, reason: &str);
}

/// Host that only logs, for headless use
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHost;

impl RefreshHost for NoopHost {
    fn register(&self, _value: &ExportValue, _family: &str) {}

    fn perform_refresh(&self) {
        tracing::debug!("refresh performed");
    }

    fn full_reload(&self, reason: &str) {
        tracing::warn!(reason, "full reload requested");
    }
}
