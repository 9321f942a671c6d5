//! Built-in transform stages

use super::{StageFilter, Transform, TransformData, TransformStage};
use crate::error::{Diagnostic, Diagnostics, Error, Result, SourceLocation};

/// Turns `.json` files into CommonJS modules exporting the parsed value
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonModuleStage;

impl JsonModuleStage {
    pub const NAME: &'static str = "json";

    /// The stage wired with its loader filter
    pub fn stage() -> TransformStage {
        TransformStage::in_process(Self::NAME, StageFilter::loaders(&["json"]), JsonModuleStage)
    }
}

impl Transform for JsonModuleStage {
    fn transform(&self, mut data: TransformData) -> Result<TransformData> {
        let value: serde_json::Value = serde_json::from_str(&data.code).map_err(|e| {
            let location = SourceLocation::new(e.line() as u32, e.column() as u32);
            Error::Transform(Diagnostics::single(
                Diagnostic::new(Self::NAME, format!("invalid JSON: {}", e))
                    .with_file(data.relative_path.as_str())
                    .at(location, &data.code),
            ))
        })?;

        data.code = format!("module.exports = {};", serde_json::to_string(&value)?);
        data.loader = "js".to_string();
        Ok(data)
    }
}
