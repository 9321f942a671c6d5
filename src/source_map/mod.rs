//! Source Map V3 generation for bundles and HMR payloads
//!
//! Implements the [Source Map V3 specification](https://sourcemaps.info/spec.html).
//! The bundler emits module code line-for-line, so mappings are whole-line
//! segments pointing at column 0 of the original line.
//!
//! # Features
//!
//! - **VLQ encoding**: Base64 VLQ codec for compact mapping representation
//! - **SourceMapBuilder**: Incremental construction of source maps
//! - **Line offsets**: shifting a finished map below a prepended header

use crate::error::{Error, Result};
use serde::Serialize;

// Base64 VLQ alphabet
const BASE64_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

const VLQ_BASE_SHIFT: u8 = 5;
const VLQ_BASE: i64 = 1 << VLQ_BASE_SHIFT;
const VLQ_BASE_MASK: i64 = VLQ_BASE - 1;
const VLQ_CONTINUATION_BIT: i64 = VLQ_BASE;

/// Encode an integer as a Base64 VLQ string.
///
/// The sign is encoded in bit 0, and the remaining value is encoded
/// in groups of 5 bits with bit 5 as a continuation flag.
pub fn vlq_encode(value: i64) -> String {
    let mut result = String::new();
    let mut vlq = if value < 0 {
        ((-value) << 1) + 1
    } else {
        value << 1
    };

    loop {
        let mut digit = vlq & VLQ_BASE_MASK;
        vlq >>= VLQ_BASE_SHIFT;
        if vlq > 0 {
            digit |= VLQ_CONTINUATION_BIT;
        }
        result.push(BASE64_CHARS[digit as usize] as char);
        if vlq == 0 {
            break;
        }
    }

    result
}

/// V3 source map representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceMap {
    /// Source map version (always 3).
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Original source file names.
    pub sources: Vec<String>,
    pub names: Vec<String>,
    /// VLQ-encoded mappings string.
    pub mappings: String,
}

impl SourceMap {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::internal(format!("source map serialization failed: {}", e)))
    }

    /// Shift every mapping down by `lines` generated lines, for code that is
    /// emitted after a header the map does not describe
    pub fn offset_lines(mut self, lines: usize) -> Self {
        if lines > 0 && !self.mappings.is_empty() {
            self.mappings = format!("{}{}", ";".repeat(lines), self.mappings);
        }
        self
    }

    /// Number of generated lines the mappings cover
    pub fn generated_lines(&self) -> usize {
        if self.mappings.is_empty() {
            0
        } else {
            self.mappings.split(';').count()
        }
    }
}

/// Internal segment used during building.
#[derive(Debug, Clone)]
struct Segment {
    generated_column: u32,
    source: u32,
    original_line: u32,
    original_column: u32,
}

/// Builder for incremental source map construction.
#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    file: Option<String>,
    sources: Vec<String>,
    segments: Vec<Vec<Segment>>,
}

impl SourceMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the generated file name.
    pub fn set_file(&mut self, file: &str) {
        self.file = Some(file.to_string());
    }

    /// Add a source file and return its index.
    pub fn add_source(&mut self, source: &str) -> u32 {
        if let Some(idx) = self.sources.iter().position(|s| s == source) {
            return idx as u32;
        }
        let idx = self.sources.len() as u32;
        self.sources.push(source.to_string());
        idx
    }

    /// Map 0-based `generated_line` to the start of `original_line` in `source`
    pub fn add_line(&mut self, generated_line: u32, source: u32, original_line: u32) {
        let line = generated_line as usize;
        if self.segments.len() <= line {
            self.segments.resize_with(line + 1, Vec::new);
        }
        self.segments[line].push(Segment {
            generated_column: 0,
            source,
            original_line,
            original_column: 0,
        });
    }

    /// Consume the builder and produce a finished `SourceMap`.
    pub fn build(mut self) -> SourceMap {
        for segs in &mut self.segments {
            segs.sort_by_key(|s| s.generated_column);
        }

        let mappings = self.encode_mappings();

        SourceMap {
            version: 3,
            file: self.file,
            sources: self.sources,
            names: Vec::new(),
            mappings,
        }
    }

    fn encode_mappings(&self) -> String {
        let mut result = String::new();
        let mut prev_source: i64 = 0;
        let mut prev_orig_line: i64 = 0;
        let mut prev_orig_col: i64 = 0;

        for (line_idx, line_segs) in self.segments.iter().enumerate() {
            if line_idx > 0 {
                result.push(';');
            }
            let mut prev_gen_col: i64 = 0;

            for (seg_idx, seg) in line_segs.iter().enumerate() {
                if seg_idx > 0 {
                    result.push(',');
                }

                // Generated column is relative within the line, the rest across the map
                let gen_col = seg.generated_column as i64;
                result.push_str(&vlq_encode(gen_col - prev_gen_col));
                prev_gen_col = gen_col;

                let source = seg.source as i64;
                let orig_line = seg.original_line as i64;
                let orig_col = seg.original_column as i64;
                result.push_str(&vlq_encode(source - prev_source));
                result.push_str(&vlq_encode(orig_line - prev_orig_line));
                result.push_str(&vlq_encode(orig_col - prev_orig_col));
                prev_source = source;
                prev_orig_line = orig_line;
                prev_orig_col = orig_col;
            }
        }

        result
    }
}
