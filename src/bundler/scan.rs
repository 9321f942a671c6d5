//! Import specifier scanning
//!
//! Finds the module specifiers a file depends on without parsing it:
//! `import ... from 'x'`, `import 'x'`, `import('x')`, `export ... from 'x'`
//! and `require('x')`. Matches that start inside a comment, a string or a
//! regex literal are skipped. Template substitutions count as template text.

use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

static SPECIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:\bfrom\s*|\bimport\s*\(?\s*|\brequire\s*\(\s*)(['"])([^'"\n]+)(['"])"#)
        .expect("specifier pattern is valid")
});

/// One dependency reference inside a module's code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
    pub specifier: String,
    /// Byte range of the specifier text, quotes excluded
    pub start: usize,
    pub end: usize,
}

/// All dependency references in `code`, in source order
pub fn scan_imports(code: &str) -> Vec<ImportRef> {
    let literals = literal_spans(code);
    SPECIFIER
        .captures_iter(code)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            if caps.get(1)?.as_str() != caps.get(3)?.as_str() {
                return None;
            }
            if inside(&literals, whole.start()) {
                return None;
            }
            let spec = caps.get(2)?;
            Some(ImportRef {
                specifier: spec.as_str().to_string(),
                start: spec.start(),
                end: spec.end(),
            })
        })
        .collect()
}

/// Byte ranges of comments, string literals and regex literals, in order
fn literal_spans(code: &str) -> Vec<Range<usize>> {
    let bytes = code.as_bytes();
    let mut spans = Vec::new();
    // Last significant byte outside any literal, to tell a regex from a division
    let mut previous: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = code[i..].find('\n').map_or(bytes.len(), |n| i + n);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = code[i + 2..].find("*/").map_or(bytes.len(), |n| i + 2 + n + 2);
            }
            b'/' if starts_regex(previous) => {
                i = skip_regex(bytes, i + 1);
                previous = Some(b'/');
            }
            quote @ (b'\'' | b'"' | b'`') => {
                i = skip_string(bytes, i + 1, quote);
                previous = Some(quote);
            }
            byte => {
                if !byte.is_ascii_whitespace() {
                    previous = Some(byte);
                }
                i += 1;
                continue;
            }
        }
        spans.push(start..i);
    }
    spans
}

fn starts_regex(previous: Option<u8>) -> bool {
    match previous {
        None => true,
        Some(byte) => b"(,=:[!&|?{};+-*%<>~^".contains(&byte),
    }
}

/// End of a string literal whose body starts at `i`
fn skip_string(bytes: &[u8], mut i: usize, quote: u8) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            b'\n' if quote != b'`' => return i,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// End of a regex literal whose body starts at `i`
fn skip_regex(bytes: &[u8], mut i: usize) -> usize {
    let mut in_class = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'[' => {
                in_class = true;
                i += 1;
            }
            b']' => {
                in_class = false;
                i += 1;
            }
            b'/' if !in_class => return i + 1,
            b'\n' => return i,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn inside(spans: &[Range<usize>], offset: usize) -> bool {
    let idx = spans.partition_point(|span| span.end <= offset);
    spans.get(idx).is_some_and(|span| span.start <= offset)
}

/// Replace each reference's specifier with the string `rename` returns for it
pub fn rewrite_specifiers<F>(code: &str, refs: &[ImportRef], mut rename: F) -> String
where
    F: FnMut(&ImportRef) -> String,
{
    let mut out = String::with_capacity(code.len());
    let mut cursor = 0;
    for r in refs {
        out.push_str(&code[cursor..r.start]);
        out.push_str(&rename(r));
        cursor = r.end;
    }
    out.push_str(&code[cursor..]);
    out
}
