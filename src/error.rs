//! Error types for the livebundle dev server

use std::fmt;
use thiserror::Error;

/// Source location inside a project file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    /// Line number (1-indexed)
    pub line: u32,
    /// Column number (1-indexed)
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    /// Compute the 1-indexed line and column of a byte offset in `source`
    pub fn from_offset(source: &str, offset: usize) -> Self {
        let offset = offset.min(source.len());
        let before = &source[..offset];
        let line = before.matches('\n').count() as u32 + 1;
        let column = match before.rfind('\n') {
            Some(newline) => (offset - newline) as u32,
            None => offset as u32 + 1,
        };
        Self { line, column }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Format a source context with caret pointer for errors
pub fn format_error_context(source: &str, location: &SourceLocation) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let line_idx = (location.line.saturating_sub(1)) as usize;

    if line_idx >= lines.len() {
        return String::new();
    }

    let mut result = String::new();
    let line_num_width = format!("{}", location.line + 1).len().max(3);

    // Show 1 line before if available
    if line_idx > 0 {
        result.push_str(&format!(
            "{:>width$} | {}\n",
            location.line - 1,
            lines[line_idx - 1],
            width = line_num_width
        ));
    }

    result.push_str(&format!(
        "{:>width$} | {}\n",
        location.line,
        lines[line_idx],
        width = line_num_width
    ));

    let pointer_offset = (location.column.saturating_sub(1)) as usize;
    result.push_str(&format!(
        "{:>width$} | {}^\n",
        "",
        " ".repeat(pointer_offset),
        width = line_num_width
    ));

    if line_idx + 1 < lines.len() {
        result.push_str(&format!(
            "{:>width$} | {}\n",
            location.line + 1,
            lines[line_idx + 1],
            width = line_num_width
        ));
    }

    result
}

/// A single build or transform message, pinned to a file location when known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Originating stage ("resolver", "emit", or a transform stage name)
    pub origin: String,
    /// Project-relative file the message refers to
    pub file: Option<String>,
    pub location: SourceLocation,
    pub message: String,
    /// The offending source line, if it could be recovered
    pub line_text: Option<String>,
}

impl Diagnostic {
    pub fn new(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            file: None,
            location: SourceLocation::default(),
            message: message.into(),
            line_text: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Pin the diagnostic to a location and capture the source line it points at
    pub fn at(mut self, location: SourceLocation, source: &str) -> Self {
        self.line_text = source
            .lines()
            .nth(location.line.saturating_sub(1) as usize)
            .map(str::to_string);
        self.location = location;
        self
    }

    /// Render the diagnostic with a caret pointer under the offending column
    pub fn render(&self) -> String {
        let mut out = self.to_string();
        if let Some(ref text) = self.line_text {
            let pointer = " ".repeat(self.location.column.saturating_sub(1) as usize);
            out.push_str(&format!("\n  | {}\n  | {}^", text, pointer));
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = self.file.as_deref().unwrap_or("unknown file");
        write!(f, "[{}] {}:{} {}", self.origin, file, self.location, self.message)
    }
}

/// A non-empty list of diagnostics reported by one build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics(pub Vec<Diagnostic>);

impl Diagnostics {
    pub fn single(diagnostic: Diagnostic) -> Self {
        Self(vec![diagnostic])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, diagnostic) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", diagnostic)?;
        }
        Ok(())
    }
}

/// Main error type for livebundle
#[derive(Error, Debug)]
pub enum Error {
    /// Resolution or emission failure from the bundler engine
    #[error("BuildError: {0}")]
    Build(Diagnostics),

    /// Failure raised inside a transform stage
    #[error("TransformError: {0}")]
    Transform(Diagnostics),

    /// Anything that is not a user code problem
    #[error("InternalError: {0}")]
    Internal(String),

    /// Unknown or unsupported `platform` selector
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Invalid configuration file or flag
    #[error("ConfigError: {0}")]
    Config(String),

    /// Cache or wire serialization failure
    #[error("SerializationError: {0}")]
    Serialization(String),

    /// IO error
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a build error from a single diagnostic
    pub fn build(diagnostic: Diagnostic) -> Self {
        Error::Build(Diagnostics::single(diagnostic))
    }

    /// Create a transform error attributed to `stage`
    pub fn transform(stage: &str, file: &str, message: impl Into<String>) -> Self {
        Error::Transform(Diagnostics::single(
            Diagnostic::new(stage, message).with_file(file),
        ))
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Diagnostics attached to user-code errors, if this is one
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            Error::Build(d) | Error::Transform(d) => Some(d),
            _ => None,
        }
    }

    /// Whether the error is caused by user code (as opposed to a bug or environment issue)
    pub fn is_user_error(&self) -> bool {
        self.diagnostics().is_some()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias for livebundle
pub type Result<T> = std::result::Result<T, Error>;
