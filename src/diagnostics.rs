//! Structured diagnostic records produced by output parsing.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    /// Anything a linter reports that is neither an error nor a warning
    /// (hints, notes, style nits).
    Other,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One error/warning record reported by a linter.
///
/// Lines and columns are zero-based once they reach this struct; the
/// output parser applies the linter's numbering base. `end_line`/`end_col`
/// are present only when the tool reports a span. When no column is
/// available, `near` optionally carries a text fragment the rendering
/// layer can locate on the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: u32,
    pub col: Option<u32>,
    pub end_line: Option<u32>,
    pub end_col: Option<u32>,
    pub severity: Severity,
    pub message: String,
    pub code: Option<String>,
    pub near: Option<String>,
}

impl Diagnostic {
    pub fn new(line: u32, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            line,
            col: None,
            end_line: None,
            end_col: None,
            severity,
            message: message.into(),
            code: None,
            near: None,
        }
    }

    pub fn error(line: u32, message: impl Into<String>) -> Self {
        Self::new(line, Severity::Error, message)
    }

    pub fn warning(line: u32, message: impl Into<String>) -> Self {
        Self::new(line, Severity::Warning, message)
    }

    pub fn with_col(mut self, col: u32) -> Self {
        self.col = Some(col);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Render as `"severity: code: message"`, the shape the
    /// `filter_errors` patterns are matched against.
    pub fn filter_key(&self) -> String {
        format!(
            "{}: {}: {}",
            self.severity,
            self.code.as_deref().unwrap_or(""),
            self.message
        )
    }
}
