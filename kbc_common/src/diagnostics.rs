//! Diagnostic collection shared by every pass.
//!
//! All diagnostics accumulate, in program order, into one [`ErrorSink`] per
//! compilation. `success` (computed by the caller) is `true` iff no
//! [`Severity::Error`] was recorded; warnings never fail a compile.

use crate::source::{Source, SrcLoc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// One diagnostic message, anchored to an absolute source offset. Messages
/// follow POSIX-style phrasing ("unexpected X", "redeclaration of 'name'",
/// ...); test suites should match by prefix, not by exact string, so
/// wording can still evolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub sloc: SrcLoc,
    pub message: String,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, sloc: SrcLoc) -> Self {
        Self { severity: Severity::Error, sloc, message: message.into() }
    }

    pub fn warning(message: impl Into<String>, sloc: SrcLoc) -> Self {
        Self { severity: Severity::Warning, sloc, message: message.into() }
    }

    /// Render as `path:line:col: severity: message`.
    pub fn render(&self, path: &str, source: &Source) -> String {
        let (line, column) = source.location(self.sloc);
        format!("{path}:{line}:{column}: {}: {}", self.severity, self.message)
    }
}

/// An ordered collection of diagnostics for one compilation. Never dropped
/// mid-pass: later passes still run (where practical) after an `ERROR` so
/// users see as many problems as possible per run.
#[derive(Debug, Clone, Default)]
pub struct ErrorSink {
    diagnostics: Vec<Diagnostic>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, message: impl Into<String>, sloc: SrcLoc) {
        self.diagnostics.push(Diagnostic::error(message, sloc));
    }

    pub fn warning(&mut self, message: impl Into<String>, sloc: SrcLoc) {
        self.diagnostics.push(Diagnostic::warning(message, sloc));
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.severity == Severity::Error).count()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics
    }

    pub fn extend(&mut self, other: ErrorSink) {
        self.diagnostics.extend(other.diagnostics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_iff_no_errors() {
        let mut sink = ErrorSink::new();
        sink.warning("constant arithmetic on non-number value", 0);
        assert!(!sink.has_errors());
        sink.error("unexpected ')'", 4);
        assert!(sink.has_errors());
        assert_eq!(sink.error_count(), 1);
    }

    #[test]
    fn render_uses_posix_style_prefix() {
        let source = Source::new("t.kf", "y = 1");
        let diag = Diagnostic::error("cannot assign to undeclared identifier 'y'", 0);
        let rendered = diag.render("t.kf", &source);
        assert_eq!(rendered, "t.kf:1:1: error: cannot assign to undeclared identifier 'y'");
    }
}
