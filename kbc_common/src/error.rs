//! The top-level error type for the kbc compiler pipeline.

use thiserror::Error;

/// Internal, non-diagnosable errors: invariant breaks the pipeline cannot
/// recover from. User-facing problems (bad source text) are reported as
/// [`crate::Diagnostic`]s through an [`crate::ErrorSink`] instead and never
/// reach this type.
#[derive(Error, Debug, Clone)]
pub enum CompileError {
    #[error("lexical analysis failed: {message}")]
    Lex { message: String },

    #[error("parsing failed: {message}")]
    Parse { message: String },

    #[error("name resolution failed: {message}")]
    Resolve { message: String },

    #[error("IR construction failed: {message}")]
    Ir { message: String },

    #[error("register allocation failed: {message}")]
    Alloc { message: String },

    #[error("bytecode emission failed: {message}")]
    Emit { message: String },

    #[error("internal compiler limit exceeded: {message}")]
    InternalLimit { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },
}

pub type CompileResult<T> = Result<T, CompileError>;

impl CompileError {
    pub fn lex(message: impl Into<String>) -> Self {
        Self::Lex { message: message.into() }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse { message: message.into() }
    }

    pub fn resolve(message: impl Into<String>) -> Self {
        Self::Resolve { message: message.into() }
    }

    pub fn ir(message: impl Into<String>) -> Self {
        Self::Ir { message: message.into() }
    }

    pub fn alloc(message: impl Into<String>) -> Self {
        Self::Alloc { message: message.into() }
    }

    pub fn emit(message: impl Into<String>) -> Self {
        Self::Emit { message: message.into() }
    }

    pub fn internal_limit(message: impl Into<String>) -> Self {
        Self::InternalLimit { message: message.into() }
    }
}

impl From<std::io::Error> for CompileError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { message: error.to_string() }
    }
}
