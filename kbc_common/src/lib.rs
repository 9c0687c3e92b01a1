//! Shared infrastructure for the kbc compiler pipeline.
//!
//! Every pass (lexer, parser, resolver, IR builder/fold/liveness/inline,
//! allocator, emitter) shares exactly two pieces of state: a [`Source`]
//! buffer and an [`ErrorSink`]. Nothing else is global.

pub mod diagnostics;
pub mod error;
pub mod source;

pub use diagnostics::{Diagnostic, ErrorSink, Severity};
pub use error::{CompileError, CompileResult};
pub use source::{InternedStr, SrcLoc, Source};
