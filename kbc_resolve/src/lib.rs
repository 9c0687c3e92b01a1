//! Name resolution for the kbc compiler pipeline.
//!
//! Walks every function's AST, classifying each identifier occurrence as a
//! local, a captured (outenv) reference, or a global, and computes the
//! closure-capture layout (the "upstack") each function needs at runtime.
//! This is the compiler's semantic pass between parsing and SSA lowering:
//! it can fail (redeclaration, assignment to an undeclared global, misuse
//! of `break`/`continue`/`super`/varargs), and on success it leaves the AST
//! annotated so the IR builder never has to re-derive scoping.

mod resolver;
mod scope;

pub use resolver::resolve_program;
