//! SSA IR construction for the kbc compiler pipeline.
//!
//! `function`/`op` define the owned per-function IR (ops, operand slab,
//! blocks, constant/selector pools). `builder` lowers a resolved AST
//! (`kbc_parser::ast`) into that IR, one function at a time, producing the
//! block-header ϕ/REF shape the later fold/liveness/inline/allocator passes
//! (in `kbc_codegen`) expect.

pub mod builder;
pub mod function;
pub mod op;

pub use builder::build_program;
pub use function::{Block, BlockKind, Constant, Function, Module, Op, Selector};
pub use op::{Opcode, Operand, INVALID, PINNED};
