//! Recursive-descent parser for the kbc compiler pipeline.

pub mod ast;
pub mod parser;
pub mod precedence;
pub mod visitor;

pub use ast::{Function, Node, NodeId, NodeKind, Program};
pub use parser::Parser;
