//! The parsed syntax tree.
//!
//! Per-function, nodes are stored in a flat `Vec<Node>` in postorder (every
//! child is pushed before its parent), and a parent references its children
//! by `NodeId` index rather than by an intrusive sibling-chain pointer — a
//! tagged-union-plus-explicit-children shape, rather than the variable-width
//! sibling-chain layout the bytecode contract's own node description uses.

use kbc_common::source::{InternedStr, SrcLoc};

pub type NodeId = u32;
pub type FunctionId = u32;

/// Sentinel stored in a `local`/`locals` placeholder field between parsing
/// and name resolution. Never observed past the resolver pass.
pub const UNRESOLVED_LOCAL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
    BitNot,
    Len,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Concat,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    AShr,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Is,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// How a name was spelled by the parser, before the resolver classifies it.
/// The resolver rewrites `Name` nodes into `LocalName`/`GlobalName`/
/// `OutenvName` in place, so `Name` never survives past
/// name resolution.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Null,
    True,
    False,
    Number(f64),
    /// A string literal: either a direct view into source text or,
    /// when escapes were processed, an interned synthesized string.
    StringLit(InternedStr),

    /// Unresolved identifier reference; rewritten by the resolver.
    Name(InternedStr),
    /// Local variable, resolved to a slot index within the owning function.
    LocalName(u32),
    /// Global variable reference.
    GlobalName(InternedStr),
    /// Captured variable, resolved to an index into the function's outenv
    /// (upstack) list.
    OutenvName(u32),
    /// `self` inside a method, or `super` used as a name on its own.
    SelfName,
    /// `self` rewritten for a `super.name(...)` call: name resolution marks
    /// the receiver so codegen can emit an unbound-method dispatch.
    SuperName,

    Vararg,
    /// `...expr` used in an argument list or array/table literal to splice
    /// multiple values in place of one.
    Unpack(NodeId),

    Unary { op: UnaryOp, operand: NodeId },
    Binary { op: BinaryOp, lhs: NodeId, rhs: NodeId },
    Logical { op: LogicalOp, lhs: NodeId, rhs: NodeId },
    /// `a < b < c`-shaped chained comparison: `operands.len() == ops.len() + 1`,
    /// each `ops[i]` relating `operands[i]` to `operands[i + 1]`. Every
    /// comparand is evaluated exactly once even though it participates in
    /// two comparisons.
    CompareChain { operands: Vec<NodeId>, ops: Vec<BinaryOp> },
    /// `a if cond else b`-shaped ternary.
    Ternary { cond: NodeId, then_expr: NodeId, else_expr: NodeId },

    /// `obj.name`
    Key { obj: NodeId, name: InternedStr },
    /// `obj[index]`
    Index { obj: NodeId, index: NodeId },
    /// `callee(args...)`
    Call { callee: NodeId, args: Vec<NodeId> },
    /// `obj:name(args...)` — method call sugar, `obj` evaluated once.
    MethodCall { obj: NodeId, name: InternedStr, args: Vec<NodeId> },

    ArrayLit { elements: Vec<NodeId> },
    TableLit { entries: Vec<(NodeId, NodeId)> },
    ObjectLit { prototype: Option<NodeId>, keys: Vec<InternedStr>, members: Vec<NodeId> },

    /// A nested function (named `def` statement lowered to decl + this, or
    /// an anonymous `def(...) ... end` expression).
    FunctionLit(FunctionId),

    Yield { args: Vec<NodeId> },
    YieldFor { iterable: NodeId },

    // --- statements ---
    ExprStmt(NodeId),
    VarDecl { names: Vec<InternedStr>, locals: Vec<u32>, init: Option<NodeId> },
    Assign { op: Option<BinaryOp>, target: NodeId, value: NodeId },
    /// `lhs1, ..., lhsN = rhs1, ..., rhsN`. Always plain `=`; the compound
    /// `op=` forms only exist for the single-target shape above.
    MultiAssign { targets: Vec<NodeId>, values: Vec<NodeId> },
    Block(Vec<NodeId>),
    If { cond: NodeId, then_block: NodeId, else_block: Option<NodeId> },
    ForRange { var: InternedStr, local: u32, start: NodeId, stop: NodeId, step: Option<NodeId>, body: NodeId },
    ForEach { var: InternedStr, local: u32, iterable: NodeId, body: NodeId },
    While { cond: NodeId, body: NodeId },
    Repeat { body: NodeId, until: NodeId },
    Break,
    Continue,
    /// Zero values for a bare `return`, one for the common case, more than
    /// one when returning a literal multi-value list.
    Return(Vec<NodeId>),
    Throw(NodeId),
    FunctionDecl { name: InternedStr, local: u32, function: FunctionId },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub sloc: SrcLoc,
}

/// A local variable slot, as declared by `var` or introduced implicitly by
/// function parameters / hidden loop state. Filled in by the resolver;
/// empty immediately after parsing.
#[derive(Debug, Clone)]
pub struct Local {
    pub name: InternedStr,
    pub is_captured: bool,
    pub is_parameter: bool,
    pub is_vararg: bool,
    pub is_implicit_self: bool,
    /// Index into the *declaring* function's upstack, set iff `is_captured`.
    pub upstack_index: Option<u32>,
    /// Slot within the owning block's varenv record, set iff `is_captured`.
    pub varenv_slot: Option<u32>,
}

impl Local {
    pub fn new(name: InternedStr) -> Self {
        Self {
            name,
            is_captured: false,
            is_parameter: false,
            is_vararg: false,
            is_implicit_self: false,
            upstack_index: None,
            varenv_slot: None,
        }
    }
}

/// An entry in a function's closure-capture upstack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutEnvSource {
    /// Captured from the immediately enclosing function's local slot.
    ParentLocal(u32),
    /// Captured from the immediately enclosing function's own outenv list
    /// (a capture of a capture).
    ParentOutEnv(u32),
}

#[derive(Debug, Clone)]
pub struct OutEnv {
    pub source: OutEnvSource,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: Option<InternedStr>,
    pub params: Vec<InternedStr>,
    pub param_locals: Vec<u32>,
    pub has_varargs: bool,
    pub is_method: bool,
    pub sloc: SrcLoc,

    pub nodes: Vec<Node>,
    pub body: NodeId,
    pub functions: Vec<Function>,

    pub locals: Vec<Local>,
    pub outenvs: Vec<OutEnv>,

    /// Filled in by the resolver: the
    /// largest number of live upstack slots this function's captured
    /// locals ever occupy at once.
    pub max_upstack_size: u32,
    /// Per-node upstack-close depth, indexed by `NodeId`, filled in by the
    /// resolver. Only meaningful for `Block`, `Break`, and `Continue` nodes
    /// that cross a capturing scope boundary; `0` elsewhere.
    pub close_index: Vec<u32>,
}

impl Function {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    pub fn close_index_of(&self, id: NodeId) -> u32 {
        self.close_index.get(id as usize).copied().unwrap_or(0)
    }

    /// Invoke `f` for `id` and every node reachable from it through
    /// `crate::visitor::for_each_child`, not recursing into nested
    /// `FunctionLit`/`FunctionDecl` bodies (those are separate `Function`s).
    pub fn for_each_descendant(&self, id: NodeId, f: &mut impl FnMut(NodeId)) {
        f(id);
        let kind = self.node(id).kind.clone();
        crate::visitor::for_each_child(&kind, |child| self.for_each_descendant(child, &mut *f));
    }
}

/// The result of parsing one source file: a single implicit top-level
/// function whose body is the file's statement list.
#[derive(Debug, Clone)]
pub struct Program {
    pub main: Function,
}
