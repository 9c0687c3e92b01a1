//! Read-only AST visitor, used by the IR builder and by debug dumps.
//!
//! Traversal order is postorder-consistent with how nodes were pushed by
//! the parser: `walk_node` always visits a node's children before calling
//! back into `visit_node` for the node itself is left to callers that need
//! that order (the IR builder does its own postorder walk directly, since
//! it needs to interleave control flow); this trait exists for passes that
//! only need a plain preorder or postorder sweep, such as an AST dumper.

use crate::ast::{Function, Node, NodeId, NodeKind};

pub trait Visitor: Sized {
    fn visit_function(&mut self, function: &Function) {
        walk_function(self, function);
    }

    fn visit_node(&mut self, function: &Function, id: NodeId) {
        walk_node(self, function, id);
    }
}

pub fn walk_function<V: Visitor>(visitor: &mut V, function: &Function) {
    visitor.visit_node(function, function.body);
    for nested in &function.functions {
        visitor.visit_function(nested);
    }
}

pub fn walk_node<V: Visitor>(visitor: &mut V, function: &Function, id: NodeId) {
    let node: &Node = function.node(id);
    for_each_child(&node.kind, |child| visitor.visit_node(function, child));
}

/// Invoke `f` for every immediate child `NodeId` of `kind`, in evaluation
/// order. `FunctionLit`/`FunctionDecl` do not recurse here; nested
/// functions are walked separately via `Function::functions`.
pub fn for_each_child(kind: &NodeKind, mut f: impl FnMut(NodeId)) {
    use NodeKind::*;
    match kind {
        Null | True | False | Number(_) | StringLit(_) | Name(_) | LocalName(_) | GlobalName(_)
        | OutenvName(_) | SelfName | SuperName | Vararg | Break | Continue | FunctionLit(_)
        | FunctionDecl { .. } => {}

        Unpack(e) | ExprStmt(e) | Throw(e) | YieldFor { iterable: e } => f(*e),
        Return(values) => values.iter().copied().for_each(f),

        Unary { operand, .. } => f(*operand),
        Binary { lhs, rhs, .. } | Logical { lhs, rhs, .. } => {
            f(*lhs);
            f(*rhs);
        }
        CompareChain { operands, .. } => operands.iter().copied().for_each(f),
        Ternary { cond, then_expr, else_expr } => {
            f(*cond);
            f(*then_expr);
            f(*else_expr);
        }
        Key { obj, .. } => f(*obj),
        Index { obj, index } => {
            f(*obj);
            f(*index);
        }
        Call { callee, args } => {
            f(*callee);
            args.iter().copied().for_each(f);
        }
        MethodCall { obj, args, .. } => {
            f(*obj);
            args.iter().copied().for_each(f);
        }
        ArrayLit { elements } => elements.iter().copied().for_each(f),
        TableLit { entries } => {
            for (k, v) in entries {
                f(*k);
                f(*v);
            }
        }
        ObjectLit { prototype, members, .. } => {
            if let Some(p) = prototype {
                f(*p);
            }
            members.iter().copied().for_each(f);
        }
        Yield { args } => args.iter().copied().for_each(f),

        VarDecl { init, .. } => {
            if let Some(e) = init {
                f(*e);
            }
        }
        Assign { target, value, .. } => {
            f(*target);
            f(*value);
        }
        MultiAssign { targets, values } => {
            values.iter().copied().for_each(&mut f);
            targets.iter().copied().for_each(f);
        }
        Block(stmts) => stmts.iter().copied().for_each(f),
        If { cond, then_block, else_block } => {
            f(*cond);
            f(*then_block);
            if let Some(e) = else_block {
                f(*e);
            }
        }
        ForRange { start, stop, step, body, .. } => {
            f(*start);
            f(*stop);
            if let Some(s) = step {
                f(*s);
            }
            f(*body);
        }
        ForEach { iterable, body, .. } => {
            f(*iterable);
            f(*body);
        }
        While { cond, body } => {
            f(*cond);
            f(*body);
        }
        Repeat { body, until } => {
            f(*body);
            f(*until);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Program;
    use crate::parser::Parser;
    use kbc_common::Source;

    fn parse(text: &str) -> Program {
        let mut source = Source::new("t.kf", text);
        let parser = Parser::new(&mut source);
        let (program, errors) = parser.parse_program();
        assert!(errors.is_empty(), "{:?}", errors.diagnostics());
        program
    }

    struct NumberOrder {
        seen: Vec<f64>,
    }
    impl Visitor for NumberOrder {
        fn visit_node(&mut self, function: &Function, id: NodeId) {
            if let NodeKind::Number(n) = function.node(id).kind {
                self.seen.push(n);
            }
            walk_node(self, function, id);
        }
    }

    #[test]
    fn binary_operands_are_visited_left_before_right() {
        let program = parse("return 1 + 2");
        let mut rec = NumberOrder { seen: Vec::new() };
        rec.visit_function(&program.main);
        assert_eq!(rec.seen, vec![1.0, 2.0]);
    }

    #[test]
    fn call_visits_the_callee_before_its_arguments() {
        let program = parse("return f(1, 2)");
        let mut rec = NumberOrder { seen: Vec::new() };
        rec.visit_function(&program.main);
        assert_eq!(rec.seen, vec![1.0, 2.0]);
    }

    #[test]
    fn if_visits_condition_then_branch_then_else_branch() {
        let program = parse("if 1\n  return 2\nelse\n  return 3\nend");
        let mut rec = NumberOrder { seen: Vec::new() };
        rec.visit_function(&program.main);
        assert_eq!(rec.seen, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn for_each_child_never_recurses_into_a_nested_functions_own_body() {
        // FunctionDecl/FunctionLit contribute no children; only
        // `walk_function`'s separate loop over `Function::functions` reaches
        // a nested function's own node tree.
        let program = parse("def f() return 1 end\nreturn 2");
        let mut rec = NumberOrder { seen: Vec::new() };
        rec.visit_node(&program.main, program.main.body);
        assert_eq!(rec.seen, vec![2.0]);
    }

    #[test]
    fn visit_function_does_recurse_into_nested_functions() {
        let program = parse("def f() return 1 end\nreturn 2");
        let mut rec = NumberOrder { seen: Vec::new() };
        rec.visit_function(&program.main);
        assert_eq!(rec.seen, vec![2.0, 1.0]);
    }
}
