//! The resolver proper: classifies every `Name` node as
//! local/global/outenv, builds each function's `locals`/`outenvs`, and
//! computes the upstack/varenv layout for closure capture.

use crate::scope::{CaptureRecord, FnState, LoopFrame};
use kbc_common::source::{InternedStr, Source};
use kbc_common::ErrorSink;
use kbc_parser::ast::*;
use log::debug;

/// Resolve every name in `program`, in place. Returns the diagnostics
/// recorded along the way; `errors.has_errors()` tells the caller whether
/// the resolved AST is safe to lower to IR.
pub fn resolve_program(program: &mut Program, source: &mut Source) -> ErrorSink {
    debug!("resolver: starting pass over '{}'", source.name());
    let mut errors = ErrorSink::new();
    let names = SyntheticNames::intern(source);
    let mut chain: Vec<&mut FnState> = Vec::new();
    resolve_function(&mut program.main, &mut chain, &names, source, &mut errors);
    debug!("resolver: finished, {} diagnostics recorded", errors.diagnostics().len());
    errors
}

/// A handful of reserved names used for hidden, non-user-addressable
/// locals (loop state) and for diagnostics that need to name the implicit
/// vararg parameter. Interned once per compilation.
struct SyntheticNames {
    for_step_state: InternedStr,
    for_each_state: InternedStr,
    args: InternedStr,
    self_kw: InternedStr,
}

impl SyntheticNames {
    fn intern(source: &mut Source) -> Self {
        Self {
            for_step_state: source.intern("$for_step"),
            for_each_state: source.intern("$for_each"),
            args: source.intern("args"),
            self_kw: source.intern("self"),
        }
    }
}

fn resolve_function(
    function: &mut Function,
    chain: &mut Vec<&mut FnState>,
    names: &SyntheticNames,
    source: &Source,
    errors: &mut ErrorSink,
) {
    log::trace!("resolver: entering function at sloc {} (depth {})", function.sloc, chain.len());
    let mut state = FnState::new(function.has_varargs, function.is_method);
    state.open_scope(false);

    if function.is_method {
        // `self` is referenced via the dedicated `NodeKind::SelfName`, never
        // through ordinary `Name` lookup, but it still occupies a real
        // local slot (register 0 at allocation time) so the IR builder can
        // read/capture it like any other local.
        let mut l = Local::new(names.self_kw);
        l.is_parameter = true;
        l.is_implicit_self = true;
        let idx = state.declare_local(names.self_kw, l);
        function.param_locals.push(idx);
    }

    let param_names: Vec<InternedStr> = function.params.clone();
    let mut param_locals = Vec::with_capacity(param_names.len());
    for name in &param_names {
        if state.lookup_local(*name).is_some() {
            errors.error(format!("redeclaration of '{}'", source.interned(*name)), function.sloc);
        }
        let mut l = Local::new(*name);
        l.is_parameter = true;
        let idx = state.declare_local(*name, l);
        param_locals.push(idx);
    }
    function.param_locals.extend(param_locals);

    if function.has_varargs {
        // The vararg parameter has no user-visible name and is reachable
        // only through the bare `...` expression (`NodeKind::Vararg`), so
        // it is not entered into any scope's name map.
        let mut l = Local::new(names.args);
        l.is_parameter = true;
        l.is_vararg = true;
        state.push_hidden_local(l);
    }

    let Function { nodes, functions, body, .. } = function;
    resolve_node(nodes, functions, *body, &mut state, chain, names, source, errors);

    state.close_scope();
    finalize(function, state);
}

/// Resolve one node and, for expressions, nothing is pushed/returned: the
/// `Name`-family node kinds are classified in place (their `kind` field is
/// overwritten), mirroring ("the resolver rewrites the AST
/// kind of the identifier").
fn resolve_node(
    nodes: &mut Vec<Node>,
    functions: &mut Vec<Function>,
    id: NodeId,
    state: &mut FnState,
    chain: &mut Vec<&mut FnState>,
    names: &SyntheticNames,
    source: &Source,
    errors: &mut ErrorSink,
) {
    let sloc = nodes[id as usize].sloc;
    // Take the node's kind out so we can recurse into its children (which
    // may themselves rewrite `nodes`) without holding a borrow on the slot
    // we're about to overwrite.
    let kind = std::mem::replace(&mut nodes[id as usize].kind, NodeKind::Null);
    let new_kind = match kind {
        NodeKind::Null | NodeKind::True | NodeKind::False | NodeKind::Number(_) | NodeKind::StringLit(_) => kind,

        NodeKind::Name(name) => resolve_name(name, sloc, state, chain, source, errors),

        NodeKind::SelfName => {
            if !has_self_in_chain(state, chain) {
                errors.error("use of 'self' outside of a method", sloc);
            }
            NodeKind::SelfName
        }
        NodeKind::SuperName => {
            if !state.is_method {
                if chain.iter().any(|s| s.is_method) {
                    errors.error("'super' cannot be captured by a closure", sloc);
                } else {
                    errors.error("use of 'super' outside of a method", sloc);
                }
            }
            NodeKind::SuperName
        }

        NodeKind::Vararg => {
            if !state.has_varargs {
                errors.error("variable argument parameter 'args' cannot be captured by a closure", sloc);
            }
            NodeKind::Vararg
        }
        NodeKind::Unpack(e) => {
            resolve_node(nodes, functions, e, state, chain, names, source, errors);
            NodeKind::Unpack(e)
        }

        NodeKind::Unary { op, operand } => {
            resolve_node(nodes, functions, operand, state, chain, names, source, errors);
            NodeKind::Unary { op, operand }
        }
        NodeKind::Binary { op, lhs, rhs } => {
            resolve_node(nodes, functions, lhs, state, chain, names, source, errors);
            resolve_node(nodes, functions, rhs, state, chain, names, source, errors);
            NodeKind::Binary { op, lhs, rhs }
        }
        NodeKind::Logical { op, lhs, rhs } => {
            resolve_node(nodes, functions, lhs, state, chain, names, source, errors);
            resolve_node(nodes, functions, rhs, state, chain, names, source, errors);
            NodeKind::Logical { op, lhs, rhs }
        }
        NodeKind::CompareChain { operands, ops } => {
            for &operand in &operands {
                resolve_node(nodes, functions, operand, state, chain, names, source, errors);
            }
            NodeKind::CompareChain { operands, ops }
        }
        NodeKind::Ternary { cond, then_expr, else_expr } => {
            resolve_node(nodes, functions, cond, state, chain, names, source, errors);
            resolve_node(nodes, functions, then_expr, state, chain, names, source, errors);
            resolve_node(nodes, functions, else_expr, state, chain, names, source, errors);
            NodeKind::Ternary { cond, then_expr, else_expr }
        }

        NodeKind::Key { obj, name } => {
            resolve_node(nodes, functions, obj, state, chain, names, source, errors);
            NodeKind::Key { obj, name }
        }
        NodeKind::Index { obj, index } => {
            resolve_node(nodes, functions, obj, state, chain, names, source, errors);
            resolve_node(nodes, functions, index, state, chain, names, source, errors);
            NodeKind::Index { obj, index }
        }
        NodeKind::Call { callee, args } => {
            resolve_node(nodes, functions, callee, state, chain, names, source, errors);
            for a in &args {
                resolve_node(nodes, functions, *a, state, chain, names, source, errors);
            }
            NodeKind::Call { callee, args }
        }
        NodeKind::MethodCall { obj, name, args } => {
            resolve_node(nodes, functions, obj, state, chain, names, source, errors);
            for a in &args {
                resolve_node(nodes, functions, *a, state, chain, names, source, errors);
            }
            NodeKind::MethodCall { obj, name, args }
        }

        NodeKind::ArrayLit { elements } => {
            for e in &elements {
                resolve_node(nodes, functions, *e, state, chain, names, source, errors);
            }
            NodeKind::ArrayLit { elements }
        }
        NodeKind::TableLit { entries } => {
            for (k, v) in &entries {
                resolve_node(nodes, functions, *k, state, chain, names, source, errors);
                resolve_node(nodes, functions, *v, state, chain, names, source, errors);
            }
            NodeKind::TableLit { entries }
        }
        NodeKind::ObjectLit { prototype, keys, members } => {
            if let Some(p) = prototype {
                resolve_node(nodes, functions, p, state, chain, names, source, errors);
            }
            for m in &members {
                resolve_node(nodes, functions, *m, state, chain, names, source, errors);
            }
            NodeKind::ObjectLit { prototype, keys, members }
        }

        NodeKind::FunctionLit(fid) => {
            resolve_nested(functions, fid, state, chain, names, source, errors);
            NodeKind::FunctionLit(fid)
        }

        NodeKind::Yield { args } => {
            for a in &args {
                resolve_node(nodes, functions, *a, state, chain, names, source, errors);
            }
            NodeKind::Yield { args }
        }
        NodeKind::YieldFor { iterable } => {
            resolve_node(nodes, functions, iterable, state, chain, names, source, errors);
            NodeKind::YieldFor { iterable }
        }

        NodeKind::ExprStmt(e) => {
            resolve_node(nodes, functions, e, state, chain, names, source, errors);
            NodeKind::ExprStmt(e)
        }
        NodeKind::VarDecl { names: decl_names, mut locals, init } => {
            if let Some(init_id) = init {
                resolve_node(nodes, functions, init_id, state, chain, names, source, errors);
            }
            for (slot, name) in locals.iter_mut().zip(decl_names.iter()) {
                check_redeclaration(state, *name, sloc, source, errors);
                *slot = state.declare_local(*name, Local::new(*name));
            }
            NodeKind::VarDecl { names: decl_names, locals, init }
        }
        NodeKind::Assign { op, target, value } => {
            resolve_node(nodes, functions, value, state, chain, names, source, errors);
            resolve_node(nodes, functions, target, state, chain, names, source, errors);
            if let NodeKind::GlobalName(name) = &nodes[target as usize].kind {
                errors.error(
                    format!("cannot assign to undeclared identifier '{}'", source.interned(*name)),
                    sloc,
                );
            }
            if matches!(nodes[target as usize].kind, NodeKind::SuperName) {
                errors.error("cannot assign to 'super'", sloc);
            }
            NodeKind::Assign { op, target, value }
        }
        NodeKind::MultiAssign { values, targets } => {
            for v in &values {
                resolve_node(nodes, functions, *v, state, chain, names, source, errors);
            }
            for t in &targets {
                resolve_node(nodes, functions, *t, state, chain, names, source, errors);
                if let NodeKind::GlobalName(name) = &nodes[*t as usize].kind {
                    errors.error(
                        format!("cannot assign to undeclared identifier '{}'", source.interned(*name)),
                        sloc,
                    );
                }
                if matches!(nodes[*t as usize].kind, NodeKind::SuperName) {
                    errors.error("cannot assign to 'super'", sloc);
                }
            }
            NodeKind::MultiAssign { targets, values }
        }
        NodeKind::Block(stmts) => {
            let scope_seq = state.open_scope(false);
            for s in &stmts {
                resolve_node(nodes, functions, *s, state, chain, names, source, errors);
            }
            let scope = state.close_scope();
            state.record_close_target(id, scope.parent_seq.unwrap_or(scope_seq));
            NodeKind::Block(stmts)
        }
        NodeKind::If { cond, then_block, else_block } => {
            resolve_node(nodes, functions, cond, state, chain, names, source, errors);
            resolve_node(nodes, functions, then_block, state, chain, names, source, errors);
            if let Some(e) = else_block {
                resolve_node(nodes, functions, e, state, chain, names, source, errors);
            }
            NodeKind::If { cond, then_block, else_block }
        }
        NodeKind::ForRange { var, local, start, stop, step, body } => {
            resolve_node(nodes, functions, start, state, chain, names, source, errors);
            resolve_node(nodes, functions, stop, state, chain, names, source, errors);
            if let Some(s) = step {
                resolve_node(nodes, functions, s, state, chain, names, source, errors);
            }
            let outer_seq = state.current_scope_seq();
            let loop_seq = state.open_scope(true);
            let mut hidden = Local::new(names.for_step_state);
            hidden.is_parameter = false;
            state.push_hidden_local(hidden);
            let local_idx = state.declare_local(var, Local::new(var));
            state.loop_stack.push(LoopFrame { outer_scope_seq: outer_seq, loop_scope_seq: loop_seq });
            resolve_node(nodes, functions, body, state, chain, names, source, errors);
            state.loop_stack.pop();
            let scope = state.close_scope();
            state.record_close_target(id, scope.parent_seq.unwrap_or(outer_seq));
            NodeKind::ForRange { var, local: local_idx, start, stop, step, body }
        }
        NodeKind::ForEach { var, local, iterable, body } => {
            resolve_node(nodes, functions, iterable, state, chain, names, source, errors);
            let outer_seq = state.current_scope_seq();
            let loop_seq = state.open_scope(true);
            let mut hidden = Local::new(names.for_each_state);
            hidden.is_parameter = false;
            state.push_hidden_local(hidden);
            let local_idx = state.declare_local(var, Local::new(var));
            state.loop_stack.push(LoopFrame { outer_scope_seq: outer_seq, loop_scope_seq: loop_seq });
            resolve_node(nodes, functions, body, state, chain, names, source, errors);
            state.loop_stack.pop();
            let scope = state.close_scope();
            state.record_close_target(id, scope.parent_seq.unwrap_or(outer_seq));
            NodeKind::ForEach { var, local: local_idx, iterable, body }
        }
        NodeKind::While { cond, body } => {
            resolve_node(nodes, functions, cond, state, chain, names, source, errors);
            let outer_seq = state.current_scope_seq();
            let loop_seq = state.open_scope(true);
            state.loop_stack.push(LoopFrame { outer_scope_seq: outer_seq, loop_scope_seq: loop_seq });
            resolve_node(nodes, functions, body, state, chain, names, source, errors);
            state.loop_stack.pop();
            let scope = state.close_scope();
            state.record_close_target(id, scope.parent_seq.unwrap_or(outer_seq));
            NodeKind::While { cond, body }
        }
        NodeKind::Repeat { body, until } => {
            let outer_seq = state.current_scope_seq();
            let loop_seq = state.open_scope(true);
            state.scopes.last_mut().unwrap().is_repeat_until = true;
            state.loop_stack.push(LoopFrame { outer_scope_seq: outer_seq, loop_scope_seq: loop_seq });
            resolve_node(nodes, functions, body, state, chain, names, source, errors);
            state.in_until_clause = true;
            resolve_node(nodes, functions, until, state, chain, names, source, errors);
            state.in_until_clause = false;
            state.loop_stack.pop();
            let scope = state.close_scope();
            state.record_close_target(id, scope.parent_seq.unwrap_or(outer_seq));
            NodeKind::Repeat { body, until }
        }
        NodeKind::Break => {
            match state.loop_stack.last() {
                None => errors.error("invalid 'break' outside of loop", sloc),
                Some(frame) => state.record_close_target(id, frame.outer_scope_seq),
            }
            NodeKind::Break
        }
        NodeKind::Continue => {
            match state.loop_stack.last() {
                None => errors.error("invalid 'continue' outside of loop", sloc),
                Some(frame) => {
                    let target = frame.outer_scope_seq;
                    state.record_close_target(id, target);
                    state.mark_continue_in_nearest_loop();
                }
            }
            NodeKind::Continue
        }
        NodeKind::Return(values) => {
            for v in &values {
                resolve_node(nodes, functions, *v, state, chain, names, source, errors);
            }
            NodeKind::Return(values)
        }
        NodeKind::Throw(e) => {
            resolve_node(nodes, functions, e, state, chain, names, source, errors);
            NodeKind::Throw(e)
        }
        NodeKind::FunctionDecl { name, local, function: fid } => {
            check_redeclaration(state, name, sloc, source, errors);
            let local_idx = state.declare_local(name, Local::new(name));
            resolve_nested(functions, fid, state, chain, names, source, errors);
            NodeKind::FunctionDecl { name, local: local_idx, function: fid }
        }

        // Already resolved (shouldn't occur on a first pass, kept so a
        // future incremental re-resolve would be a no-op).
        other @ (NodeKind::LocalName(_) | NodeKind::GlobalName(_) | NodeKind::OutenvName(_)) => other,
    };
    nodes[id as usize].kind = new_kind;
}

fn resolve_nested(
    functions: &mut Vec<Function>,
    fid: FunctionId,
    state: &mut FnState,
    chain: &mut Vec<&mut FnState>,
    names: &SyntheticNames,
    source: &Source,
    errors: &mut ErrorSink,
) {
    chain.push(state);
    resolve_function(&mut functions[fid as usize], chain, names, source, errors);
    chain.pop();
}

fn has_self_in_chain(state: &FnState, chain: &[&mut FnState]) -> bool {
    state.is_method || chain.iter().any(|s| s.is_method)
}

fn check_redeclaration(state: &FnState, name: InternedStr, sloc: u32, source: &Source, errors: &mut ErrorSink) {
    if let Some(idx) = state.lookup_local(name) {
        if state.locals[idx as usize].is_captured {
            errors.error(format!("redeclaration of captured variable '{}'", source.interned(name)), sloc);
        } else {
            errors.error(format!("redeclaration of variable '{}'", source.interned(name)), sloc);
        }
    }
}

/// Look up `name` in the current function, then walk outward through
/// `chain` (innermost ancestor first), building the outenv chain on
/// success. Falls back to `GlobalName`.
fn resolve_name(
    name: InternedStr,
    sloc: u32,
    state: &mut FnState,
    chain: &mut Vec<&mut FnState>,
    source: &Source,
    errors: &mut ErrorSink,
) -> NodeKind {
    if let Some(idx) = state.lookup_local(name) {
        if state.in_until_clause && state.is_post_continue_in_nearest_repeat(name) {
            errors.error(
                "'until' condition cannot use a variable declared after 'continue' in the same repeat loop",
                sloc,
            );
        }
        return NodeKind::LocalName(idx);
    }

    // Walk outward: chain.last() is the immediate parent.
    for anc_idx in (0..chain.len()).rev() {
        if let Some(local_idx) = chain[anc_idx].lookup_local(name) {
            if chain[anc_idx].locals[local_idx as usize].is_vararg {
                errors.error("variable argument parameter 'args' cannot be captured by a closure", sloc);
                return NodeKind::GlobalName(name);
            }
            let owner_scope_seq = chain[anc_idx].owner_scope_of(local_idx);
            chain[anc_idx].locals[local_idx as usize].is_captured = true;
            assign_varenv_slot(chain[anc_idx], owner_scope_seq, local_idx);
            chain[anc_idx].captures.push(CaptureRecord { owner_scope_seq, local_index: local_idx });

            let outenv_idx = build_outenv_chain(chain, anc_idx, local_idx, &mut state.outenvs);
            return NodeKind::OutenvName(outenv_idx);
        }
    }

    NodeKind::GlobalName(name)
}

fn assign_varenv_slot(state: &mut FnState, owner_scope_seq: u32, local_idx: u32) {
    if state.locals[local_idx as usize].varenv_slot.is_some() {
        return;
    }
    if let Some(scope) = state.scopes.iter_mut().find(|s| s.seq == owner_scope_seq) {
        let slot = scope.varenv_next;
        scope.varenv_next += 1;
        state.locals[local_idx as usize].varenv_slot = Some(slot);
    } else {
        state.locals[local_idx as usize].varenv_slot = Some(0);
    }
}

fn build_outenv_chain(
    chain: &mut Vec<&mut FnState>,
    anc_idx: usize,
    local_idx: u32,
    current_outenvs: &mut Vec<OutEnv>,
) -> u32 {
    let mut prev_source = OutEnvSource::ParentLocal(local_idx);
    for i in (anc_idx + 1)..chain.len() {
        let outenvs = &mut chain[i].outenvs;
        let idx = find_or_insert_outenv(outenvs, prev_source);
        prev_source = OutEnvSource::ParentOutEnv(idx);
    }
    find_or_insert_outenv(current_outenvs, prev_source)
}

fn find_or_insert_outenv(outenvs: &mut Vec<OutEnv>, source: OutEnvSource) -> u32 {
    if let Some(idx) = outenvs.iter().position(|o| o.source == source) {
        return idx as u32;
    }
    outenvs.push(OutEnv { source });
    (outenvs.len() - 1) as u32
}

/// Write the function's resolved state back into the AST node and compute
/// final upstack positions and close-depths from the discovery-ordered
/// capture list.
fn finalize(function: &mut Function, mut state: FnState) {
    // Outer-scope captures must precede inner-scope ones in the upstack;
    // within the same owner scope, preserve discovery order (stable sort).
    let scope_depth: std::collections::HashMap<u32, usize> = {
        let mut depth = std::collections::HashMap::new();
        for (i, scope_seq) in all_scope_seqs_in_discovery_order(&state).into_iter().enumerate() {
            depth.insert(scope_seq, i);
        }
        depth
    };
    let mut order: Vec<usize> = (0..state.captures.len()).collect();
    order.sort_by_key(|&i| {
        let rec = state.captures[i];
        *scope_depth.get(&rec.owner_scope_seq).unwrap_or(&usize::MAX)
    });

    let mut max_upstack: u32 = 0;
    for (upstack_index, &capture_i) in order.iter().enumerate() {
        let rec = state.captures[capture_i];
        state.locals[rec.local_index as usize].upstack_index = Some(upstack_index as u32);
        max_upstack = max_upstack.max(upstack_index as u32 + 1);
    }

    // Close-depth per scope: how many upstack slots are occupied by
    // captures owned by that scope or any of its ancestors. Since scope
    // identity (`seq`) values were popped off `state.scopes` as we went,
    // recompute ancestry from `close_targets`' recorded parent chains is
    // unnecessary: every capture's owner scope participates in exactly
    // one position in `order`, and a close-target's depth is just the
    // count of captures whose upstack_index is assigned and whose owner
    // scope is an ancestor-or-self of the target scope. Because we only
    // ever recorded *parent* scope seqs as close targets (the scope that
    // remains open), and captures are ordered by scope nesting depth
    // already, the depth for a given target scope is simply the number of
    // captures at-or-before the target's own depth bucket.
    let target_depth = |target_scope_seq: u32| -> u32 {
        let target_rank = scope_depth.get(&target_scope_seq).copied().unwrap_or(usize::MAX);
        order
            .iter()
            .filter(|&&capture_i| {
                let rec = state.captures[capture_i];
                let rank = scope_depth.get(&rec.owner_scope_seq).copied().unwrap_or(usize::MAX);
                rank <= target_rank
            })
            .count() as u32
    };

    let mut close_index = vec![0u32; function.nodes.len()];
    for (node, target_scope_seq) in &state.close_targets {
        close_index[*node as usize] = target_depth(*target_scope_seq);
    }

    function.locals = state.locals;
    function.outenvs = state.outenvs;
    function.max_upstack_size = max_upstack;
    function.close_index = close_index;
}

/// All scope seqs that existed during resolution, in the order they were
/// opened (`seq` is already a monotonically increasing allocation order,
/// so this is just `0..next_seq`), used to rank owner scopes from
/// outermost to innermost for upstack ordering purposes. Sibling scopes
/// (e.g. an `if`'s `then` vs `else` branch) get distinct but incomparable
/// real-world positions; ranking them by allocation order is a harmless
/// total order for this purpose since a single control-flow path is live
/// at a time.
fn all_scope_seqs_in_discovery_order(state: &FnState) -> Vec<u32> {
    let max_seq = state
        .captures
        .iter()
        .map(|c| c.owner_scope_seq)
        .max()
        .map(|m| m + 1)
        .unwrap_or(0)
        .max(state.close_targets.iter().map(|(_, s)| *s + 1).max().unwrap_or(0));
    (0..max_seq).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbc_parser::Parser;

    fn resolve(text: &str) -> (Program, ErrorSink) {
        let mut source = Source::new("t.kf", text);
        let (mut program, mut errors) = Parser::new(&mut source).parse_program();
        errors.extend(resolve_program(&mut program, &mut source));
        (program, errors)
    }

    fn block_stmts(function: &Function) -> &[NodeId] {
        match &function.node(function.body).kind {
            NodeKind::Block(stmts) => stmts,
            _ => panic!("expected block"),
        }
    }

    #[test]
    fn top_level_var_is_a_local() {
        let (program, errors) = resolve("var x = 1;");
        assert!(errors.is_empty());
        let stmts = block_stmts(&program.main);
        match &program.main.node(stmts[0]).kind {
            NodeKind::VarDecl { locals, .. } => assert_eq!(locals, &[0]),
            other => panic!("expected VarDecl, got {other:?}"),
        }
    }

    #[test]
    fn undeclared_name_is_global() {
        let (program, errors) = resolve("print(1);");
        assert!(errors.is_empty());
        let stmts = block_stmts(&program.main);
        let call = &program.main.node(stmts[0]).kind;
        let NodeKind::ExprStmt(e) = call else { panic!("expected ExprStmt") };
        match &program.main.node(*e).kind {
            NodeKind::Call { callee, .. } => match &program.main.node(*callee).kind {
                NodeKind::GlobalName(_) => {}
                other => panic!("expected GlobalName callee, got {other:?}"),
            },
            other => panic!("expected Call, got {other:?}"),
        }
    }

    #[test]
    fn outer_local_read_from_nested_function_becomes_outenv() {
        let (program, errors) = resolve(
            r#"
            var x = 1;
            def f()
                return x;
            end
            "#,
        );
        assert!(errors.is_empty());
        let f = &program.main.functions[0];
        match &f.node(f.body).kind {
            NodeKind::Block(stmts) => match &f.node(stmts[0]).kind {
                NodeKind::Return(values) => match &f.node(values[0]).kind {
                    NodeKind::OutenvName(0) => {}
                    other => panic!("expected OutenvName(0), got {other:?}"),
                },
                other => panic!("expected Return, got {other:?}"),
            },
            other => panic!("expected Block, got {other:?}"),
        }
        assert!(program.main.locals[0].is_captured);
        assert_eq!(program.main.locals[0].upstack_index, Some(0));
        assert_eq!(program.main.max_upstack_size, 1);
    }

    #[test]
    fn redeclaration_of_plain_local_is_an_error() {
        let (_, errors) = resolve("var x = 1; var x = 2;");
        assert!(errors.has_errors());
        assert!(errors.diagnostics()[0].message.contains("redeclaration of variable"));
    }

    #[test]
    fn redeclaration_of_captured_local_has_a_distinct_message() {
        let (_, errors) = resolve(
            r#"
            var x = 1;
            def f()
                return x;
            end
            var x = 2;
            "#,
        );
        assert!(errors.has_errors());
        assert!(errors
            .diagnostics()
            .iter()
            .any(|d| d.message.contains("redeclaration of captured variable")));
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let (_, errors) = resolve("break;");
        assert!(errors.has_errors());
        assert!(errors.diagnostics()[0].message.contains("'break'"));
    }

    #[test]
    fn continue_outside_loop_is_an_error() {
        let (_, errors) = resolve("continue;");
        assert!(errors.has_errors());
        assert!(errors.diagnostics()[0].message.contains("'continue'"));
    }

    #[test]
    fn break_and_continue_inside_loops_are_fine() {
        let (_, errors) = resolve(
            r#"
            for i = 1:10
                if i > 5
                    break;
                end
                continue;
            end
            "#,
        );
        assert!(errors.is_empty());
    }

    #[test]
    fn assignment_to_undeclared_global_is_an_error() {
        let (_, errors) = resolve("y = 1;");
        assert!(errors.has_errors());
        assert!(errors.diagnostics()[0].message.contains("cannot assign to undeclared identifier"));
    }

    #[test]
    fn assignment_to_declared_local_is_fine() {
        let (_, errors) = resolve("var y = 1; y = 2;");
        assert!(errors.is_empty());
    }

    #[test]
    fn self_outside_method_is_an_error() {
        let (_, errors) = resolve(
            r#"
            def f()
                return self;
            end
            "#,
        );
        assert!(errors.has_errors());
        assert!(errors.diagnostics()[0].message.contains("'self'"));
    }

    #[test]
    fn self_inside_object_method_is_fine() {
        let (_, errors) = resolve(
            r#"
            var o = object
                m()
                    return self;
                end
            end;
            "#,
        );
        assert!(errors.is_empty());
    }

    #[test]
    fn super_cannot_be_captured_by_a_nested_closure() {
        let (_, errors) = resolve(
            r#"
            var o = object
                m()
                    def inner()
                        return super;
                    end
                    return inner;
                end
            end;
            "#,
        );
        assert!(errors.has_errors());
        assert!(errors.diagnostics()[0].message.contains("'super' cannot be captured"));
    }

    #[test]
    fn vararg_cannot_be_captured_by_a_nested_closure() {
        let (_, errors) = resolve(
            r#"
            def outer(...)
                def inner()
                    return ...;
                end
                return inner;
            end
            "#,
        );
        assert!(errors.has_errors());
        assert!(errors.diagnostics()[0].message.contains("cannot be captured by a closure"));
    }

    #[test]
    fn until_condition_cannot_use_a_local_declared_after_continue() {
        let (_, errors) = resolve(
            r#"
            var i = 0;
            repeat
                i = i + 1;
                if i > 10
                    continue;
                end
                var j = i;
            until j > 5;
            "#,
        );
        assert!(errors.has_errors());
        assert!(errors.diagnostics()[0].message.contains("after 'continue'"));
    }

    #[test]
    fn until_condition_can_use_a_local_declared_before_continue() {
        let (_, errors) = resolve(
            r#"
            var i = 0;
            repeat
                var j = i;
                i = i + 1;
                if i > 10
                    continue;
                end
            until j > 5;
            "#,
        );
        assert!(errors.is_empty());
    }

    #[test]
    fn make_counter_closure_gets_its_own_upstack_slot_per_instance() {
        // Two locals captured at different nesting depths inside one
        // closure: an outer one and one from the immediately enclosing
        // scope; upstack indices must rank outer-before-inner.
        let (program, errors) = resolve(
            r#"
            def make_counter(start)
                var count = start;
                def bump()
                    count = count + 1;
                    return count;
                end
                return bump;
            end
            "#,
        );
        assert!(errors.is_empty());
        let make_counter = &program.main.functions[0];
        // `count`'s local index is 0 (param_locals[0] is the hidden... no,
        // make_counter isn't a method, so local 0 is the `start` param).
        let count_idx = make_counter
            .locals
            .iter()
            .position(|l| l.is_captured)
            .expect("count should be captured");
        assert_eq!(make_counter.locals[count_idx].upstack_index, Some(0));
        assert_eq!(make_counter.max_upstack_size, 1);

        let bump = &make_counter.functions[0];
        assert_eq!(bump.outenvs.len(), 1);
        match bump.outenvs[0].source {
            OutEnvSource::ParentLocal(idx) => assert_eq!(idx, count_idx as u32),
            other => panic!("expected ParentLocal, got {other:?}"),
        }
    }

    #[test]
    fn capture_of_a_capture_chains_through_grandparent_outenv() {
        let (program, errors) = resolve(
            r#"
            def a()
                var x = 1;
                def b()
                    def c()
                        return x;
                    end
                    return c;
                end
                return b;
            end
            "#,
        );
        assert!(errors.is_empty());
        let a = &program.main.functions[0];
        let b = &a.functions[0];
        let c = &b.functions[0];
        assert_eq!(b.outenvs.len(), 1);
        assert!(matches!(b.outenvs[0].source, OutEnvSource::ParentLocal(_)));
        assert_eq!(c.outenvs.len(), 1);
        assert!(matches!(c.outenvs[0].source, OutEnvSource::ParentOutEnv(0)));
    }

    #[test]
    fn multi_assign_resolves_every_target_and_value() {
        let (program, errors) = resolve("var a = 0; var b = 0; a, b = b, a;");
        assert!(errors.is_empty());
        let stmts = block_stmts(&program.main);
        match &program.main.node(stmts[2]).kind {
            NodeKind::MultiAssign { targets, values } => {
                assert!(matches!(program.main.node(targets[0]).kind, NodeKind::LocalName(0)));
                assert!(matches!(program.main.node(targets[1]).kind, NodeKind::LocalName(1)));
                assert!(matches!(program.main.node(values[0]).kind, NodeKind::LocalName(1)));
                assert!(matches!(program.main.node(values[1]).kind, NodeKind::LocalName(0)));
            }
            other => panic!("expected MultiAssign, got {other:?}"),
        }
    }

    #[test]
    fn multi_assign_to_an_undeclared_global_is_an_error() {
        let (_, errors) = resolve("var a = 0; a, undeclared_sink = 1, 2;");
        assert!(errors.has_errors());
    }
}
