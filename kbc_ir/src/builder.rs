//! Lowers a resolved AST (`kbc_parser::ast`) to SSA IR.
//!
//! The source language has no `goto`; every merge point (an `if`'s join,
//! a loop header, a loop exit) is introduced by a structured construct the
//! builder recognizes directly, so SSA construction never needs general
//! dominance computation. It still needs the classic incomplete-ϕ trick for
//! loop headers: a `while`/`for`/`repeat` header is read from before its
//! body (and the body's back edge) has been built, so a header is left
//! "unsealed" — new `PHI` operands are appended as they're discovered, and
//! the header is "sealed" once every predecessor, including the back edge,
//! is known.

use crate::function::{self as ir, BlockKind};
use crate::op::{Opcode, Operand, INVALID};
use kbc_common::diagnostics::ErrorSink;
use kbc_common::source::{SrcLoc, Source};
use kbc_parser::ast::{self, BinaryOp, LogicalOp, NodeId, NodeKind, OutEnvSource, UnaryOp};
use log::debug;
use std::collections::HashMap;

pub fn build_program(program: &ast::Program, source: &mut Source, errors: &mut ErrorSink) -> ir::Module {
    debug!("ir builder: starting pass over '{}'", source.name());
    let module = ir::Module { main: build_function(&program.main, source, errors) };
    debug!("ir builder: finished");
    module
}

pub fn build_function(function: &ast::Function, source: &mut Source, errors: &mut ErrorSink) -> ir::Function {
    debug!("ir builder: lowering function at sloc {}", function.sloc);
    let mut b = FnBuilder::new(function, source, errors);
    b.run();
    b.finish()
}

/// Per-block bookkeeping used only during construction; not part of the
/// emitted `ir::Function`.
struct BlockState {
    preds: Vec<u32>,
    sealed: bool,
    current_def: HashMap<u32, Operand>,
    incomplete_phis: Vec<(u32, u32)>, // (local, phi op index)
}

impl BlockState {
    fn new() -> Self {
        Self { preds: Vec::new(), sealed: false, current_def: HashMap::new(), incomplete_phis: Vec::new() }
    }
}

struct LoopCtx {
    header: u32,
    /// Scope close-depth recorded by the resolver at the loop's own AST node
    ///; used to parameterize `CLOSE_UPSTACK`
    /// on `break`/`continue`.
    close_depth: u32,
    /// (jump op, block the jump sits in) so the join point can both patch
    /// the jump target and register the predecessor edge.
    break_jumps: Vec<(u32, u32)>,
    continue_jumps: Vec<(u32, u32)>,
}

struct FnBuilder<'a> {
    af: &'a ast::Function,
    source: &'a mut Source,
    errors: &'a mut ErrorSink,
    out: ir::Function,
    blocks: Vec<BlockState>,
    current: u32,
    loops: Vec<LoopCtx>,
    /// Upstack depth currently "open" at the builder's cursor, used to emit
    /// `CLOSE_UPSTACK` before any jump that crosses a capturing scope.
    upstack_depth: u32,
    /// Jump ops (the fallthrough-out-of-an-if-branch case) whose target
    /// block isn't known yet, resolved at the enclosing `if`'s join point.
    pending_jumps: Vec<(u32, JumpSlot)>,
}

impl<'a> FnBuilder<'a> {
    fn new(af: &'a ast::Function, source: &'a mut Source, errors: &'a mut ErrorSink) -> Self {
        let name = af.name;
        let mut out = ir::Function::new(name, af.sloc, af.param_locals.len() as u32, af.has_varargs, af.is_method);
        out.max_upstack_size = af.max_upstack_size;
        // The hidden `$for_step`/`$for_each` loop-state slots and the
        // synthetic vararg slot never had a user-facing declaration; keep
        // them out of the debug variable table.
        out.local_names = af
            .locals
            .iter()
            .map(|l| if l.is_vararg || source.interned(l.name).starts_with('$') { None } else { Some(l.name) })
            .collect();
        Self {
            af,
            source,
            errors,
            out,
            blocks: Vec::new(),
            current: 0,
            loops: Vec::new(),
            upstack_depth: 0,
            pending_jumps: Vec::new(),
        }
    }

    fn run(&mut self) {
        let entry = self.new_block(BlockKind::Normal);
        self.seal_block(entry);
        self.current = entry;

        for (param_slot, &local_idx) in self.af.param_locals.iter().enumerate() {
            let op = self.out.push_op(Opcode::Ref, &[Operand::Local(param_slot as u32)], self.af.sloc);
            self.out.ops[op as usize].local = Some(local_idx);
            self.write_local(entry, local_idx, Operand::Op(op));
        }
        // Every other declared local (the implicit vararg slot, loop-state
        // locals declared lazily at their loop) starts undefined; reads
        // before a `var`'s initializer runs only occur on a path where the
        // declaration didn't execute, and fall back to `null`, the
        // language's standard "nothing here yet" value.

        self.lower_stmt(self.af.body);
        if !self.current_block_has_terminator() {
            self.emit_return(&[], self.af.sloc);
        }
        self.out.close_block(self.current);
        self.finalize_predecessors();
    }

    /// Copy each block's accumulated predecessor list (tracked in
    /// `BlockState` for SSA sealing) into the IR's own `preceding` slab, so
    /// `Function::predecessors_of` — which `liveness.rs` and `emit.rs` both
    /// rely on to walk a ϕ/REF's operand list back to its source block —
    /// sees the same edges the builder used to order those operands.
    fn finalize_predecessors(&mut self) {
        for b in 0..self.blocks.len() {
            let preds = self.blocks[b].preds.clone();
            self.out.set_predecessors(b as u32, &preds);
        }
    }

    /// Nested closures are built eagerly, at the `FunctionLit`/`FunctionDecl`
    /// node that references them (see `lower_function_lit`), so by the time
    /// `run` returns, `self.out.nested` is already complete.
    fn finish(self) -> ir::Function {
        self.out
    }

    // ---- block/SSA plumbing ----

    fn new_block(&mut self, kind: BlockKind) -> u32 {
        let idx = self.out.open_block(kind);
        self.blocks.push(BlockState::new());
        idx
    }

    fn add_edge(&mut self, from: u32, to: u32) {
        self.blocks[to as usize].preds.push(from);
    }

    fn seal_block(&mut self, block: u32) {
        if self.blocks[block as usize].sealed {
            return;
        }
        self.blocks[block as usize].sealed = true;
        let pending = std::mem::take(&mut self.blocks[block as usize].incomplete_phis);
        for (local, phi) in pending {
            let preds = self.blocks[block as usize].preds.clone();
            let operands: Vec<Operand> = preds.iter().map(|&p| self.read_local(p, local)).collect();
            self.out.fill_deferred_operands(phi, &operands);
        }
    }

    fn write_local(&mut self, block: u32, local: u32, value: Operand) {
        self.blocks[block as usize].current_def.insert(local, value);
    }

    fn read_local(&mut self, block: u32, local: u32) -> Operand {
        if let Some(v) = self.blocks[block as usize].current_def.get(&local) {
            return *v;
        }
        self.read_local_recursive(block, local)
    }

    fn read_local_recursive(&mut self, block: u32, local: u32) -> Operand {
        let sloc = self.current_sloc();
        if !self.blocks[block as usize].sealed {
            let phi = self.out.push_header_op_deferred(block, Opcode::Phi, local, sloc);
            self.blocks[block as usize].incomplete_phis.push((local, phi));
            self.write_local(block, local, Operand::Op(phi));
            return Operand::Op(phi);
        }
        let preds = self.blocks[block as usize].preds.clone();
        let value = match preds.len() {
            0 => Operand::Null,
            1 => {
                let v = self.read_local(preds[0], local);
                let r = self.out.push_header_op(block, Opcode::Ref, &[v], local, sloc);
                Operand::Op(r)
            }
            _ => {
                let phi = self.out.push_header_op_deferred(block, Opcode::Phi, local, sloc);
                self.write_local(block, local, Operand::Op(phi));
                let operands: Vec<Operand> = preds.iter().map(|&p| self.read_local(p, local)).collect();
                self.out.fill_deferred_operands(phi, &operands);
                Operand::Op(phi)
            }
        };
        self.write_local(block, local, value);
        value
    }

    fn current_block_has_terminator(&self) -> bool {
        let b = &self.out.blocks[self.current as usize];
        b.lower < self.out.ops.len() as u32 && self.out.ops.last().map(|op| op.opcode.is_terminator()).unwrap_or(false)
    }

    fn current_sloc(&self) -> SrcLoc {
        self.out.ops.last().map(|op| op.sloc).unwrap_or(self.af.sloc)
    }

    /// Switch the cursor to a freshly opened block, recording `self.current`
    /// as its (sole, for now) predecessor unless the caller wires up edges
    /// itself (loop headers with multiple predecessors).
    fn seal_and_enter(&mut self, block: u32) {
        self.seal_block(block);
        self.current = block;
    }

    // ---- statements ----

    fn lower_stmt(&mut self, id: NodeId) {
        let sloc = self.af.node(id).sloc;
        // The AST is borrowed for the whole function's lifetime (`self.af`),
        // so each arm below re-borrows `self.af.node(id).kind` directly
        // rather than through a helper that would need to clone the whole
        // (non-`Copy`) node.
        match &self.af.node(id).kind {
            NodeKind::ExprStmt(e) => {
                let e = *e;
                self.lower_expr(e);
            }
            NodeKind::VarDecl { locals, init, .. } => {
                let locals = locals.clone();
                let init = *init;
                match init {
                    Some(e) => {
                        let values = self.lower_expr_multi(e, locals.len());
                        for (local, value) in locals.iter().zip(values) {
                            self.write_local(self.current, *local, value);
                        }
                    }
                    None => {
                        let null_op = self.out.push_op(Opcode::Const, &[Operand::Null], sloc);
                        for local in &locals {
                            self.write_local(self.current, *local, Operand::Op(null_op));
                        }
                    }
                }
            }
            NodeKind::Assign { op, target, value } => {
                let (op, target, value) = (*op, *target, *value);
                self.lower_assign(op, target, value, sloc);
            }
            NodeKind::MultiAssign { targets, values } => {
                let (targets, values) = (targets.clone(), values.clone());
                self.lower_multi_assign(&targets, &values, sloc);
            }
            NodeKind::Block(stmts) => {
                let stmts = stmts.clone();
                let depth = self.af.close_index_of(id);
                let saved = self.upstack_depth;
                self.upstack_depth = self.upstack_depth.max(depth);
                for s in stmts {
                    self.lower_stmt(s);
                }
                if depth > saved {
                    self.out.push_op(Opcode::CloseUpstack, &[Operand::ImmediateI8(saved as i8)], sloc);
                }
                self.upstack_depth = saved;
            }
            NodeKind::If { cond, then_block, else_block } => {
                let (cond, then_block, else_block) = (*cond, *then_block, *else_block);
                self.lower_if(cond, then_block, else_block, sloc);
            }
            NodeKind::ForRange { local, start, stop, step, body, .. } => {
                let (local, start, stop, step, body) = (*local, *start, *stop, *step, *body);
                self.lower_for_range(id, local, start, stop, step, body, sloc);
            }
            NodeKind::ForEach { local, iterable, body, .. } => {
                let (local, iterable, body) = (*local, *iterable, *body);
                self.lower_for_each(id, local, iterable, body, sloc);
            }
            NodeKind::While { cond, body } => {
                let (cond, body) = (*cond, *body);
                self.lower_while(id, cond, body, sloc);
            }
            NodeKind::Repeat { body, until } => {
                let (body, until) = (*body, *until);
                self.lower_repeat(id, body, until, sloc);
            }
            NodeKind::Break => self.lower_break(id, sloc),
            NodeKind::Continue => self.lower_continue(id, sloc),
            NodeKind::Return(values) => {
                let values = values.clone();
                let vals: Vec<Operand> = values.iter().map(|&v| self.lower_expr(v)).collect();
                self.emit_return(&vals, sloc);
            }
            NodeKind::Throw(e) => {
                let e = *e;
                let v = self.lower_expr(e);
                self.out.push_op(Opcode::JumpThrow, &[v], sloc);
            }
            NodeKind::FunctionDecl { local, function, .. } => {
                let (local, function) = (*local, *function);
                let f = self.lower_function_lit(function, sloc);
                self.write_local(self.current, local, f);
            }
            other => unreachable!("not a statement node: {other:?}"),
        }
    }

    fn emit_return(&mut self, values: &[Operand], sloc: SrcLoc) {
        if self.upstack_depth > 0 {
            self.out.push_op(Opcode::CloseUpstack, &[Operand::ImmediateI8(0)], sloc);
        }
        self.out.push_op(Opcode::JumpReturn, values, sloc);
    }

    fn lower_assign(&mut self, op: Option<BinaryOp>, target: NodeId, value: NodeId, sloc: SrcLoc) {
        // The single-target shape, including the compound `op=` forms.
        // `a, b = 1, 2` is a distinct `MultiAssign` node; see
        // `lower_multi_assign`.
        let rhs_value = if let Some(binop) = op {
            let current = self.lower_expr(target);
            let rhs = self.lower_expr(value);
            self.emit_binary(binop, current, rhs, sloc)
        } else {
            self.lower_expr(value)
        };
        self.store_to(target, rhs_value, sloc);
    }

    /// `lhs1, ..., lhsN = rhs1, ..., rhsN`: every RHS is evaluated first,
    /// left to right, into temporaries (a plain `MOV` of each value keeps it
    /// alive across the stores that follow, so e.g. `a, b = b, a` swaps
    /// correctly instead of `a`'s new value leaking into `b`'s read), then
    /// every target is written in order. When a target's own value doesn't
    /// outlive the store immediately after it (the common case where no
    /// later RHS expression reads that target), its `MOV` is elided and the
    /// produced value is stored directly — this is the live-range
    /// shortening the evaluate-then-assign scheme allows for, done here as
    /// a simple "does any later source expression mention this target's
    /// local" check rather than full liveness.
    fn lower_multi_assign(&mut self, targets: &[NodeId], values: &[NodeId], sloc: SrcLoc) {
        let n = targets.len().min(values.len());
        let mut temporaries: Vec<Operand> = Vec::with_capacity(n);
        for (i, &value) in values.iter().enumerate().take(n) {
            let v = self.lower_expr(value);
            let needs_temp = (i + 1..n).any(|later| self.expr_reads_local_written_by(values[later], targets[i]));
            if needs_temp {
                temporaries.push(self.out.push_op(Opcode::Mov, &[v], sloc).into_op());
            } else {
                temporaries.push(v);
            }
        }
        for (&target, value) in targets.iter().zip(temporaries).take(n) {
            self.store_to(target, value, sloc);
        }
    }

    /// Conservative approximation used only to decide whether a
    /// multi-assignment RHS needs its own temporary: true if `expr` (or any
    /// of its subexpressions) reads the same local that `target` writes to.
    /// A false positive just costs an extra `MOV`; a false negative would
    /// be a correctness bug, so non-`LocalName` targets (globals, outenv
    /// slots, keys, indices) are always treated as possibly read, since
    /// aliasing through them can't be ruled out this cheaply.
    fn expr_reads_local_written_by(&self, expr: NodeId, target: NodeId) -> bool {
        let target_local = match &self.af.node(target).kind {
            NodeKind::LocalName(local) => *local,
            _ => return true,
        };
        let mut found = false;
        self.af.for_each_descendant(expr, &mut |n| {
            if let NodeKind::LocalName(local) = &self.af.node(n).kind {
                if *local == target_local {
                    found = true;
                }
            }
        });
        found
    }

    fn store_to(&mut self, target: NodeId, value: Operand, sloc: SrcLoc) {
        match &self.af.node(target).kind {
            NodeKind::LocalName(local) => {
                let local = *local;
                self.write_local(self.current, local, value);
            }
            NodeKind::OutenvName(idx) => {
                let idx = *idx;
                self.out.push_op(Opcode::SetOutenv, &[Operand::OutenvSlot(idx), value], sloc);
            }
            NodeKind::GlobalName(name) => {
                let name = *name;
                self.emit_set_global(name, value, sloc);
            }
            NodeKind::Key { obj, name } => {
                let (obj, name) = (*obj, *name);
                let o = self.lower_expr(obj);
                self.out.push_op(Opcode::SetKey, &[o, Operand::Selector(name), value], sloc);
            }
            NodeKind::Index { obj, index } => {
                let (obj, index) = (*obj, *index);
                let o = self.lower_expr(obj);
                let i = self.lower_expr(index);
                self.out.push_op(Opcode::SetIndex, &[o, i, value], sloc);
            }
            other => unreachable!("not an assignable target: {other:?}"),
        }
    }

    fn emit_set_global(&mut self, name: kbc_common::source::InternedStr, value: Operand, sloc: SrcLoc) {
        self.out.push_op(Opcode::SetKey, &[Operand::Null, Operand::Selector(name), value], sloc);
    }

    // ---- control flow ----

    fn lower_if(&mut self, cond: NodeId, then_block: NodeId, else_block: Option<NodeId>, sloc: SrcLoc) {
        let c = self.lower_expr(cond);
        let test = self.out.push_op(Opcode::JumpTest, &[c, Operand::Block(INVALID), Operand::Block(INVALID)], sloc);
        let then_bb = self.new_block(BlockKind::Normal);
        let else_bb = self.new_block(BlockKind::Normal);
        self.patch_jump_targets(test, then_bb, else_bb);
        self.add_edge(self.current, then_bb);
        self.add_edge(self.current, else_bb);
        self.out.close_block(self.current);

        self.seal_and_enter(then_bb);
        self.lower_stmt(then_block);
        let then_end = self.current;
        let then_fallthrough = !self.current_block_has_terminator();
        if then_fallthrough {
            let j = self.out.push_op(Opcode::Jump, &[Operand::Block(INVALID)], sloc);
            self.out.close_block(self.current);
            self.pending_jumps.push((j, JumpSlot::Target));
        }

        self.seal_and_enter(else_bb);
        if let Some(e) = else_block {
            self.lower_stmt(e);
        }
        let else_end = self.current;
        let else_fallthrough = !self.current_block_has_terminator();
        if else_fallthrough {
            let j = self.out.push_op(Opcode::Jump, &[Operand::Block(INVALID)], sloc);
            self.out.close_block(self.current);
            self.pending_jumps.push((j, JumpSlot::Target));
        }

        if then_fallthrough || else_fallthrough {
            let join = self.new_block(BlockKind::Normal);
            if then_fallthrough {
                self.add_edge(then_end, join);
                self.resolve_last_pending_jump(join);
            }
            if else_fallthrough {
                self.add_edge(else_end, join);
                self.resolve_last_pending_jump(join);
            }
            self.seal_and_enter(join);
        } else {
            // Both branches terminate (return/throw/break/continue); the
            // cursor is left on a sealed, unreachable block so subsequent
            // sibling statements still have somewhere to append ops. The
            // fold pass proves it unreachable and discards
            // it.
            let dead = self.new_block(BlockKind::Normal);
            self.seal_and_enter(dead);
        }
    }

    fn lower_while(&mut self, loop_node: NodeId, cond: NodeId, body: NodeId, sloc: SrcLoc) {
        let preheader = self.current;
        let header = self.new_block(BlockKind::Loop);
        self.add_edge(preheader, header);
        self.out.close_block(preheader);
        self.current = header;

        let c = self.lower_expr(cond);
        let test = self.out.push_op(Opcode::JumpTest, &[c, Operand::Block(INVALID), Operand::Block(INVALID)], sloc);
        let body_bb = self.new_block(BlockKind::Normal);
        let exit_bb = self.new_block(BlockKind::Normal);
        self.patch_jump_targets(test, body_bb, exit_bb);
        self.add_edge(header, body_bb);
        self.add_edge(header, exit_bb);
        self.out.close_block(header);

        let close_depth = self.af.close_index_of(loop_node);
        self.loops.push(LoopCtx { header, close_depth, break_jumps: Vec::new(), continue_jumps: Vec::new() });

        self.seal_and_enter(body_bb);
        self.lower_stmt(body);
        if !self.current_block_has_terminator() {
            let back = self.out.push_op(Opcode::Jump, &[Operand::Block(header)], sloc);
            let _ = back;
            self.add_edge(self.current, header);
        }
        self.out.close_block(self.current);

        let ctx = self.loops.pop().unwrap();
        for (j, src) in ctx.continue_jumps {
            self.patch_jump_single(j, header);
            self.add_edge(src, header);
        }
        self.seal_block(header);

        self.seal_and_enter(exit_bb);
        for (j, src) in ctx.break_jumps {
            self.patch_jump_single(j, exit_bb);
            self.add_edge(src, exit_bb);
        }
    }

    fn lower_for_range(
        &mut self,
        loop_node: NodeId,
        local: u32,
        start: NodeId,
        stop: NodeId,
        step: Option<NodeId>,
        body: NodeId,
        sloc: SrcLoc,
    ) {
        let s = self.lower_expr(start);
        let e = self.lower_expr(stop);
        let st = step.map(|s| self.lower_expr(s));
        let gen = self.out.push_op(
            Opcode::JumpForEgen,
            &[s, e, st.unwrap_or(Operand::Number(1.0)), Operand::Block(INVALID)],
            sloc,
        );
        let preheader = self.current;
        self.out.close_block(preheader);

        let header = self.new_block(BlockKind::Loop);
        self.patch_jump_single(gen, header);
        self.add_edge(preheader, header);
        self.current = header;

        let step_test = self.out.push_op(
            Opcode::JumpForStep,
            &[Operand::Local(local), Operand::Block(INVALID), Operand::Block(INVALID)],
            sloc,
        );
        let body_bb = self.new_block(BlockKind::Normal);
        let exit_bb = self.new_block(BlockKind::Normal);
        self.patch_jump_targets(step_test, body_bb, exit_bb);
        self.add_edge(header, body_bb);
        self.add_edge(header, exit_bb);
        self.out.close_block(header);

        let close_depth = self.af.close_index_of(loop_node);
        self.loops.push(LoopCtx { header, close_depth, break_jumps: Vec::new(), continue_jumps: Vec::new() });

        self.seal_and_enter(body_bb);
        let iter_val = self.out.push_op(Opcode::Ref, &[Operand::Local(local)], sloc);
        self.write_local(body_bb, local, Operand::Op(iter_val));
        self.lower_stmt(body);
        if !self.current_block_has_terminator() {
            self.out.push_op(Opcode::Jump, &[Operand::Block(header)], sloc);
            self.add_edge(self.current, header);
        }
        self.out.close_block(self.current);

        let ctx = self.loops.pop().unwrap();
        for (j, src) in ctx.continue_jumps {
            self.patch_jump_single(j, header);
            self.add_edge(src, header);
        }
        self.seal_block(header);

        self.seal_and_enter(exit_bb);
        for (j, src) in ctx.break_jumps {
            self.patch_jump_single(j, exit_bb);
            self.add_edge(src, exit_bb);
        }
    }

    fn lower_for_each(&mut self, loop_node: NodeId, local: u32, iterable: NodeId, body: NodeId, sloc: SrcLoc) {
        let it = self.lower_expr(iterable);
        let gen = self.out.push_op(Opcode::JumpForSgen, &[it, Operand::Block(INVALID)], sloc);
        let preheader = self.current;
        self.out.close_block(preheader);

        let header = self.new_block(BlockKind::Loop);
        self.patch_jump_single(gen, header);
        self.add_edge(preheader, header);
        self.current = header;

        let each_test = self.out.push_op(
            Opcode::JumpForEach,
            &[Operand::Local(local), Operand::Block(INVALID), Operand::Block(INVALID)],
            sloc,
        );
        let body_bb = self.new_block(BlockKind::Normal);
        let exit_bb = self.new_block(BlockKind::Normal);
        self.patch_jump_targets(each_test, body_bb, exit_bb);
        self.add_edge(header, body_bb);
        self.add_edge(header, exit_bb);
        self.out.close_block(header);

        let close_depth = self.af.close_index_of(loop_node);
        self.loops.push(LoopCtx { header, close_depth, break_jumps: Vec::new(), continue_jumps: Vec::new() });

        self.seal_and_enter(body_bb);
        let iter_val = self.out.push_op(Opcode::Ref, &[Operand::Local(local)], sloc);
        self.write_local(body_bb, local, Operand::Op(iter_val));
        self.lower_stmt(body);
        if !self.current_block_has_terminator() {
            self.out.push_op(Opcode::Jump, &[Operand::Block(header)], sloc);
            self.add_edge(self.current, header);
        }
        self.out.close_block(self.current);

        let ctx = self.loops.pop().unwrap();
        for (j, src) in ctx.continue_jumps {
            self.patch_jump_single(j, header);
            self.add_edge(src, header);
        }
        self.seal_block(header);

        self.seal_and_enter(exit_bb);
        for (j, src) in ctx.break_jumps {
            self.patch_jump_single(j, exit_bb);
            self.add_edge(src, exit_bb);
        }
    }

    fn lower_repeat(&mut self, loop_node: NodeId, body: NodeId, until: NodeId, sloc: SrcLoc) {
        let preheader = self.current;
        let header = self.new_block(BlockKind::Loop);
        self.add_edge(preheader, header);
        self.out.close_block(preheader);

        let close_depth = self.af.close_index_of(loop_node);
        self.loops.push(LoopCtx { header, close_depth, break_jumps: Vec::new(), continue_jumps: Vec::new() });

        self.current = header;
        // A `repeat` body and its `until` condition share one scope (the
        // resolver requires this so the condition can see locals declared
        // in the body); they are lowered into the same block run rather
        // than a separate body/condition split.
        self.lower_stmt(body);
        let c = self.lower_expr(until);
        let test =
            self.out.push_op(Opcode::JumpTest, &[c, Operand::Block(INVALID), Operand::Block(INVALID)], sloc);
        let exit_bb = self.new_block(BlockKind::Normal);
        self.patch_jump_targets(test, exit_bb, header);
        self.add_edge(self.current, header);
        self.add_edge(self.current, exit_bb);
        self.out.close_block(self.current);

        let ctx = self.loops.pop().unwrap();
        for (j, src) in ctx.continue_jumps {
            self.patch_jump_single(j, header);
            self.add_edge(src, header);
        }
        self.seal_block(header);
        self.seal_and_enter(exit_bb);
        for (j, src) in ctx.break_jumps {
            self.patch_jump_single(j, exit_bb);
            self.add_edge(src, exit_bb);
        }
    }

    fn lower_break(&mut self, node: NodeId, sloc: SrcLoc) {
        let Some(frame) = self.loops.last() else {
            // Resolver already reported "invalid 'break' outside of loop";
            // nothing safe to lower here.
            return;
        };
        let depth = frame.close_depth;
        if self.upstack_depth > depth {
            self.out.push_op(Opcode::CloseUpstack, &[Operand::ImmediateI8(depth as i8)], sloc);
        }
        let j = self.out.push_op(Opcode::Jump, &[Operand::Block(INVALID)], sloc);
        let src = self.current;
        self.loops.last_mut().unwrap().break_jumps.push((j, src));
        self.out.close_block(self.current);
        let _ = node;
        let dead = self.new_block(BlockKind::Normal);
        self.seal_and_enter(dead);
    }

    fn lower_continue(&mut self, node: NodeId, sloc: SrcLoc) {
        let Some(frame) = self.loops.last() else {
            return;
        };
        let depth = frame.close_depth;
        if self.upstack_depth > depth {
            self.out.push_op(Opcode::CloseUpstack, &[Operand::ImmediateI8(depth as i8)], sloc);
        }
        let j = self.out.push_op(Opcode::Jump, &[Operand::Block(INVALID)], sloc);
        let src = self.current;
        self.loops.last_mut().unwrap().continue_jumps.push((j, src));
        self.out.close_block(self.current);
        let _ = node;
        let dead = self.new_block(BlockKind::Normal);
        self.seal_and_enter(dead);
    }

    // ---- jump-target patching ----
    //
    // Jump targets are `Operand::Block(INVALID)` placeholders filled in once
    // the destination block exists. `pending_jumps` only tracks the common
    // "fallthrough out of an if-branch" case; loop break/continue targets
    // are tracked per-`LoopCtx` instead since they can't resolve until the
    // whole loop is built.

    fn patch_jump_targets(&mut self, op: u32, a: u32, b: u32) {
        let operands = self.out.operands_of_mut(op);
        let n = operands.len();
        operands[n - 2] = Operand::Block(a);
        operands[n - 1] = Operand::Block(b);
    }

    fn patch_jump_single(&mut self, op: u32, target: u32) {
        let operands = self.out.operands_of_mut(op);
        let last = operands.len() - 1;
        operands[last] = Operand::Block(target);
    }

    fn resolve_last_pending_jump(&mut self, join: u32) {
        if let Some((op, JumpSlot::Target)) = self.pending_jumps.pop() {
            self.patch_jump_single(op, join);
        }
    }

    // ---- expressions ----

    /// Lower an expression that must produce exactly one value.
    fn lower_expr(&mut self, id: NodeId) -> Operand {
        let sloc = self.af.node(id).sloc;
        match self.af.node(id).kind.clone() {
            NodeKind::Null => self.out.push_op(Opcode::Const, &[Operand::Null], sloc).into_op(),
            NodeKind::True => self.out.push_op(Opcode::Const, &[Operand::True], sloc).into_op(),
            NodeKind::False => self.out.push_op(Opcode::Const, &[Operand::False], sloc).into_op(),
            NodeKind::Number(n) => self.out.push_op(Opcode::Const, &[Operand::Number(n)], sloc).into_op(),
            NodeKind::StringLit(s) => self.out.push_op(Opcode::Const, &[Operand::String(s)], sloc).into_op(),

            NodeKind::LocalName(local) => self.read_local(self.current, local),
            NodeKind::GlobalName(name) => {
                self.out.push_op(Opcode::GetGlobal, &[Operand::Selector(name)], sloc).into_op()
            }
            NodeKind::OutenvName(idx) => {
                self.out.push_op(Opcode::GetOutenv, &[Operand::OutenvSlot(idx)], sloc).into_op()
            }
            NodeKind::SelfName => self.read_local(self.current, self.self_local()),
            NodeKind::SuperName => {
                let self_val = self.read_local(self.current, self.self_local());
                self.out.push_op(Opcode::Superof, &[self_val], sloc).into_op()
            }

            NodeKind::Vararg => self.out.push_op(Opcode::VarargUnpack, &[], sloc).into_op(),
            NodeKind::Unpack(e) => {
                let v = self.lower_expr(e);
                self.out.push_op(Opcode::ArrayUnpack, &[v], sloc).into_op()
            }

            NodeKind::Unary { op, operand } => {
                let v = self.lower_expr(operand);
                self.emit_unary(op, v, sloc)
            }
            NodeKind::Binary { op, lhs, rhs } => {
                let l = self.lower_expr(lhs);
                let r = self.lower_expr(rhs);
                self.emit_binary(op, l, r, sloc)
            }
            NodeKind::Logical { op, lhs, rhs } => self.lower_logical(op, lhs, rhs, sloc),
            NodeKind::Ternary { cond, then_expr, else_expr } => self.lower_ternary(cond, then_expr, else_expr, sloc),
            NodeKind::CompareChain { operands, ops } => self.lower_compare_chain(&operands, &ops, sloc),

            NodeKind::Key { obj, name } => {
                let o = self.lower_expr(obj);
                self.out.push_op(Opcode::GetKey, &[o, Operand::Selector(name)], sloc).into_op()
            }
            NodeKind::Index { obj, index } => {
                let o = self.lower_expr(obj);
                let i = self.lower_expr(index);
                self.out.push_op(Opcode::GetIndex, &[o, i], sloc).into_op()
            }
            NodeKind::Call { callee, args } => {
                let f = self.lower_expr(callee);
                let mut operands = vec![f];
                operands.extend(args.iter().map(|&a| self.lower_expr(a)));
                self.out.push_op(Opcode::Call, &operands, sloc).into_op()
            }
            NodeKind::MethodCall { obj, name, args } => {
                let o = self.lower_expr(obj);
                let f = self.out.push_op(Opcode::GetKey, &[o, Operand::Selector(name)], sloc).into_op();
                let mut operands = vec![f, o];
                operands.extend(args.iter().map(|&a| self.lower_expr(a)));
                self.out.push_op(Opcode::Call, &operands, sloc).into_op()
            }

            NodeKind::ArrayLit { elements } => {
                let arr = self.out.push_op(Opcode::NewArray, &[], sloc).into_op();
                for e in elements {
                    if matches!(self.af.node(e).kind, NodeKind::Unpack(_)) {
                        let v = self.lower_expr(e);
                        self.out.push_op(Opcode::Extend, &[arr, v], sloc);
                    } else {
                        let v = self.lower_expr(e);
                        self.out.push_op(Opcode::Append, &[arr, v], sloc);
                    }
                }
                arr
            }
            NodeKind::TableLit { entries } => {
                let tab = self.out.push_op(Opcode::NewTable, &[], sloc).into_op();
                for (k, v) in entries {
                    let kv = self.lower_expr(k);
                    let vv = self.lower_expr(v);
                    self.out.push_op(Opcode::SetIndex, &[tab, kv, vv], sloc);
                }
                tab
            }
            NodeKind::ObjectLit { prototype, keys, members } => {
                let proto = prototype.map(|p| self.lower_expr(p)).unwrap_or(Operand::Null);
                let obj = self.out.push_op(Opcode::NewObject, &[proto], sloc).into_op();
                for (key, member) in keys.into_iter().zip(members) {
                    let v = self.lower_expr(member);
                    self.out.push_op(Opcode::SetKey, &[obj, Operand::Selector(key), v], sloc);
                }
                obj
            }

            NodeKind::FunctionLit(fid) => self.lower_function_lit(fid, sloc),

            NodeKind::Yield { args } => {
                let operands: Vec<Operand> = args.iter().map(|&a| self.lower_expr(a)).collect();
                self.out.push_op(Opcode::Yield, &operands, sloc).into_op()
            }
            NodeKind::YieldFor { iterable } => {
                // Generator delegation (`yield for it`) is VM/generator
                // runtime behavior, explicitly out of this compiler's scope
                //; lowered as a yield over the whole iterable
                // value so the IR shape still round-trips through every
                // downstream pass.
                let v = self.lower_expr(iterable);
                self.out.push_op(Opcode::Yield, &[v], sloc).into_op()
            }

            other => unreachable!("not an expression node: {other:?}"),
        }
    }

    /// Lower an expression in a context that may consume more than one
    /// value (a `var`/assignment RHS list ending in `...expr`). Returns
    /// exactly `want` operands, padding with `null` constants short of an
    /// unpack and truncating extras.
    fn lower_expr_multi(&mut self, id: NodeId, want: usize) -> Vec<Operand> {
        if want <= 1 {
            return vec![self.lower_expr(id)];
        }
        if matches!(self.af.node(id).kind, NodeKind::Unpack(_) | NodeKind::Vararg) {
            let v = self.lower_expr(id);
            return (0..want).map(|_| v).collect();
        }
        let v = self.lower_expr(id);
        let mut out = vec![v];
        while out.len() < want {
            out.push(Operand::Null);
        }
        out
    }

    fn self_local(&self) -> u32 {
        self.af.param_locals[0]
    }

    fn lower_function_lit(&mut self, fid: ast::FunctionId, sloc: SrcLoc) -> Operand {
        let nested_ast = &self.af.functions[fid as usize];
        let nested_ir = build_function(nested_ast, self.source, self.errors);
        let nested_idx = self.out.nested.len() as u32;
        self.out.nested.push(nested_ir);

        let fn_op = self.out.push_op(Opcode::Function, &[Operand::Function(nested_idx)], sloc).into_op();
        for (slot, outenv) in self.af.functions[fid as usize].outenvs.iter().enumerate() {
            match outenv.source {
                OutEnvSource::ParentLocal(local) => {
                    let v = self.read_local(self.current, local);
                    self.out.push_op(Opcode::FVarenv, &[fn_op, Operand::ImmediateI8(slot as i8), v], sloc);
                }
                OutEnvSource::ParentOutEnv(idx) => {
                    self.out.push_op(
                        Opcode::FOutenv,
                        &[fn_op, Operand::ImmediateI8(slot as i8), Operand::OutenvSlot(idx)],
                        sloc,
                    );
                }
            }
        }
        fn_op
    }

    // ---- short-circuit / comparison shape ----

    fn lower_logical(&mut self, op: LogicalOp, lhs: NodeId, rhs: NodeId, sloc: SrcLoc) -> Operand {
        let l = self.lower_expr(lhs);
        let fork_opcode = match op {
            LogicalOp::And => Opcode::BAnd,
            LogicalOp::Or => Opcode::BCut,
        };
        let fork = self.out.push_op(fork_opcode, &[l, Operand::Block(INVALID)], sloc);
        let carry = self.out.push_op(Opcode::BDef, &[Operand::Op(fork), l, Operand::Block(INVALID)], sloc);
        self.out.close_block(self.current);
        let carry_bb = self.current;

        let rhs_bb = self.new_block(BlockKind::Normal);
        self.add_edge(carry_bb, rhs_bb);
        self.seal_and_enter(rhs_bb);
        let r = self.lower_expr(rhs);
        self.out.close_block(self.current);
        let rhs_end = self.current;

        let join = self.new_block(BlockKind::Normal);
        self.add_edge(carry_bb, join);
        self.add_edge(rhs_end, join);
        self.patch_jump_single(fork, join);
        self.patch_jump_single(carry, rhs_bb);
        self.seal_and_enter(join);

        let phi = self.out.push_header_op(join, Opcode::BPhi, &[Operand::Op(carry), r], INVALID, sloc);
        Operand::Op(phi)
    }

    /// `a < b < c < ...`: every comparand is lowered exactly once up front,
    /// then adjacent pairs are compared left to right with the same
    /// `B_AND`/`B_DEF`/`B_PHI` short-circuit shape `lower_logical` uses for
    /// `and`, so the chain stops comparing as soon as one link is false.
    fn lower_compare_chain(&mut self, operands: &[NodeId], ops: &[BinaryOp], sloc: SrcLoc) -> Operand {
        let vals: Vec<Operand> = operands.iter().map(|&id| self.lower_expr(id)).collect();
        self.lower_compare_chain_from(&vals, ops, 0, sloc)
    }

    fn lower_compare_chain_from(&mut self, vals: &[Operand], ops: &[BinaryOp], i: usize, sloc: SrcLoc) -> Operand {
        let cmp = self.emit_binary(ops[i], vals[i], vals[i + 1], sloc);
        if i + 1 == ops.len() {
            return cmp;
        }

        let fork = self.out.push_op(Opcode::BAnd, &[cmp, Operand::Block(INVALID)], sloc);
        let carry = self.out.push_op(Opcode::BDef, &[Operand::Op(fork), cmp, Operand::Block(INVALID)], sloc);
        self.out.close_block(self.current);
        let carry_bb = self.current;

        let rhs_bb = self.new_block(BlockKind::Normal);
        self.add_edge(carry_bb, rhs_bb);
        self.seal_and_enter(rhs_bb);
        let r = self.lower_compare_chain_from(vals, ops, i + 1, sloc);
        self.out.close_block(self.current);
        let rhs_end = self.current;

        let join = self.new_block(BlockKind::Normal);
        self.add_edge(carry_bb, join);
        self.add_edge(rhs_end, join);
        self.patch_jump_single(fork, join);
        self.patch_jump_single(carry, rhs_bb);
        self.seal_and_enter(join);

        let phi = self.out.push_header_op(join, Opcode::BPhi, &[Operand::Op(carry), r], INVALID, sloc);
        Operand::Op(phi)
    }

    fn lower_ternary(&mut self, cond: NodeId, then_expr: NodeId, else_expr: NodeId, sloc: SrcLoc) -> Operand {
        let c = self.lower_expr(cond);
        let test = self.out.push_op(Opcode::JumpTest, &[c, Operand::Block(INVALID), Operand::Block(INVALID)], sloc);
        self.out.close_block(self.current);
        let split = self.current;

        let then_bb = self.new_block(BlockKind::Normal);
        let else_bb = self.new_block(BlockKind::Normal);
        self.patch_jump_targets(test, then_bb, else_bb);
        self.add_edge(split, then_bb);
        self.add_edge(split, else_bb);

        self.seal_and_enter(then_bb);
        let then_v = self.lower_expr(then_expr);
        // `then_bb` isn't physically adjacent to `join` (`else_bb` sits
        // between them in the flat op array), so unlike `else_bb`'s
        // fallthrough it needs an explicit jump, emitted now while it's
        // still the last op in `then_bb`'s range.
        let then_jump = self.out.push_op(Opcode::Jump, &[Operand::Block(INVALID)], sloc);
        self.out.close_block(self.current);
        let then_end = self.current;

        self.seal_and_enter(else_bb);
        let else_v = self.lower_expr(else_expr);
        self.out.close_block(self.current);
        let else_end = self.current;

        let join = self.new_block(BlockKind::Normal);
        self.patch_jump_single(then_jump, join);
        self.add_edge(then_end, join);
        self.add_edge(else_end, join);
        self.seal_and_enter(join);
        let phi = self.out.push_header_op(join, Opcode::Phi, &[then_v, else_v], INVALID, sloc);
        Operand::Op(phi)
    }

    fn emit_unary(&mut self, op: UnaryOp, v: Operand, sloc: SrcLoc) -> Operand {
        let opcode = match op {
            UnaryOp::Neg => Opcode::Neg,
            UnaryOp::Pos => Opcode::Pos,
            UnaryOp::Not => Opcode::Not,
            UnaryOp::BitNot => Opcode::BitNot,
            UnaryOp::Len => Opcode::Length,
        };
        self.out.push_op(opcode, &[v], sloc).into_op()
    }

    fn emit_binary(&mut self, op: BinaryOp, l: Operand, r: Operand, sloc: SrcLoc) -> Operand {
        // `>`/`>=` have no dedicated IR opcode: lower by swapping operands
        // into `LT`/`LE`.
        let (opcode, l, r) = match op {
            BinaryOp::Add => (Opcode::Add, l, r),
            BinaryOp::Sub => (Opcode::Sub, l, r),
            BinaryOp::Mul => (Opcode::Mul, l, r),
            BinaryOp::Div => (Opcode::Div, l, r),
            BinaryOp::FloorDiv => (Opcode::IntDiv, l, r),
            BinaryOp::Mod => (Opcode::Mod, l, r),
            BinaryOp::Concat => (Opcode::Concat, l, r),
            BinaryOp::BitAnd => (Opcode::BitAnd, l, r),
            BinaryOp::BitOr => (Opcode::BitOr, l, r),
            BinaryOp::BitXor => (Opcode::BitXor, l, r),
            // Shift amount is always the right operand.
            BinaryOp::Shl => (Opcode::LShift, l, r),
            BinaryOp::Shr => (Opcode::RShift, l, r),
            BinaryOp::AShr => (Opcode::AShift, l, r),
            BinaryOp::Eq => (Opcode::Eq, l, r),
            BinaryOp::NotEq => (Opcode::Ne, l, r),
            BinaryOp::Lt => (Opcode::Lt, l, r),
            BinaryOp::Le => (Opcode::Le, l, r),
            BinaryOp::Gt => (Opcode::Lt, r, l),
            BinaryOp::Ge => (Opcode::Le, r, l),
            BinaryOp::Is => (Opcode::Is, l, r),
        };
        self.out.push_op(opcode, &[l, r], sloc).into_op()
    }

}

#[derive(Clone, Copy)]
enum JumpSlot {
    Target,
}

trait IntoOperand {
    fn into_op(self) -> Operand;
}

impl IntoOperand for u32 {
    fn into_op(self) -> Operand {
        Operand::Op(self)
    }
}
