//! Bytecode emission: walks an allocated-register [`Module`] and produces a
//! [`CodeScript`].
//!
//! Every surviving IR op becomes one header word followed by one word per
//! operand:
//!
//! ```text
//! header word:  opcode:8 | r:8 | operand_count:8 | 0:8
//! operand word: tag:8 | payload:24 (sign-extended for immediate/offset tags)
//! ```
//!
//! `PHI`/`REF` header ops never get a word of their own; a block that reads
//! one is really reading whatever register the allocator gave it, and the
//! register is made to hold the right value by inserting a register-to-
//! register `MOV` at the end of each predecessor, right before its
//! terminator. `alloc.rs`'s simplified linear scan doesn't coordinate a
//! PHI/REF's register with its predecessors' producers, so this "out of
//! SSA" move insertion is what actually makes the result correct; it edits
//! only the emitted word stream; the `Function`'s own op slab and block
//! indices are untouched (see DESIGN.md).
//!
//! Because a `MOV`'s word count depends on nothing but how many moves a
//! block needs, word positions can be computed with a first pass that only
//! counts ([`layout`]) before a second pass resolves operands into words
//! using those positions ([`emit_function`]) — needed because `JUMP`-family
//! targets are encoded as an offset relative to the end of the jump
//! instruction itself, which isn't known until every instruction ahead of
//! it in the block has been sized.

use crate::bytecode::word::*;
use crate::bytecode::{self, CodeDebugFunction, CodeFunction, CodeScript, CodeSelector, TaggedConstant};
use kbc_common::source::{Source, SrcLoc};
use kbc_ir::{BlockKind, Constant, Function, Module, Opcode, Operand, Selector};
use log::debug;
use std::collections::HashMap;

pub fn emit_module(module: &Module, source: &Source) -> CodeScript {
    let mut flat: Vec<&Function> = Vec::new();
    let mut nested_index: HashMap<*const Function, u32> = HashMap::new();
    flatten(&module.main, &mut flat, &mut nested_index);
    debug!("emit: {} functions in module", flat.len());

    let mut heap = HeapBuilder::default();
    let mut debug_heap = HeapBuilder::default();

    let functions: Vec<CodeFunction> =
        flat.iter().map(|f| emit_function(f, source, &nested_index, &mut heap, &mut debug_heap)).collect();

    let debug_script_name = Some(debug_heap.intern(source.name()));

    CodeScript {
        heap: heap.bytes,
        functions,
        debug_newlines: source.line_starts().to_vec(),
        debug_heap: debug_heap.bytes,
        debug_script_name,
    }
}

fn flatten<'a>(f: &'a Function, out: &mut Vec<&'a Function>, index_of: &mut HashMap<*const Function, u32>) {
    let idx = out.len() as u32;
    out.push(f);
    index_of.insert(f as *const Function, idx);
    for nested in &f.nested {
        flatten(nested, out, index_of);
    }
}

#[derive(Default)]
struct HeapBuilder {
    bytes: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl HeapBuilder {
    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&offset) = self.offsets.get(s) {
            return offset;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(s.to_string(), offset);
        offset
    }
}

fn emit_function(
    f: &Function,
    source: &Source,
    nested_index: &HashMap<*const Function, u32>,
    heap: &mut HeapBuilder,
    debug_heap: &mut HeapBuilder,
) -> CodeFunction {
    let moves = compute_pending_moves(f);
    let local_reg = build_local_reg(f);
    let (op_word_pos, block_entry_word, total_words) = layout(f, &moves);
    let (variables, var_spans) = collect_debug_variables(f, source, debug_heap, &block_entry_word, total_words);

    let mut ops = Vec::with_capacity(total_words as usize);
    let mut slocs = Vec::new();

    for (b, block) in f.blocks.iter().enumerate() {
        if block.kind == BlockKind::None {
            continue;
        }
        let real_ops: Vec<u32> = (block.lower..block.upper).filter(|&i| should_emit(f, i)).collect();
        let (body, tail) = split_tail(f, &real_ops);

        for &i in body {
            emit_one(f, i, &local_reg, &block_entry_word, nested_index, &op_word_pos, &mut ops, &mut slocs);
        }
        for &(dst, src) in &moves[b] {
            emit_move(dst, src, f.sloc, &mut ops, &mut slocs);
        }
        if let Some(i) = tail {
            emit_one(f, i, &local_reg, &block_entry_word, nested_index, &op_word_pos, &mut ops, &mut slocs);
        }
    }

    let constants: Vec<TaggedConstant> = f.constants.iter().map(|c| convert_constant(c, source, heap)).collect();
    let selectors: Vec<CodeSelector> = f.selectors.iter().map(|s| convert_selector(s, source, heap)).collect();

    let mut flags = 0u8;
    if f.has_varargs {
        flags |= bytecode::flags::HAS_VARARGS;
    }
    if f.is_method {
        flags |= bytecode::flags::IS_METHOD;
    }

    let debug = Some(CodeDebugFunction {
        function_name: f.name.map(|n| debug_heap.intern(source.interned(n))),
        slocs,
        variables,
        var_spans,
    });

    CodeFunction {
        ops,
        constants,
        selectors,
        outenv_count: f.outenvs.len() as u16,
        param_count: f.param_count as u8,
        stack_size: f.stack_size.max(1) as u8,
        flags,
        debug,
    }
}

/// `REF`/`PHI` header ops may land in a different register than the value
/// they import; compute the register-to-register copies each predecessor
/// needs to make that true, keyed by predecessor block index.
fn compute_pending_moves(f: &Function) -> Vec<Vec<(u8, u8)>> {
    let mut moves = vec![Vec::new(); f.blocks.len()];
    for (b, block) in f.blocks.iter().enumerate() {
        let mut cursor = block.phi_head;
        while let Some(idx) = cursor {
            let op = &f.ops[idx as usize];
            cursor = op.phi_next;
            let Some(dst) = op.r else { continue };
            match op.opcode {
                Opcode::Ref => {
                    let preds = f.predecessors_of(b as u32);
                    let Some(&pred) = preds.first() else { continue };
                    if let [&Operand::Op(src_idx)] = f.operands_of(idx) {
                        if let Some(src) = f.ops[src_idx as usize].r {
                            if src != dst {
                                moves[pred as usize].push((dst, src));
                            }
                        }
                    }
                }
                Opcode::Phi => {
                    let preds = f.predecessors_of(b as u32).to_vec();
                    let operands = f.operands_of(idx).to_vec();
                    for (slot, &pred) in preds.iter().enumerate() {
                        if let Some(&Operand::Op(src_idx)) = operands.get(slot) {
                            if let Some(src) = f.ops[src_idx as usize].r {
                                if src != dst {
                                    moves[pred as usize].push((dst, src));
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    moves
}

/// Last writer (by op index) of each surface local's register, so
/// `JUMP_FOR_STEP`/`JUMP_FOR_EACH`'s raw `Local` write-target operand can be
/// resolved to a register. A loop-carried local has exactly one defining
/// `PHI`/`REF` in the whole function, so a single whole-function scan (no
/// per-block shadowing) is enough.
fn build_local_reg(f: &Function) -> HashMap<u32, u8> {
    let mut map = HashMap::new();
    for op in &f.ops {
        if let (Some(local), Some(r)) = (op.local, op.r) {
            map.insert(local, r);
        }
    }
    map
}

/// Build the `(variable_index, [lower_op, upper_op))` debug table: every
/// block-header `PHI`/`REF` that redefines a named surface local marks the
/// word position from which its register holds that local's current value,
/// running until the local's next redefinition (or the end of the
/// function). Straight-line reassignment within a single block never goes
/// through a header op, so it isn't a redefinition point here; the span
/// from the local's most recent header-op definition still covers it,
/// since the allocator keeps that same register live across the block.
fn collect_debug_variables(
    f: &Function,
    source: &Source,
    debug_heap: &mut HeapBuilder,
    block_entry_word: &[u32],
    total_words: u32,
) -> (Vec<bytecode::DebugVariable>, Vec<bytecode::VariableSpan>) {
    let mut defs: Vec<(u32, u32, u8)> = Vec::new();
    for (b, block) in f.blocks.iter().enumerate() {
        if block.kind == BlockKind::None {
            continue;
        }
        let mut cursor = block.phi_head;
        while let Some(idx) = cursor {
            let op = &f.ops[idx as usize];
            cursor = op.phi_next;
            if let (Some(local), Some(r)) = (op.local, op.r) {
                if f.local_names.get(local as usize).copied().flatten().is_some() {
                    defs.push((local, block_entry_word[b], r));
                }
            }
        }
    }

    let mut variables = Vec::new();
    let mut var_index: HashMap<(u32, u8), u32> = HashMap::new();
    let mut var_spans = Vec::new();

    for (i, &(local, word, reg)) in defs.iter().enumerate() {
        let upper = defs[i + 1..].iter().find(|&&(l, ..)| l == local).map(|&(_, w, _)| w).unwrap_or(total_words);
        if upper <= word {
            continue;
        }
        let variable_index = *var_index.entry((local, reg)).or_insert_with(|| {
            let name = f.local_names[local as usize].expect("filtered above");
            let name_offset = debug_heap.intern(source.interned(name));
            variables.push(bytecode::DebugVariable { name_offset, r: reg });
            (variables.len() - 1) as u32
        });
        var_spans.push(bytecode::VariableSpan { variable_index, lower: word, upper });
    }

    (variables, var_spans)
}

fn should_emit(f: &Function, idx: u32) -> bool {
    let op = &f.ops[idx as usize];
    !matches!(op.opcode, Opcode::Nop | Opcode::Block | Opcode::Phi | Opcode::Ref) && op.mark != 0
}

/// Split a block's already-filtered real ops into everything-but-the-last
/// and, when the last op is a terminator, the terminator itself — pending
/// moves must land before the terminator, not after it.
fn split_tail(f: &Function, real_ops: &[u32]) -> (&[u32], Option<u32>) {
    match real_ops.split_last() {
        Some((&last, rest)) if f.ops[last as usize].opcode.is_terminator() => (rest, Some(last)),
        _ => (real_ops, None),
    }
}

fn layout(f: &Function, moves: &[Vec<(u8, u8)>]) -> (Vec<u32>, Vec<u32>, u32) {
    let mut op_word_pos = vec![0u32; f.ops.len()];
    let mut block_entry_word = vec![0u32; f.blocks.len()];
    let mut pos = 0u32;

    for (b, block) in f.blocks.iter().enumerate() {
        if block.kind == BlockKind::None {
            continue;
        }
        block_entry_word[b] = pos;
        let real_ops: Vec<u32> = (block.lower..block.upper).filter(|&i| should_emit(f, i)).collect();
        let (body, tail) = split_tail(f, &real_ops);

        for &i in body {
            op_word_pos[i as usize] = pos;
            pos += 1 + f.ops[i as usize].ocount as u32;
        }
        pos += 2 * moves[b].len() as u32;
        if let Some(i) = tail {
            op_word_pos[i as usize] = pos;
            pos += 1 + f.ops[i as usize].ocount as u32;
        }
    }

    (op_word_pos, block_entry_word, pos)
}

#[allow(clippy::too_many_arguments)]
fn emit_one(
    f: &Function,
    idx: u32,
    local_reg: &HashMap<u32, u8>,
    block_entry_word: &[u32],
    nested_index: &HashMap<*const Function, u32>,
    op_word_pos: &[u32],
    ops: &mut Vec<u32>,
    slocs: &mut Vec<SrcLoc>,
) {
    let op = &f.ops[idx as usize];
    let operands = f.operands_of(idx);
    let r = op.r.unwrap_or(0);
    ops.push(header_word(op.opcode, r, operands.len() as u8));
    slocs.push(op.sloc);
    let end_word = op_word_pos[idx as usize] + 1 + operands.len() as u32;
    for &operand in operands {
        ops.push(resolve_operand(operand, f, local_reg, block_entry_word, end_word, nested_index));
    }
}

fn emit_move(dst: u8, src: u8, sloc: SrcLoc, ops: &mut Vec<u32>, slocs: &mut Vec<SrcLoc>) {
    ops.push(header_word(Opcode::Mov, dst, 1));
    ops.push(operand_word(TAG_REG, src as i32));
    slocs.push(sloc);
}

#[allow(clippy::too_many_arguments)]
fn resolve_operand(
    operand: Operand,
    f: &Function,
    local_reg: &HashMap<u32, u8>,
    block_entry_word: &[u32],
    this_instr_end_word: u32,
    nested_index: &HashMap<*const Function, u32>,
) -> u32 {
    match operand {
        Operand::Op(t) => operand_word(TAG_REG, f.ops[t as usize].r.unwrap_or(0) as i32),
        Operand::Block(t) => {
            let target = block_entry_word[t as usize] as i64;
            let offset = target - this_instr_end_word as i64;
            operand_word(TAG_BLOCK_OFFSET, offset as i32)
        }
        Operand::Null => operand_word(TAG_NULL, 0),
        Operand::True => operand_word(TAG_TRUE, 0),
        Operand::False => operand_word(TAG_FALSE, 0),
        Operand::ImmediateI8(i) => operand_word(TAG_IMMEDIATE, i as i32),
        Operand::Local(l) => operand_word(TAG_REG, *local_reg.get(&l).unwrap_or(&0) as i32),
        Operand::UpstackSlot(s) => operand_word(TAG_UPSTACK, s as i32),
        Operand::OutenvSlot(s) => operand_word(TAG_OUTENV, s as i32),
        Operand::UpvalSlot(s) => operand_word(TAG_UPVAL, s as i32),
        Operand::Function(local_idx) => {
            let child = &f.nested[local_idx as usize] as *const Function;
            let global = *nested_index.get(&child).expect("nested function was flattened");
            operand_word(TAG_FUNCTION, global as i32)
        }
        Operand::ConstIndex(i) => operand_word(TAG_CONST_INDEX, i as i32),
        Operand::SelectorIndex(i) => operand_word(TAG_SELECTOR_INDEX, i as i32),
        Operand::Number(_) | Operand::String(_) | Operand::Selector(_) => {
            unreachable!("constant/selector operands are pool-resolved before emission")
        }
        Operand::None => operand_word(TAG_NULL, 0),
    }
}

fn convert_constant(c: &Constant, source: &Source, heap: &mut HeapBuilder) -> TaggedConstant {
    match *c {
        Constant::Number(n) => TaggedConstant::Number(n.to_bits()),
        Constant::Str(s) => TaggedConstant::StringRef(heap.intern(source.interned(s))),
    }
}

fn convert_selector(sel: &Selector, source: &Source, heap: &mut HeapBuilder) -> CodeSelector {
    CodeSelector { key_heap_offset: heap.intern(source.interned(sel.name)), reserved: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbc_common::diagnostics::ErrorSink;
    use kbc_ir::build_program;
    use kbc_parser::parser::Parser;
    use kbc_resolve::resolve_program;

    fn compile(text: &str) -> (Module, Source) {
        let mut source = Source::new("t", text);
        let parser = Parser::new(&mut source);
        let (mut program, errs) = parser.parse_program();
        assert!(errs.is_empty(), "parse errors: {:?}", errs.into_diagnostics());
        let resolve_errs = resolve_program(&mut program, &mut source);
        assert!(resolve_errs.is_empty(), "resolve errors: {:?}", resolve_errs.into_diagnostics());
        let mut errors = ErrorSink::new();
        let module = build_program(&program, &mut source, &mut errors);
        assert!(errors.is_empty(), "build errors: {:?}", errors.into_diagnostics());
        (module, source)
    }

    #[test]
    fn emits_a_nonempty_word_stream_for_a_simple_return() {
        let (mut module, mut source) = compile("return 1 + 2");
        crate::fold::fold_function(&mut module.main, &mut source, &mut ErrorSink::new());
        crate::liveness::compute_liveness(&mut module.main);
        crate::inline::inline_constants(&mut module.main, &mut ErrorSink::new());
        crate::alloc::allocate_registers(&mut module.main);

        let script = emit_module(&module, &source);
        assert_eq!(script.functions.len(), 1);
        assert!(!script.functions[0].ops.is_empty());
    }

    #[test]
    fn header_word_round_trips_opcode_register_and_operand_count() {
        let word = header_word(Opcode::Add, 7, 2);
        assert_eq!(Opcode::from_u8((word & 0xff) as u8), Some(Opcode::Add));
        assert_eq!((word >> 8) & 0xff, 7);
        assert_eq!((word >> 16) & 0xff, 2);
    }

    #[test]
    fn operand_word_round_trips_negative_block_offset() {
        let word = operand_word(TAG_BLOCK_OFFSET, -5);
        let tag = (word >> 24) as u8;
        let payload = ((word & 0x00FF_FFFF) << 8) as i32 >> 8;
        assert_eq!(tag, TAG_BLOCK_OFFSET);
        assert_eq!(payload, -5);
    }
}
