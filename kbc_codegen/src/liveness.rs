//! Liveness computation: per-op use-count `mark` and
//! `live_range`, used by the register allocator to know when a value's
//! register becomes free.

use kbc_ir::{Function, Operand, INVALID, PINNED};
use log::trace;

pub fn compute_liveness(f: &mut Function) {
    trace!("liveness: {} ops, {} blocks", f.ops.len(), f.blocks.len());
    let op_count = f.ops.len();
    for op in &mut f.ops {
        op.mark = 0;
    }
    // Tracked separately from `Op::live_range` while the pass runs: a use
    // whose index is *less* than its producer's can only be a loop back
    // edge (the header ϕ physically precedes the body that feeds it), and
    // once a producer sees one of those it must stay pinned live for the
    // rest of the function even if a later, ordinary forward use is found
    // for it afterwards — `op.live_range` itself can't hold "unset" and
    // "pinned" as distinct states, so that's tracked here and only folded
    // into `live_range` once every block has been visited.
    let mut last_use: Vec<Option<u32>> = vec![None; op_count];
    let mut crosses_back_edge = vec![false; op_count];

    let mut worklist: Vec<u32> = (0..f.blocks.len() as u32).collect();
    let mut queued = vec![true; f.blocks.len()];

    while let Some(block) = worklist.pop() {
        queued[block as usize] = false;
        let (lower, upper) = (f.blocks[block as usize].lower, f.blocks[block as usize].upper);
        for idx in (lower..upper).rev() {
            let opcode = f.ops[idx as usize].opcode;
            let pinned = opcode.is_pinned_by_effect();
            if pinned {
                f.ops[idx as usize].mark = PINNED;
            }
            if f.ops[idx as usize].mark == 0 && !pinned {
                continue;
            }
            let operands = f.operands_of(idx).to_vec();
            for operand in operands {
                if let Operand::Op(producer) = operand {
                    mark_use(f, producer, idx, &mut last_use, &mut crosses_back_edge);
                }
            }
        }

        // Header ϕ/REF ops import a predecessor's value; walk their
        // operand list again (covered above since header ops are part of
        // the op range) and, for any predecessor whose contributed value
        // newly became live, requeue that predecessor block.
        let mut cursor = f.blocks[block as usize].phi_head;
        while let Some(phi_idx) = cursor {
            cursor = f.ops[phi_idx as usize].phi_next;
            if f.ops[phi_idx as usize].mark == 0 {
                continue;
            }
            for (slot, &pred) in f.predecessors_of(block).to_vec().iter().enumerate() {
                let operands = f.operands_of(phi_idx);
                if slot >= operands.len() {
                    continue;
                }
                if let Operand::Op(producer) = operands[slot] {
                    let became_live = f.ops[producer as usize].mark == 0;
                    mark_use(f, producer, phi_idx, &mut last_use, &mut crosses_back_edge);
                    if became_live && !queued[pred as usize] {
                        queued[pred as usize] = true;
                        worklist.push(pred);
                    }
                }
            }
        }
    }

    for (idx, op) in f.ops.iter_mut().enumerate() {
        op.live_range = if crosses_back_edge[idx] { INVALID } else { last_use[idx].unwrap_or(INVALID) };
    }

    for nested in &mut f.nested {
        compute_liveness(nested);
    }
}

fn mark_use(f: &mut Function, producer: u32, user: u32, last_use: &mut [Option<u32>], crosses_back_edge: &mut [bool]) {
    let op = &mut f.ops[producer as usize];
    if op.mark != PINNED {
        op.mark = op.mark.saturating_add(1);
    }
    if user < producer {
        crosses_back_edge[producer as usize] = true;
    } else {
        let slot = &mut last_use[producer as usize];
        *slot = Some(slot.map_or(user, |cur| cur.max(user)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbc_common::diagnostics::ErrorSink;
    use kbc_common::source::Source;
    use kbc_ir::{build_program, BlockKind, Opcode, Operand};
    use kbc_parser::parser::Parser;
    use kbc_resolve::resolve_program;

    fn build_ir(text: &str) -> Function {
        let mut source = Source::new("t.kf", text);
        let parser = Parser::new(&mut source);
        let (mut program, parse_errors) = parser.parse_program();
        assert!(parse_errors.is_empty(), "{:?}", parse_errors.diagnostics());
        let resolve_errors = resolve_program(&mut program, &mut source);
        assert!(resolve_errors.is_empty(), "{:?}", resolve_errors.diagnostics());
        let mut errors = ErrorSink::new();
        let module = build_program(&program, &mut source, &mut errors);
        assert!(errors.is_empty(), "{:?}", errors.diagnostics());
        module.main
    }

    #[test]
    fn pinned_op_keeps_max_mark_and_marks_its_operands_used() {
        let mut f = Function::new(None, 0, 0, false, false);
        let block = f.open_block(BlockKind::Normal);
        let obj = f.push_op(Opcode::Const, &[Operand::Null], 0);
        let value = f.push_op(Opcode::Const, &[Operand::Number(1.0)], 0);
        let mut source = Source::new("t", "");
        let selector = source.intern("k");
        let set_key = f.push_op(Opcode::SetKey, &[Operand::Op(obj), Operand::Selector(selector), Operand::Op(value)], 0);
        f.close_block(block);
        f.set_predecessors(block, &[]);

        compute_liveness(&mut f);

        assert_eq!(f.ops[set_key as usize].mark, PINNED);
        assert!(f.ops[obj as usize].mark >= 1);
        assert!(f.ops[value as usize].mark >= 1);
    }

    #[test]
    fn unreferenced_non_effectful_op_is_not_marked() {
        let mut f = Function::new(None, 0, 0, false, false);
        let block = f.open_block(BlockKind::Normal);
        let dead = f.push_op(Opcode::Const, &[Operand::Number(1.0)], 0);
        f.close_block(block);
        f.set_predecessors(block, &[]);

        compute_liveness(&mut f);

        assert_eq!(f.ops[dead as usize].mark, 0);
        assert_eq!(f.ops[dead as usize].live_range, INVALID);
    }

    #[test]
    fn forward_join_use_gets_a_finite_live_range() {
        // 2 and 3 are distinct constants, so the join stays a real Phi
        // importing both branch values; neither feeds the header
        // backward, so once marked used their live_range must be finite.
        let mut f = build_ir("var x = 1\nif x\n  x = 2\nelse\n  x = 3\nend\nreturn x");
        compute_liveness(&mut f);
        let phi = f.blocks.iter().find_map(|b| b.phi_head).expect("expected a phi header");
        for &operand in f.operands_of(phi) {
            if let Operand::Op(producer) = operand {
                assert_ne!(f.ops[producer as usize].live_range, INVALID);
            }
        }
    }

    #[test]
    fn loop_carried_value_feeding_the_header_phi_is_pinned_invalid() {
        let mut f = build_ir("var i = 0\nwhile i\n  i = i - 1\nend\nreturn i");
        compute_liveness(&mut f);
        let header = f.blocks.iter().position(|b| b.kind == BlockKind::Loop).expect("while loop header");
        let phi = f.blocks[header].phi_head.expect("loop header must import i through a phi");
        // One of the phi's operands is produced by the body's `i - 1`; that
        // producer's index is *larger* than the phi's own index, so a
        // naive "last use" computation would wrongly shrink its live range
        // below its own definition point.
        let mut saw_back_edge_producer = false;
        for &operand in f.operands_of(phi) {
            if let Operand::Op(producer) = operand {
                if producer > phi {
                    saw_back_edge_producer = true;
                    assert_eq!(f.ops[producer as usize].live_range, INVALID);
                }
            }
        }
        assert!(saw_back_edge_producer, "expected the back-edge operand to be a later op than the header phi");
    }
}
