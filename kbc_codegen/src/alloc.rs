//! Linear-scan register allocation.
//!
//! Runs after liveness, which already populated `Op::mark`/`Op::live_range`.
//! Walks the flat `ops` array once (already block-ordered by construction),
//! expiring registers whose value's last use has passed and handing out the
//! lowest free register to everything else, with a few fixed shapes:
//! parameters keep their parameter-index register for the whole function,
//! pinning ops (`MOV`/`B_DEF`/`B_PHI`) reuse their source operand's
//! register instead of taking a fresh one, and floated ops (`CALL`/`YCALL`/
//! `YIELD`/`JUMP_RETURN`/`JUMP_FOR_SGEN`) get a contiguous block at the top
//! of the currently-used register range for their arguments.
//!
//! Conservative simplification (see DESIGN.md): a value whose `live_range`
//! is `INVALID` (it survives into a successor block's ϕ/REF) is never freed
//! within this pass and stays reserved for the rest of the function, rather
//! than being retired at its true last use in a later block. This is safe
//! (no register is ever reused while still live) but can over-allocate.

use kbc_ir::{Function, Opcode, INVALID};
use log::debug;

pub fn allocate_registers(f: &mut Function) {
    let reg_count = 1 + f.param_count; // register 0 is self/receiver
    let mut free_from = reg_count;
    let mut highest = reg_count.saturating_sub(1);
    // (op index whose live_range ends here, register) sorted by live_range.
    let mut active: Vec<(u32, u32)> = Vec::new();
    let mut free_list: Vec<u32> = Vec::new();

    for slot in 0..f.param_count {
        // Parameter REF ops are the first `param_count` ops emitted by the
        // builder's prologue, in order.
        if (slot as usize) < f.ops.len() {
            f.ops[slot as usize].r = Some((slot + 1) as u8);
        }
    }

    for idx in (f.param_count as usize)..f.ops.len() {
        let i = idx as u32;
        expire(&mut active, &mut free_list, i);

        let opcode = f.ops[idx].opcode;
        let mark = f.ops[idx].mark;
        let needs_result = mark != 0 && opcode != Opcode::Nop && opcode != Opcode::Block;
        if !needs_result {
            continue;
        }

        let (reg, width) = if opcode.is_pinning() && !opcode.is_floated() {
            (pinned_register(f, i).unwrap_or_else(|| take_free(&mut free_list, &mut free_from)), 1)
        } else if opcode.is_floated() {
            let argc = f.operands_of(i).len() as u32;
            let width = argc.max(1);
            (take_contiguous(&mut free_list, &mut free_from, width), width)
        } else {
            (take_free(&mut free_list, &mut free_from), 1)
        };

        f.ops[idx].r = Some(reg as u8);
        // A floated op's `r` is only the base of its contiguous argument
        // block; `stack_size` must cover every register in that block, not
        // just the base, or the emitted frame size is too small for the
        // VM to actually place the arguments.
        highest = highest.max(reg + width - 1);

        let live_range = f.ops[idx].live_range;
        if live_range != INVALID {
            active.push((live_range, reg));
            active.sort_by_key(|&(end, _)| end);
        }
        // live_range == INVALID: value crosses into a successor block;
        // left out of `active` so it's never reclaimed (see module doc).
    }

    f.stack_size = highest + 1;
    debug!("alloc: stack_size = {} for function at sloc {}", f.stack_size, f.sloc);
    for nested in &mut f.nested {
        allocate_registers(nested);
    }
}

fn expire(active: &mut Vec<(u32, u32)>, free_list: &mut Vec<u32>, now: u32) {
    let mut i = 0;
    while i < active.len() {
        if active[i].0 < now {
            free_list.push(active[i].1);
            active.remove(i);
        } else {
            i += 1;
        }
    }
}

fn take_free(free_list: &mut Vec<u32>, free_from: &mut u32) -> u32 {
    if let Some(pos) = free_list.iter().enumerate().min_by_key(|&(_, &r)| r).map(|(p, _)| p) {
        free_list.remove(pos)
    } else {
        let r = *free_from;
        *free_from += 1;
        r
    }
}

/// A floated op's arguments must land on contiguous top-of-stack registers;
/// the cheapest way to guarantee that without tracking per-register slot
/// ownership is to ignore the free list here and take a fresh contiguous
/// run instead (the free registers it skips over remain available for
/// later, non-floated allocations).
fn take_contiguous(_free_list: &mut [u32], free_from: &mut u32, count: u32) -> u32 {
    let base = *free_from;
    *free_from += count;
    base
}

/// `MOV`/`B_DEF`/`B_PHI` reuse the register of their first `Op` operand
/// rather than taking a new one.
fn pinned_register(f: &Function, idx: u32) -> Option<u32> {
    let operands = f.operands_of(idx);
    for &operand in operands {
        if let kbc_ir::Operand::Op(src) = operand {
            if let Some(r) = f.ops[src as usize].r {
                return Some(r as u32);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbc_ir::Operand;

    #[test]
    fn parameters_keep_their_parameter_indexed_register() {
        let mut f = Function::new(None, 0, 2, false, false);
        let p0 = f.push_op(Opcode::Ref, &[Operand::Local(0)], 0);
        let p1 = f.push_op(Opcode::Ref, &[Operand::Local(1)], 0);

        allocate_registers(&mut f);

        assert_eq!(f.ops[p0 as usize].r, Some(1));
        assert_eq!(f.ops[p1 as usize].r, Some(2));
    }

    #[test]
    fn mov_reuses_its_source_operands_register() {
        let mut f = Function::new(None, 0, 0, false, false);
        let konst = f.push_op(Opcode::Const, &[Operand::Number(5.0)], 0);
        let mov = f.push_op(Opcode::Mov, &[Operand::Op(konst)], 0);
        f.ops[konst as usize].mark = 1;
        f.ops[mov as usize].mark = 1;

        allocate_registers(&mut f);

        assert!(f.ops[konst as usize].r.is_some());
        assert_eq!(f.ops[mov as usize].r, f.ops[konst as usize].r);
    }

    #[test]
    fn a_multi_arg_call_gets_contiguous_registers_and_stack_size_covers_the_whole_block() {
        let mut f = Function::new(None, 0, 0, false, false);
        let a = f.push_op(Opcode::Const, &[Operand::Number(1.0)], 0);
        let b = f.push_op(Opcode::Const, &[Operand::Number(2.0)], 0);
        let c = f.push_op(Opcode::Const, &[Operand::Number(3.0)], 0);
        let call = f.push_op(Opcode::Call, &[Operand::Op(a), Operand::Op(b), Operand::Op(c)], 0);
        for op in [a, b, c, call] {
            f.ops[op as usize].mark = 1;
        }

        allocate_registers(&mut f);

        let base = f.ops[call as usize].r.expect("call must get a register") as u32;
        // register 0 is self; a/b/c each take one of registers 1..=3, so the
        // call's 3-wide contiguous block starts at register 4.
        assert_eq!(base, 4);
        // The top register actually used is base + argc - 1 = 6; stack_size
        // must be at least one past that, or the VM's declared frame is too
        // small to hold the call's own argument block.
        assert!(f.stack_size as u32 >= base + 3);
    }

    #[test]
    fn a_value_with_invalid_live_range_is_never_reclaimed() {
        let mut f = Function::new(None, 0, 0, false, false);
        let long_lived = f.push_op(Opcode::Const, &[Operand::Number(1.0)], 0); // idx 0
        let other = f.push_op(Opcode::Const, &[Operand::Number(2.0)], 0); // idx 1, dies at idx 1
        let third = f.push_op(Opcode::Const, &[Operand::Number(3.0)], 0); // idx 2
        let fourth = f.push_op(Opcode::Const, &[Operand::Number(4.0)], 0); // idx 3
        f.ops[long_lived as usize].mark = 1; // live_range stays INVALID (default): never expires
        f.ops[other as usize].mark = 1;
        f.ops[other as usize].live_range = 1;
        f.ops[third as usize].mark = 1;
        f.ops[fourth as usize].mark = 1;

        allocate_registers(&mut f);

        let long_reg = f.ops[long_lived as usize].r.unwrap();
        // `other`'s register is freed right after its own index (idx 1) and
        // gets reused by `third`, but `long_lived`'s must never reappear
        // since it was never added to the expiring `active` set.
        assert_eq!(f.ops[other as usize].r, f.ops[third as usize].r);
        assert_ne!(f.ops[third as usize].r.unwrap(), long_reg);
        assert_ne!(f.ops[fourth as usize].r.unwrap(), long_reg);
    }
}
