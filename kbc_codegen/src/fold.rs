//! ϕ simplification, constant folding, dead-block removal, and the
//! use-through rewrite.
//!
//! Operates directly on `kbc_ir::Function` in place, the same shape the
//! later liveness/inline/alloc passes expect: ops are never physically
//! removed from the slab (everything is index-addressed), unreachable
//! blocks are just marked `BlockKind::None` with their ops rewritten to
//! `NOP`, and folded-away ϕ/REF ops are left in place with a zero use
//! count for the liveness pass to drop.

use kbc_common::diagnostics::ErrorSink;
use kbc_common::source::Source;
use kbc_ir::{BlockKind, Function, Opcode, Operand, INVALID};
use log::debug;

pub fn fold_function(f: &mut Function, source: &mut Source, errors: &mut ErrorSink) {
    debug!("fold: {} blocks before simplification", f.blocks.len());
    simplify_phis(f);
    fold_constants(f, source, errors);
    remove_dead_blocks(f);
    use_through_rewrite(f);
    debug!(
        "fold: {} blocks reachable after dead-block removal",
        f.blocks.iter().filter(|b| b.reachable).count()
    );
    for nested in &mut f.nested {
        fold_function(nested, source, errors);
    }
}

/// Drop self-referencing ϕ operands, then collapse any ϕ whose remaining
/// operand set names one distinct definition into a `REF`.
fn simplify_phis(f: &mut Function) {
    for block in 0..f.blocks.len() {
        let mut cursor = f.blocks[block].phi_head;
        while let Some(op_idx) = cursor {
            cursor = f.ops[op_idx as usize].phi_next;
            if f.ops[op_idx as usize].opcode != Opcode::Phi {
                continue;
            }
            let operands = f.operands_of(op_idx).to_vec();
            let distinct: Vec<Operand> = dedup_ignoring_self(&operands, op_idx);
            if distinct.len() == 1 {
                f.ops[op_idx as usize].opcode = Opcode::Ref;
                f.fill_deferred_operands(op_idx, &[distinct[0]]);
            }
        }
    }
}

fn dedup_ignoring_self(operands: &[Operand], self_idx: u32) -> Vec<Operand> {
    let mut out: Vec<Operand> = Vec::new();
    for &o in operands {
        if matches!(o, Operand::Op(i) if i == self_idx) {
            continue;
        }
        if !out.iter().any(|&e| operand_eq(e, o)) {
            out.push(o);
        }
    }
    out
}

fn operand_eq(a: Operand, b: Operand) -> bool {
    match (a, b) {
        (Operand::Op(x), Operand::Op(y)) => x == y,
        (Operand::Number(x), Operand::Number(y)) => x.to_bits() == y.to_bits(),
        (Operand::Null, Operand::Null) | (Operand::True, Operand::True) | (Operand::False, Operand::False) => true,
        (Operand::String(x), Operand::String(y)) => x == y,
        _ => false,
    }
}

/// Fold fully-constant arithmetic/compare/concat/`NOT`/`MOV`/short-circuit
/// shapes and collapse a constant `JUMP_TEST` to an unconditional `JUMP`.
/// One linear pass; this is not fixpoint-iterated, so a constant produced
/// by folding one op is not itself re-folded against a neighboring op in
/// the same run (see DESIGN.md).
fn fold_constants(f: &mut Function, source: &mut Source, errors: &mut ErrorSink) {
    for idx in 0..f.ops.len() {
        let opcode = f.ops[idx].opcode;
        let operands = f.operands_of(idx as u32).to_vec();
        match opcode {
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::IntDiv | Opcode::Mod => {
                if let [Operand::Number(a), Operand::Number(b)] = operands[..] {
                    if let Some(result) = fold_arith(opcode, a, b) {
                        set_const_number(f, idx as u32, result);
                    }
                } else if operands.iter().any(|o| matches!(o, Operand::Number(_)))
                    && operands.iter().any(|o| !matches!(o, Operand::Number(_) | Operand::Op(_)))
                {
                    errors.warning("constant arithmetic on non-number value", f.ops[idx].sloc);
                }
            }
            Opcode::Concat => {
                if let Some(s) = try_fold_concat(source, &operands) {
                    let interned = source.intern(&s);
                    set_const_string(f, idx as u32, interned);
                }
            }
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le => {
                if let [Operand::Number(a), Operand::Number(b)] = operands[..] {
                    let result = match opcode {
                        Opcode::Eq => a == b,
                        Opcode::Ne => a != b,
                        Opcode::Lt => a < b,
                        Opcode::Le => a <= b,
                        _ => unreachable!(),
                    };
                    set_const_bool(f, idx as u32, result);
                }
            }
            Opcode::Not => {
                if let [Operand::True] = operands[..] {
                    set_const_bool(f, idx as u32, false);
                } else if let [Operand::False] | [Operand::Null] = operands[..] {
                    set_const_bool(f, idx as u32, true);
                }
            }
            Opcode::LShift | Opcode::RShift | Opcode::AShift | Opcode::BitAnd | Opcode::BitXor
            | Opcode::BitOr => {
                if let [Operand::Number(a), Operand::Number(b)] = operands[..] {
                    let result = match opcode {
                        Opcode::LShift => ilshift(a, b),
                        Opcode::RShift => irshift(a, b),
                        Opcode::AShift => iashift(a, b),
                        Opcode::BitAnd => ibitand(a, b),
                        Opcode::BitXor => ibitxor(a, b),
                        Opcode::BitOr => ibitor(a, b),
                        _ => unreachable!(),
                    };
                    set_const_number(f, idx as u32, result);
                } else if operands.iter().any(|o| matches!(o, Operand::Number(_)))
                    && operands.iter().any(|o| !matches!(o, Operand::Number(_) | Operand::Op(_)))
                {
                    errors.warning("constant arithmetic on non-number value", f.ops[idx].sloc);
                }
            }
            Opcode::Neg | Opcode::Pos | Opcode::BitNot => {
                if let [Operand::Number(a)] = operands[..] {
                    let result = match opcode {
                        Opcode::Neg => -a,
                        Opcode::Pos => a,
                        Opcode::BitNot => ibitnot(a),
                        _ => unreachable!(),
                    };
                    set_const_number(f, idx as u32, result);
                } else if operands.len() == 1 && !matches!(operands[0], Operand::Op(_)) {
                    errors.warning("constant arithmetic on non-number value", f.ops[idx].sloc);
                }
            }
            Opcode::Mov => {
                // A MOV of a literal is itself a constant; leave the
                // pinning shape alone (register allocation still needs a
                // MOV op present) but this is already effectively constant
                // and the inline pass will treat it as such.
            }
            Opcode::JumpTest => {
                if let Some(truthy) = literal_truthiness(operands[0]) {
                    let targets = operands[1..].to_vec();
                    let keep = if truthy { targets[0] } else { targets[1] };
                    f.ops[idx].opcode = Opcode::Jump;
                    f.fill_deferred_operands(idx as u32, &[keep]);
                }
            }
            _ => {}
        }
    }
}

fn literal_truthiness(o: Operand) -> Option<bool> {
    match o {
        Operand::Null | Operand::False => Some(false),
        Operand::True | Operand::Number(_) | Operand::String(_) => Some(true),
        _ => None,
    }
}

fn fold_arith(op: Opcode, a: f64, b: f64) -> Option<f64> {
    Some(match op {
        Opcode::Add => a + b,
        Opcode::Sub => a - b,
        Opcode::Mul => a * b,
        Opcode::Div => a / b,
        Opcode::IntDiv => ifloordiv(a, b),
        Opcode::Mod => ifloormod(a, b),
        _ => return None,
    })
}

/// Floor division following the divisor's sign.
fn ifloordiv(a: f64, b: f64) -> f64 {
    (a / b).floor()
}

/// Modulo whose result always carries the divisor's sign (`ifloormod`).
fn ifloormod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if (r < 0.0) == (b < 0.0) {
        r
    } else {
        r + b
    }
}

/// Truncate a number to the bit pattern `(uint32_t)(int64_t)u` would
/// produce, per `imath.h`'s `ibitint`: the common in-range case is a plain
/// truncating cast; values outside `[-2^63, 2^63)` (where the `int64_t`
/// cast itself is undefined in the source) fall back to extracting the
/// two's-complement low 32 bits directly from the IEEE-754 mantissa, the
/// same way `ibitint_overflow` does.
fn ibitint(u: f64) -> u32 {
    const I64_MIN_AS_F64: f64 = -9223372036854775808.0; // -2^63
    const I64_MAX_BOUND_AS_F64: f64 = 9223372036854775808.0; // 2^63 (exclusive)
    if u.is_finite() && u >= I64_MIN_AS_F64 && u < I64_MAX_BOUND_AS_F64 {
        return (u as i64) as u32;
    }
    if !u.is_finite() {
        return 0;
    }
    let bits = u.to_bits();
    let exponent = ((bits >> 52) & 0x7ff) as i64 - 1023;
    let mut mantissa = (bits & ((1u64 << 52) - 1)) as i64;
    let shift = exponent - 52;
    if shift >= 0 {
        mantissa = if shift < 64 { mantissa.wrapping_shl(shift as u32) } else { 0 };
    } else {
        mantissa = if shift > -64 { mantissa.wrapping_shr((-shift) as u32) } else { 0 };
    }
    if (bits as i64) < 0 {
        mantissa = mantissa.wrapping_neg();
    }
    mantissa as u32
}

/// `imath.h`'s shift/bitwise family: the *left* operand is the value being
/// operated on, the *right* operand the shift amount or other operand
/// (`spec.md`'s Open Questions section: the `k_math.h`/`kimath.h` variant
/// that swaps these is a bug in the original source, not followed here).
fn ilshift(value: f64, amount: f64) -> f64 {
    let amt = ibitint(amount);
    if amt < 32 { (ibitint(value) << amt) as f64 } else { 0.0 }
}

fn irshift(value: f64, amount: f64) -> f64 {
    let amt = ibitint(amount);
    if amt < 32 { (ibitint(value) >> amt) as f64 } else { 0.0 }
}

fn iashift(value: f64, amount: f64) -> f64 {
    let amt = ibitint(amount);
    if amt < 32 {
        (((ibitint(value) as i32) >> amt) as u32) as f64
    } else {
        u32::MAX as f64
    }
}

fn ibitand(a: f64, b: f64) -> f64 {
    (ibitint(a) & ibitint(b)) as f64
}

fn ibitxor(a: f64, b: f64) -> f64 {
    (ibitint(a) ^ ibitint(b)) as f64
}

fn ibitor(a: f64, b: f64) -> f64 {
    (ibitint(a) | ibitint(b)) as f64
}

fn ibitnot(u: f64) -> f64 {
    (!ibitint(u)) as f64
}

fn try_fold_concat(source: &Source, operands: &[Operand]) -> Option<String> {
    let mut out = String::new();
    for &o in operands {
        match o {
            Operand::Number(n) => out.push_str(&format_number(n)),
            Operand::String(s) => out.push_str(source.interned(s)),
            _ => return None,
        }
    }
    Some(out)
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn set_const_number(f: &mut Function, idx: u32, n: f64) {
    f.ops[idx as usize].opcode = Opcode::Const;
    f.fill_deferred_operands(idx, &[Operand::Number(n)]);
}

fn set_const_bool(f: &mut Function, idx: u32, b: bool) {
    f.ops[idx as usize].opcode = Opcode::Const;
    f.fill_deferred_operands(idx, &[if b { Operand::True } else { Operand::False }]);
}

fn set_const_string(f: &mut Function, idx: u32, s: kbc_common::source::InternedStr) {
    f.ops[idx as usize].opcode = Opcode::Const;
    f.fill_deferred_operands(idx, &[Operand::String(s)]);
}

/// Reachability BFS from block 0 over (already-folded) jump targets; any
/// block not reached has its ops overwritten with `NOP` and its kind set
/// to `NONE`.
fn remove_dead_blocks(f: &mut Function) {
    if f.blocks.is_empty() {
        return;
    }
    let mut reachable = vec![false; f.blocks.len()];
    let mut stack = vec![0u32];
    reachable[0] = true;
    while let Some(b) = stack.pop() {
        for target in successors(f, b) {
            if !reachable[target as usize] {
                reachable[target as usize] = true;
                stack.push(target);
            }
        }
        // A block lacking an explicit terminator falls through to the
        // next block physically adjacent to it.
        if !block_has_terminator(f, b) {
            let next = b + 1;
            if (next as usize) < f.blocks.len() && !reachable[next as usize] {
                reachable[next as usize] = true;
                stack.push(next);
            }
        }
    }
    for (b, &live) in reachable.iter().enumerate() {
        if live {
            continue;
        }
        f.blocks[b].kind = BlockKind::None;
        f.blocks[b].reachable = false;
        let (lower, upper) = (f.blocks[b].lower, f.blocks[b].upper);
        for i in lower..upper {
            f.ops[i as usize].opcode = Opcode::Nop;
            f.ops[i as usize].local = None;
        }
    }
}

fn block_has_terminator(f: &Function, b: u32) -> bool {
    let blk = &f.blocks[b as usize];
    if blk.upper == blk.lower {
        return false;
    }
    f.ops[blk.upper as usize - 1].opcode.is_terminator()
}

fn successors(f: &Function, b: u32) -> Vec<u32> {
    let blk = &f.blocks[b as usize];
    if blk.upper == blk.lower {
        return Vec::new();
    }
    let last = blk.upper - 1;
    if !f.ops[last as usize].opcode.is_terminator() {
        return Vec::new();
    }
    f.operands_of(last)
        .iter()
        .filter_map(|&o| if let Operand::Block(t) = o { Some(t) } else { None })
        .filter(|&t| t != INVALID)
        .collect()
}

/// Rewrite any `Operand::Op(t)` where `t` names a single-operand `REF`
/// into the `REF`'s own operand, recursively to a fixpoint, so later
/// passes see the real producer directly instead of an indirection chain.
fn use_through_rewrite(f: &mut Function) {
    let op_count = f.ops.len();
    for idx in 0..op_count {
        if matches!(f.ops[idx].opcode, Opcode::Nop) {
            continue;
        }
        let resolved: Vec<Operand> = f.operands_of(idx as u32).iter().map(|&o| resolve_through_refs(f, o)).collect();
        if resolved != f.operands_of(idx as u32) {
            f.fill_deferred_operands(idx as u32, &resolved);
        }
    }
}

fn resolve_through_refs(f: &Function, o: Operand) -> Operand {
    let mut current = o;
    loop {
        match current {
            Operand::Op(t) if f.ops[t as usize].opcode == Opcode::Ref => {
                let inner = f.operands_of(t);
                if inner.len() == 1 {
                    current = inner[0];
                    continue;
                }
                return current;
            }
            _ => return current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_fn() -> Function {
        Function::new(None, 0, 0, false, false)
    }

    #[test]
    fn arithmetic_with_two_literal_numbers_folds_to_a_const() {
        let mut f = new_fn();
        let block = f.open_block(BlockKind::Normal);
        let add = f.push_op(Opcode::Add, &[Operand::Number(2.0), Operand::Number(3.0)], 0);
        f.close_block(block);
        f.set_predecessors(block, &[]);

        let mut source = Source::new("t", "");
        let mut errors = ErrorSink::new();
        fold_function(&mut f, &mut source, &mut errors);

        assert!(errors.is_empty());
        assert_eq!(f.ops[add as usize].opcode, Opcode::Const);
        assert_eq!(f.operands_of(add), &[Operand::Number(5.0)]);
    }

    #[test]
    fn comparison_of_two_literal_numbers_folds_to_a_const_bool() {
        let mut f = new_fn();
        let block = f.open_block(BlockKind::Normal);
        let lt = f.push_op(Opcode::Lt, &[Operand::Number(2.0), Operand::Number(3.0)], 0);
        f.close_block(block);
        f.set_predecessors(block, &[]);

        let mut source = Source::new("t", "");
        let mut errors = ErrorSink::new();
        fold_function(&mut f, &mut source, &mut errors);

        assert_eq!(f.ops[lt as usize].opcode, Opcode::Const);
        assert_eq!(f.operands_of(lt), &[Operand::True]);
    }

    #[test]
    fn floor_div_and_mod_follow_the_divisors_sign() {
        assert_eq!(fold_arith(Opcode::IntDiv, -7.0, 2.0), Some(-4.0));
        assert_eq!(fold_arith(Opcode::Mod, -7.0, 2.0), Some(1.0));
        assert_eq!(fold_arith(Opcode::Mod, 7.0, -2.0), Some(-1.0));
    }

    #[test]
    fn shift_left_operand_is_the_value_not_the_amount() {
        // imath.h: `ilshift(value, amount)`; following the source's
        // `k_math.h`/`kimath.h` variant that swaps the operands would be the
        // bug spec.md's Open Questions section warns against reproducing.
        assert_eq!(ilshift(1.0, 4.0), 16.0);
        assert_eq!(irshift(16.0, 4.0), 1.0);
    }

    #[test]
    fn shift_by_32_or_more_yields_zero_except_arithmetic_right_shift() {
        assert_eq!(ilshift(1.0, 32.0), 0.0);
        assert_eq!(irshift(1.0, 32.0), 0.0);
        assert_eq!(iashift(1.0, 32.0), u32::MAX as f64);
    }

    #[test]
    fn arithmetic_right_shift_sign_extends() {
        // -1 as a 32-bit pattern is 0xFFFFFFFF; shifting it right
        // arithmetically by any in-range amount keeps all bits set.
        assert_eq!(iashift(-1.0, 1.0), u32::MAX as f64);
        assert_eq!(iashift(-2.0, 1.0), u32::MAX as f64);
    }

    #[test]
    fn bitwise_ops_truncate_through_uint32() {
        assert_eq!(ibitand(0xFF00_u32 as f64, 0x0FF0_u32 as f64), 0x0F00_u32 as f64);
        assert_eq!(ibitor(0xFF00_u32 as f64, 0x00FF_u32 as f64), 0xFFFF_u32 as f64);
        assert_eq!(ibitxor(0xFFFF_u32 as f64, 0x0F0F_u32 as f64), 0xF0F0_u32 as f64);
        assert_eq!(ibitnot(0.0), u32::MAX as f64);
    }

    #[test]
    fn bitwise_and_shift_ops_fold_to_constants() {
        let mut f = new_fn();
        let block = f.open_block(BlockKind::Normal);
        let shl = f.push_op(Opcode::LShift, &[Operand::Number(1.0), Operand::Number(3.0)], 0);
        let band = f.push_op(Opcode::BitAnd, &[Operand::Number(6.0), Operand::Number(3.0)], 0);
        let neg = f.push_op(Opcode::Neg, &[Operand::Number(5.0)], 0);
        f.close_block(block);
        f.set_predecessors(block, &[]);

        let mut source = Source::new("t", "");
        let mut errors = ErrorSink::new();
        fold_function(&mut f, &mut source, &mut errors);

        assert_eq!(f.ops[shl as usize].opcode, Opcode::Const);
        assert_eq!(f.operands_of(shl), &[Operand::Number(8.0)]);
        assert_eq!(f.ops[band as usize].opcode, Opcode::Const);
        assert_eq!(f.operands_of(band), &[Operand::Number(2.0)]);
        assert_eq!(f.ops[neg as usize].opcode, Opcode::Const);
        assert_eq!(f.operands_of(neg), &[Operand::Number(-5.0)]);
    }

    #[test]
    fn constant_jump_test_collapses_to_an_unconditional_jump() {
        let mut f = new_fn();
        let block = f.open_block(BlockKind::Normal);
        let test = f.push_op(Opcode::JumpTest, &[Operand::True, Operand::Block(1), Operand::Block(2)], 0);
        f.close_block(block);
        f.set_predecessors(block, &[]);
        let then_bb = f.open_block(BlockKind::Normal);
        f.push_op(Opcode::JumpReturn, &[], 0);
        f.close_block(then_bb);
        f.set_predecessors(then_bb, &[0]);
        let else_bb = f.open_block(BlockKind::Normal);
        f.push_op(Opcode::JumpReturn, &[], 0);
        f.close_block(else_bb);
        f.set_predecessors(else_bb, &[]);

        let mut source = Source::new("t", "");
        let mut errors = ErrorSink::new();
        fold_function(&mut f, &mut source, &mut errors);

        assert_eq!(f.ops[test as usize].opcode, Opcode::Jump);
        assert_eq!(f.operands_of(test), &[Operand::Block(1)]);
        // The else block is now unreachable and must be nop'd out.
        assert_eq!(f.blocks[else_bb as usize].kind, BlockKind::None);
        assert!(!f.blocks[else_bb as usize].reachable);
    }

    #[test]
    fn phi_with_one_distinct_operand_collapses_to_ref() {
        let mut f = new_fn();
        let block = f.open_block(BlockKind::Normal);
        let phi = f.push_header_op(block, Opcode::Phi, &[Operand::Number(1.0), Operand::Number(1.0)], 0, 0);
        f.push_op(Opcode::JumpReturn, &[], 0);
        f.close_block(block);
        f.set_predecessors(block, &[]);

        let mut source = Source::new("t", "");
        let mut errors = ErrorSink::new();
        fold_function(&mut f, &mut source, &mut errors);

        assert_eq!(f.ops[phi as usize].opcode, Opcode::Ref);
        assert_eq!(f.operands_of(phi), &[Operand::Number(1.0)]);
    }

    #[test]
    fn use_through_rewrite_resolves_a_ref_indirection_chain() {
        let mut f = new_fn();
        let block = f.open_block(BlockKind::Normal);
        let konst = f.push_op(Opcode::Const, &[Operand::Number(9.0)], 0);
        let single_ref = f.push_header_op(block, Opcode::Ref, &[Operand::Op(konst)], 0, 0);
        let user = f.push_op(Opcode::Neg, &[Operand::Op(single_ref)], 0);
        f.push_op(Opcode::JumpReturn, &[], 0);
        f.close_block(block);
        f.set_predecessors(block, &[]);

        let mut source = Source::new("t", "");
        let mut errors = ErrorSink::new();
        fold_function(&mut f, &mut source, &mut errors);

        assert_eq!(f.operands_of(user), &[Operand::Op(konst)]);
    }
}
