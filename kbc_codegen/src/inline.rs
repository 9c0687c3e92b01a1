//! Constant inlining and constant/selector pool construction. Runs after fold/liveness so it only pays for ops that survived.

use kbc_common::diagnostics::ErrorSink;
use kbc_ir::{Constant, Function, Opcode, Operand, Selector};
use log::debug;
use std::collections::HashMap;

const MAX_POOL_INDEX: usize = 65535;
/// K-form ops pack their constant reference into a single op byte.
const MAX_INLINE_INDEX: usize = 255;

pub fn inline_constants(f: &mut Function, errors: &mut ErrorSink) {
    rewrite_arith_forms(f);
    rewrite_concat_forms(f);
    rewrite_compare_jump_forms(f);
    rewrite_index_forms(f);
    build_pools(f, errors);
    debug!(
        "inline: {} constants, {} selectors pooled",
        f.constants.len(),
        f.selectors.len()
    );
    for nested in &mut f.nested {
        inline_constants(nested, errors);
    }
}

fn as_immediate(n: f64) -> Option<i8> {
    if n.fract() == 0.0 && (n as i64) >= -128 && (n as i64) <= 127 {
        Some(n as i64 as i8)
    } else {
        None
    }
}

/// `ADD`/`SUB`/`MUL` with exactly one literal `Number` operand. `SUB`/`MUL`
/// are commutative-in-the-constant only on one side, so the reversed shape
/// (`c - v`, handled like any other commutative constant) keeps its own
/// `K`/`I` pair instead of negating into the `ADD` forms the way `v - c`
/// does.
fn rewrite_arith_forms(f: &mut Function) {
    for idx in 0..f.ops.len() {
        let opcode = f.ops[idx].opcode;
        if !matches!(opcode, Opcode::Add | Opcode::Sub | Opcode::Mul) {
            continue;
        }
        let operands = f.operands_of(idx as u32).to_vec();
        let [l, r] = [operands[0], operands[1]];
        match (l, r, opcode) {
            (Operand::Op(_), Operand::Number(c), Opcode::Add) => {
                set_k_or_i(f, idx as u32, Opcode::AddK, Opcode::AddI, l, c);
            }
            (Operand::Number(c), Operand::Op(_), Opcode::Add) => {
                set_k_or_i(f, idx as u32, Opcode::AddK, Opcode::AddI, r, c);
            }
            (Operand::Op(_), Operand::Number(c), Opcode::Sub) => {
                set_k_or_i(f, idx as u32, Opcode::AddK, Opcode::AddI, l, -c);
            }
            (Operand::Number(c), Operand::Op(_), Opcode::Sub) => {
                set_k_or_i(f, idx as u32, Opcode::SubK, Opcode::SubI, r, c);
            }
            (Operand::Op(_), Operand::Number(c), Opcode::Mul) => {
                set_k_or_i(f, idx as u32, Opcode::MulK, Opcode::MulI, l, c);
            }
            (Operand::Number(c), Operand::Op(_), Opcode::Mul) => {
                set_k_or_i(f, idx as u32, Opcode::MulK, Opcode::MulI, r, c);
            }
            _ => {}
        }
    }
}

fn set_k_or_i(f: &mut Function, idx: u32, k_opcode: Opcode, i_opcode: Opcode, value: Operand, constant: f64) {
    if let Some(imm) = as_immediate(constant) {
        f.ops[idx as usize].opcode = i_opcode;
        f.fill_deferred_operands(idx, &[value, Operand::ImmediateI8(imm)]);
    } else {
        f.ops[idx as usize].opcode = k_opcode;
        f.fill_deferred_operands(idx, &[value, Operand::Number(constant)]);
    }
}

/// `CONCAT` with exactly one literal `Number`/`String` operand: `ConcatK`
/// when the literal is the right operand, `RConcatK` when it's the left.
/// Both leave the literal in the operand list for `build_pools` to pour
/// into the constant pool below; neither folds two literals together (that
/// already happened, fully, during the fold pass).
fn rewrite_concat_forms(f: &mut Function) {
    for idx in 0..f.ops.len() {
        if f.ops[idx].opcode != Opcode::Concat {
            continue;
        }
        let operands = f.operands_of(idx as u32).to_vec();
        let [l, r] = [operands[0], operands[1]];
        let is_literal = |o: Operand| matches!(o, Operand::Number(_) | Operand::String(_));
        match (l, r) {
            (Operand::Op(_), other) if is_literal(other) => {
                f.ops[idx].opcode = Opcode::ConcatK;
                f.fill_deferred_operands(idx as u32, &[l, other]);
            }
            (other, Operand::Op(_)) if is_literal(other) => {
                f.ops[idx].opcode = Opcode::RConcatK;
                f.fill_deferred_operands(idx as u32, &[r, other]);
            }
            _ => {}
        }
    }
}

/// `EQ`/`NE`/`LT`/`LE` feeding a `JUMP_TEST` whose condition operand is
/// exactly that comparison's result, and only used there (mark == 1): fuse
/// into `JEQK`/`JNEK`/`JLTK`/`JGTK`/`JLEK`/`JGEK` when the comparison's
/// other operand is a literal constant.
fn rewrite_compare_jump_forms(f: &mut Function) {
    for idx in 0..f.ops.len() {
        if f.ops[idx].opcode != Opcode::JumpTest {
            continue;
        }
        let operands = f.operands_of(idx as u32).to_vec();
        let Operand::Op(cmp_idx) = operands[0] else { continue };
        let cmp_idx = cmp_idx as usize;
        if f.ops[cmp_idx].mark > 1 {
            continue; // comparison result used elsewhere; keep it standalone
        }
        let cmp_opcode = f.ops[cmp_idx].opcode;
        let Some(fused) = fused_jump_opcode(cmp_opcode) else { continue };
        let cmp_operands = f.operands_of(cmp_idx as u32).to_vec();
        let (value, constant, fused) = match cmp_operands[..] {
            [Operand::Op(_), Operand::Number(c)] => (cmp_operands[0], c, fused.0),
            [Operand::Number(c), Operand::Op(_)] => (cmp_operands[1], c, fused.1),
            _ => continue,
        };
        f.ops[idx].opcode = fused;
        let targets = operands[1..].to_vec();
        let mut new_operands = vec![value, Operand::Number(constant)];
        new_operands.extend(targets);
        f.fill_deferred_operands(idx as u32, &new_operands);
        f.ops[cmp_idx].opcode = Opcode::Nop;
    }
}

/// Returns `(opcode-when-constant-is-rhs, opcode-when-constant-is-lhs)`.
fn fused_jump_opcode(cmp: Opcode) -> Option<(Opcode, Opcode)> {
    match cmp {
        Opcode::Eq => Some((Opcode::JEqK, Opcode::JEqK)),
        Opcode::Ne => Some((Opcode::JNeK, Opcode::JNeK)),
        Opcode::Lt => Some((Opcode::JLtK, Opcode::JGtK)),
        Opcode::Le => Some((Opcode::JLeK, Opcode::JGeK)),
        _ => None,
    }
}

/// `GET_INDEX`/`SET_INDEX` with a literal index.
fn rewrite_index_forms(f: &mut Function) {
    for idx in 0..f.ops.len() {
        let opcode = f.ops[idx].opcode;
        if !matches!(opcode, Opcode::GetIndex | Opcode::SetIndex) {
            continue;
        }
        let operands = f.operands_of(idx as u32).to_vec();
        let index = operands[1];
        let (k_opcode, i_opcode) = if opcode == Opcode::GetIndex {
            (Opcode::GetIndexK, Opcode::GetIndexI)
        } else {
            (Opcode::SetIndexK, Opcode::SetIndexI)
        };
        match index {
            Operand::Number(n) => {
                let mut rest = operands.clone();
                if let Some(imm) = as_immediate(n) {
                    rest[1] = Operand::ImmediateI8(imm);
                    f.ops[idx].opcode = i_opcode;
                } else {
                    f.ops[idx].opcode = k_opcode;
                }
                f.fill_deferred_operands(idx as u32, &rest);
            }
            Operand::String(_) => {
                f.ops[idx].opcode = k_opcode;
                f.fill_deferred_operands(idx as u32, &operands);
            }
            _ => {}
        }
    }
}

/// Dedup every surviving literal `Number`/`String` into `Function::constants`
/// and every `Selector` into `Function::selectors`, rewriting operands to
/// `ConstIndex`/`SelectorIndex`. Caps enforced per the pool-size limits in
/// the bytecode contract.
fn build_pools(f: &mut Function, errors: &mut ErrorSink) {
    let mut const_index: HashMap<u64, u32> = HashMap::new();
    let mut selector_index: HashMap<u64, u32> = HashMap::new();

    for idx in 0..f.ops.len() {
        let opcode = f.ops[idx].opcode;
        if opcode == Opcode::Nop {
            continue;
        }
        // K-form ops pack their constant reference into a single 8-bit op
        // field; every other op addresses the full 16-bit-indexed pool.
        let is_inline_form = matches!(
            opcode,
            Opcode::AddK
                | Opcode::SubK
                | Opcode::MulK
                | Opcode::ConcatK
                | Opcode::RConcatK
                | Opcode::JEqK
                | Opcode::JNeK
                | Opcode::JLtK
                | Opcode::JGtK
                | Opcode::JLeK
                | Opcode::JGeK
                | Opcode::GetIndexK
                | Opcode::SetIndexK
        );
        let cap = if is_inline_form { MAX_INLINE_INDEX } else { MAX_POOL_INDEX };
        let operands = f.operands_of(idx as u32).to_vec();
        let mut changed = false;
        let mut rewritten = operands.clone();
        for (slot, operand) in operands.iter().enumerate() {
            match *operand {
                Operand::Number(n) => {
                    let constant = Constant::Number(n);
                    let key = constant.dedup_key();
                    let index = *const_index.entry(key).or_insert_with(|| {
                        f.constants.push(constant);
                        (f.constants.len() - 1) as u32
                    });
                    if index as usize > cap {
                        errors.error("too many constants", f.sloc);
                        continue;
                    }
                    rewritten[slot] = Operand::ConstIndex(index);
                    changed = true;
                }
                Operand::String(s) => {
                    let constant = Constant::Str(s);
                    let key = constant.dedup_key();
                    let index = *const_index.entry(key).or_insert_with(|| {
                        f.constants.push(constant);
                        (f.constants.len() - 1) as u32
                    });
                    if index as usize > cap {
                        errors.error("too many constants", f.sloc);
                        continue;
                    }
                    rewritten[slot] = Operand::ConstIndex(index);
                    changed = true;
                }
                Operand::Selector(name) => {
                    use lasso::Key;
                    let key = name.into_usize() as u64;
                    let index = *selector_index.entry(key).or_insert_with(|| {
                        f.selectors.push(Selector { name });
                        (f.selectors.len() - 1) as u32
                    });
                    if index as usize > MAX_POOL_INDEX {
                        errors.error("too many selectors", f.sloc);
                        continue;
                    }
                    rewritten[slot] = Operand::SelectorIndex(index);
                    changed = true;
                }
                _ => {}
            }
        }
        if changed {
            f.fill_deferred_operands(idx as u32, &rewritten);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbc_common::source::Source;

    #[test]
    fn small_integer_add_constant_becomes_addi() {
        let mut f = Function::new(None, 0, 0, false, false);
        let x = f.push_op(Opcode::Const, &[Operand::Number(1.0)], 0);
        let add = f.push_op(Opcode::Add, &[Operand::Op(x), Operand::Number(5.0)], 0);
        let mut errors = ErrorSink::new();

        inline_constants(&mut f, &mut errors);

        assert_eq!(f.ops[add as usize].opcode, Opcode::AddI);
        assert_eq!(f.operands_of(add), &[Operand::Op(x), Operand::ImmediateI8(5)]);
    }

    #[test]
    fn large_fractional_add_constant_becomes_addk_and_lands_in_the_pool() {
        let mut f = Function::new(None, 0, 0, false, false);
        let x = f.push_op(Opcode::Const, &[Operand::Number(1.0)], 0);
        let add = f.push_op(Opcode::Add, &[Operand::Op(x), Operand::Number(2.5)], 0);
        let mut errors = ErrorSink::new();

        inline_constants(&mut f, &mut errors);

        assert_eq!(f.ops[add as usize].opcode, Opcode::AddK);
        assert_eq!(f.operands_of(add)[0], Operand::Op(x));
        assert_eq!(f.operands_of(add)[1], Operand::ConstIndex(0));
        assert!(errors.is_empty());
    }

    #[test]
    fn subtracting_a_small_integer_from_a_constant_uses_subi_not_negated_addi() {
        // `5 - x` can't be expressed as `x + (-5)`, so it keeps its own
        // reversed form rather than reusing AddK/AddI.
        let mut f = Function::new(None, 0, 0, false, false);
        let x = f.push_op(Opcode::Const, &[Operand::Number(1.0)], 0);
        let sub = f.push_op(Opcode::Sub, &[Operand::Number(5.0), Operand::Op(x)], 0);
        let mut errors = ErrorSink::new();

        inline_constants(&mut f, &mut errors);

        assert_eq!(f.ops[sub as usize].opcode, Opcode::SubI);
        assert_eq!(f.operands_of(sub), &[Operand::Op(x), Operand::ImmediateI8(5)]);
    }

    #[test]
    fn subtracting_a_fractional_constant_from_a_constant_uses_subk() {
        let mut f = Function::new(None, 0, 0, false, false);
        let x = f.push_op(Opcode::Const, &[Operand::Number(1.0)], 0);
        let sub = f.push_op(Opcode::Sub, &[Operand::Number(5.5), Operand::Op(x)], 0);
        let mut errors = ErrorSink::new();

        inline_constants(&mut f, &mut errors);

        assert_eq!(f.ops[sub as usize].opcode, Opcode::SubK);
        assert_eq!(f.operands_of(sub)[0], Operand::Op(x));
        assert!(matches!(f.operands_of(sub)[1], Operand::ConstIndex(_)));
    }

    #[test]
    fn multiplying_by_a_small_integer_constant_becomes_muli() {
        let mut f = Function::new(None, 0, 0, false, false);
        let x = f.push_op(Opcode::Const, &[Operand::Number(1.0)], 0);
        let mul = f.push_op(Opcode::Mul, &[Operand::Number(3.0), Operand::Op(x)], 0);
        let mut errors = ErrorSink::new();

        inline_constants(&mut f, &mut errors);

        assert_eq!(f.ops[mul as usize].opcode, Opcode::MulI);
        assert_eq!(f.operands_of(mul), &[Operand::Op(x), Operand::ImmediateI8(3)]);
    }

    #[test]
    fn concat_with_a_trailing_literal_becomes_concatk() {
        let mut f = Function::new(None, 0, 0, false, false);
        let mut source = Source::new("t", "");
        let greeting = source.intern("!");
        let x = f.push_op(Opcode::Const, &[Operand::Null], 0);
        let concat = f.push_op(Opcode::Concat, &[Operand::Op(x), Operand::String(greeting)], 0);
        let mut errors = ErrorSink::new();

        inline_constants(&mut f, &mut errors);

        assert_eq!(f.ops[concat as usize].opcode, Opcode::ConcatK);
        assert_eq!(f.operands_of(concat)[0], Operand::Op(x));
        assert!(matches!(f.operands_of(concat)[1], Operand::ConstIndex(_)));
    }

    #[test]
    fn concat_with_a_leading_literal_becomes_rconcatk() {
        let mut f = Function::new(None, 0, 0, false, false);
        let mut source = Source::new("t", "");
        let greeting = source.intern("hi ");
        let x = f.push_op(Opcode::Const, &[Operand::Null], 0);
        let concat = f.push_op(Opcode::Concat, &[Operand::String(greeting), Operand::Op(x)], 0);
        let mut errors = ErrorSink::new();

        inline_constants(&mut f, &mut errors);

        assert_eq!(f.ops[concat as usize].opcode, Opcode::RConcatK);
        assert_eq!(f.operands_of(concat)[0], Operand::Op(x));
    }

    #[test]
    fn comparison_feeding_only_a_jump_test_fuses_and_the_comparison_becomes_nop() {
        let mut f = Function::new(None, 0, 0, false, false);
        let x = f.push_op(Opcode::Const, &[Operand::Null], 0);
        let cmp = f.push_op(Opcode::Eq, &[Operand::Op(x), Operand::Number(1.0)], 0);
        let jump = f.push_op(Opcode::JumpTest, &[Operand::Op(cmp), Operand::Block(0), Operand::Block(1)], 0);
        let mut errors = ErrorSink::new();

        inline_constants(&mut f, &mut errors);

        assert_eq!(f.ops[jump as usize].opcode, Opcode::JEqK);
        assert_eq!(f.ops[cmp as usize].opcode, Opcode::Nop);
        let operands = f.operands_of(jump);
        assert_eq!(operands[0], Operand::Op(x));
        assert!(matches!(operands[1], Operand::ConstIndex(_)));
        assert_eq!(&operands[2..], &[Operand::Block(0), Operand::Block(1)]);
    }

    #[test]
    fn comparison_used_elsewhere_too_is_left_standalone() {
        let mut f = Function::new(None, 0, 0, false, false);
        let x = f.push_op(Opcode::Const, &[Operand::Null], 0);
        let cmp = f.push_op(Opcode::Eq, &[Operand::Op(x), Operand::Number(1.0)], 0);
        let jump = f.push_op(Opcode::JumpTest, &[Operand::Op(cmp), Operand::Block(0), Operand::Block(1)], 0);
        f.ops[cmp as usize].mark = 2; // also consumed by something else
        let mut errors = ErrorSink::new();

        inline_constants(&mut f, &mut errors);

        assert_eq!(f.ops[jump as usize].opcode, Opcode::JumpTest);
        assert_eq!(f.ops[cmp as usize].opcode, Opcode::Eq);
    }

    #[test]
    fn get_index_with_a_small_integer_literal_becomes_get_index_i() {
        let mut f = Function::new(None, 0, 0, false, false);
        let obj = f.push_op(Opcode::Const, &[Operand::Null], 0);
        let get = f.push_op(Opcode::GetIndex, &[Operand::Op(obj), Operand::Number(3.0)], 0);
        let mut errors = ErrorSink::new();

        inline_constants(&mut f, &mut errors);

        assert_eq!(f.ops[get as usize].opcode, Opcode::GetIndexI);
        assert_eq!(f.operands_of(get)[1], Operand::ImmediateI8(3));
    }

    #[test]
    fn identical_constants_across_two_ops_dedup_to_one_pool_entry() {
        let mut f = Function::new(None, 0, 0, false, false);
        let x = f.push_op(Opcode::Const, &[Operand::Null], 0);
        let y = f.push_op(Opcode::Const, &[Operand::Null], 0);
        let add1 = f.push_op(Opcode::Add, &[Operand::Op(x), Operand::Number(2.5)], 0);
        let add2 = f.push_op(Opcode::Add, &[Operand::Op(y), Operand::Number(2.5)], 0);
        let mut errors = ErrorSink::new();

        inline_constants(&mut f, &mut errors);

        assert_eq!(f.constants.len(), 1);
        assert_eq!(f.operands_of(add1)[1], Operand::ConstIndex(0));
        assert_eq!(f.operands_of(add2)[1], Operand::ConstIndex(0));
    }
}
