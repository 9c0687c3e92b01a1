//! Per-function IR and the op/operand slab layout.

use crate::op::{Opcode, Operand, INVALID};
use kbc_common::source::{InternedStr, SrcLoc};
use kbc_parser::ast::OutEnvSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Normal,
    Loop,
    /// Set by the fold pass once a block is proven unreachable; its op
    /// range is overwritten with `NOP`.
    None,
}

/// One basic block: a straight-line `[lower, upper)` run of ops in the
/// function's flat `ops` array, terminated by the last op in that range.
#[derive(Debug, Clone)]
pub struct Block {
    pub kind: BlockKind,
    pub lower: u32,
    pub upper: u32,
    /// Linked list (via `Op::phi_next`) of the PHI/REF ops that sit in this
    /// block's header, importing values from predecessors.
    pub phi_head: Option<u32>,
    pub phi_tail: Option<u32>,
    /// `[preceding_lower, preceding_upper)` slice into `Function::preceding`.
    pub preceding_lower: u32,
    pub preceding_upper: u32,
    pub reachable: bool,
}

impl Block {
    fn new(kind: BlockKind, lower: u32) -> Self {
        Self {
            kind,
            lower,
            upper: lower,
            phi_head: None,
            phi_tail: None,
            preceding_lower: 0,
            preceding_upper: 0,
            reachable: true,
        }
    }
}

/// A single IR instruction. `oindex`/`ocount` slice into the owning
/// function's shared `operands` array rather than each op carrying its own
/// `Vec`.
#[derive(Debug, Clone)]
pub struct Op {
    pub opcode: Opcode,
    pub oindex: u32,
    pub ocount: u8,
    /// SSA target local, set for `PHI`/`REF`/`MOV` and any other op that
    /// directly redefines a local's current value.
    pub local: Option<u32>,
    /// Index of this op's last use within its own block, or `INVALID` if
    /// the value survives the block (imported by a `PHI`/`REF` downstream).
    pub live_range: u32,
    /// Liveness use-count (saturating), or `PINNED`.
    pub mark: u8,
    /// Allocated register, filled in by the register allocator.
    pub r: Option<u8>,
    /// Linked list of PHI/REF ops sharing a block header.
    pub phi_next: Option<u32>,
    pub sloc: SrcLoc,
}

impl Op {
    fn new(opcode: Opcode, oindex: u32, ocount: u8, sloc: SrcLoc) -> Self {
        Self { opcode, oindex, ocount, local: None, live_range: INVALID, mark: 0, r: None, phi_next: None, sloc }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Constant {
    Number(f64),
    Str(InternedStr),
}

impl Constant {
    /// Numbers are deduplicated by bit pattern so `-0.0`/`+0.0` and every
    /// NaN payload stay distinct.
    pub fn dedup_key(&self) -> u64 {
        use lasso::Key;
        match self {
            Constant::Number(n) => n.to_bits(),
            Constant::Str(s) => 0x8000_0000_0000_0000 | (s.into_usize() as u64),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Selector {
    pub name: InternedStr,
}

/// One IR-level outenv entry, carried over from the resolved AST so the builder can emit `GET_OUTENV`/`SET_OUTENV`/`F_OUTENV`
/// without re-deriving capture structure.
pub type IrOutEnv = OutEnvSource;

/// Owned IR for one function. Nested closures are lowered
/// into their own `Function` and referenced from the enclosing one via
/// `Opcode::Function` operands indexing `nested`.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: Option<InternedStr>,
    pub sloc: SrcLoc,
    pub param_count: u32,
    pub has_varargs: bool,
    pub is_method: bool,

    pub ops: Vec<Op>,
    pub operands: Vec<Operand>,
    pub blocks: Vec<Block>,
    pub preceding: Vec<u32>,

    pub constants: Vec<Constant>,
    pub selectors: Vec<Selector>,

    pub outenvs: Vec<IrOutEnv>,
    pub max_upstack_size: u32,

    /// Filled in by the register allocator: highest register allocated + 1.
    pub stack_size: u32,

    pub nested: Vec<Function>,

    /// Surface-level spelling of each local by index, carried over from the
    /// resolved AST for the debug variable table; `None` for the hidden
    /// loop-state/vararg slots that never had a user-facing name.
    pub local_names: Vec<Option<InternedStr>>,
}

impl Function {
    pub fn new(name: Option<InternedStr>, sloc: SrcLoc, param_count: u32, has_varargs: bool, is_method: bool) -> Self {
        Self {
            name,
            sloc,
            param_count,
            has_varargs,
            is_method,
            ops: Vec::new(),
            operands: Vec::new(),
            blocks: Vec::new(),
            preceding: Vec::new(),
            constants: Vec::new(),
            selectors: Vec::new(),
            outenvs: Vec::new(),
            max_upstack_size: 0,
            stack_size: 0,
            nested: Vec::new(),
            local_names: Vec::new(),
        }
    }

    pub fn operands_of(&self, op: u32) -> &[Operand] {
        let op = &self.ops[op as usize];
        &self.operands[op.oindex as usize..op.oindex as usize + op.ocount as usize]
    }

    pub fn operands_of_mut(&mut self, op: u32) -> &mut [Operand] {
        let o = &self.ops[op as usize];
        let (start, end) = (o.oindex as usize, o.oindex as usize + o.ocount as usize);
        &mut self.operands[start..end]
    }

    /// Append a new op with the given operands, returning its index.
    pub fn push_op(&mut self, opcode: Opcode, operands: &[Operand], sloc: SrcLoc) -> u32 {
        let oindex = self.operands.len() as u32;
        self.operands.extend_from_slice(operands);
        let ocount = operands.len().try_into().expect("op with more than 255 operands");
        let idx = self.ops.len() as u32;
        self.ops.push(Op::new(opcode, oindex, ocount, sloc));
        idx
    }

    pub fn open_block(&mut self, kind: BlockKind) -> u32 {
        let lower = self.ops.len() as u32;
        let idx = self.blocks.len() as u32;
        self.blocks.push(Block::new(kind, lower));
        idx
    }

    pub fn close_block(&mut self, block: u32) {
        let upper = self.ops.len() as u32;
        self.blocks[block as usize].upper = upper;
    }

    pub fn set_predecessors(&mut self, block: u32, preds: &[u32]) {
        let lower = self.preceding.len() as u32;
        self.preceding.extend_from_slice(preds);
        let upper = self.preceding.len() as u32;
        self.blocks[block as usize].preceding_lower = lower;
        self.blocks[block as usize].preceding_upper = upper;
    }

    pub fn predecessors_of(&self, block: u32) -> &[u32] {
        let b = &self.blocks[block as usize];
        &self.preceding[b.preceding_lower as usize..b.preceding_upper as usize]
    }

    /// Append a PHI/REF op to a block's header linked list.
    pub fn push_header_op(&mut self, block: u32, opcode: Opcode, operands: &[Operand], local: u32, sloc: SrcLoc) -> u32 {
        let idx = self.push_op(opcode, operands, sloc);
        self.ops[idx as usize].local = Some(local);
        self.link_header_op(block, idx);
        idx
    }

    /// Reserve a PHI header op before its operands are known (a loop-header
    /// PHI whose back-edge predecessor hasn't been built yet). Fill it in
    /// later with [`Function::fill_deferred_operands`] once every
    /// predecessor has a value to offer.
    pub fn push_header_op_deferred(&mut self, block: u32, opcode: Opcode, local: u32, sloc: SrcLoc) -> u32 {
        let idx = self.push_op(opcode, &[], sloc);
        self.ops[idx as usize].local = Some(local);
        self.link_header_op(block, idx);
        idx
    }

    /// Supply the final operand list for an op reserved via
    /// [`Function::push_header_op_deferred`]. The operands slab is
    /// append-only, so this appends a fresh range rather than overwriting
    /// the original (empty) one.
    pub fn fill_deferred_operands(&mut self, op: u32, operands: &[Operand]) {
        let oindex = self.operands.len() as u32;
        self.operands.extend_from_slice(operands);
        let ocount = operands.len().try_into().expect("op with more than 255 operands");
        self.ops[op as usize].oindex = oindex;
        self.ops[op as usize].ocount = ocount;
    }

    fn link_header_op(&mut self, block: u32, idx: u32) {
        let b = &mut self.blocks[block as usize];
        match b.phi_tail {
            None => {
                b.phi_head = Some(idx);
                b.phi_tail = Some(idx);
            }
            Some(tail) => {
                self.ops[tail as usize].phi_next = Some(idx);
                b.phi_tail = Some(idx);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Module {
    pub main: Function,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operands_of_slices_into_the_shared_operands_array() {
        let mut f = Function::new(None, 0, 0, false, false);
        let a = f.push_op(Opcode::Const, &[Operand::Number(1.0)], 0);
        let b = f.push_op(Opcode::Add, &[Operand::Op(a), Operand::Number(2.0)], 0);
        assert_eq!(f.operands_of(a), &[Operand::Number(1.0)]);
        assert_eq!(f.operands_of(b), &[Operand::Op(a), Operand::Number(2.0)]);
    }

    #[test]
    fn operands_of_mut_allows_in_place_operand_rewrites() {
        let mut f = Function::new(None, 0, 0, false, false);
        let a = f.push_op(Opcode::Const, &[Operand::Number(1.0)], 0);
        f.operands_of_mut(a)[0] = Operand::Number(9.0);
        assert_eq!(f.operands_of(a), &[Operand::Number(9.0)]);
    }

    #[test]
    fn open_close_block_records_the_ops_pushed_in_between() {
        let mut f = Function::new(None, 0, 0, false, false);
        let block = f.open_block(BlockKind::Normal);
        f.push_op(Opcode::Const, &[Operand::Number(1.0)], 0);
        f.push_op(Opcode::Const, &[Operand::Number(2.0)], 0);
        f.close_block(block);
        assert_eq!(f.blocks[block as usize].lower, 0);
        assert_eq!(f.blocks[block as usize].upper, 2);
    }

    #[test]
    fn set_predecessors_round_trips_through_predecessors_of() {
        let mut f = Function::new(None, 0, 0, false, false);
        let entry = f.open_block(BlockKind::Normal);
        f.close_block(entry);
        let join = f.open_block(BlockKind::Normal);
        f.close_block(join);
        f.set_predecessors(join, &[entry, entry]);
        assert_eq!(f.predecessors_of(join), &[entry, entry]);
        assert_eq!(f.predecessors_of(entry), &[]);
    }

    #[test]
    fn push_header_op_links_multiple_phis_in_insertion_order() {
        let mut f = Function::new(None, 0, 0, false, false);
        let block = f.open_block(BlockKind::Normal);
        let first = f.push_header_op(block, Opcode::Phi, &[Operand::Number(1.0)], 0, 0);
        let second = f.push_header_op(block, Opcode::Phi, &[Operand::Number(2.0)], 1, 0);
        f.close_block(block);

        assert_eq!(f.blocks[block as usize].phi_head, Some(first));
        assert_eq!(f.blocks[block as usize].phi_tail, Some(second));
        assert_eq!(f.ops[first as usize].phi_next, Some(second));
        assert_eq!(f.ops[second as usize].phi_next, None);
        assert_eq!(f.ops[first as usize].local, Some(0));
        assert_eq!(f.ops[second as usize].local, Some(1));
    }

    #[test]
    fn deferred_header_op_gets_its_operands_filled_in_later() {
        let mut f = Function::new(None, 0, 0, false, false);
        let block = f.open_block(BlockKind::Normal);
        let phi = f.push_header_op_deferred(block, Opcode::Phi, 0, 0);
        assert_eq!(f.operands_of(phi), &[] as &[Operand]);

        let value = f.push_op(Opcode::Const, &[Operand::Number(5.0)], 0);
        f.fill_deferred_operands(phi, &[Operand::Op(value), Operand::Op(value)]);
        f.close_block(block);

        assert_eq!(f.operands_of(phi), &[Operand::Op(value), Operand::Op(value)]);
        assert_eq!(f.blocks[block as usize].phi_head, Some(phi));
    }
}
