//! Host IR emitted by the trace builder and consumed by a [`HostCodeGenerator`].
//!
//! Values live in mutable virtual registers ([`Var`]) rather than SSA values: a guest register is
//! bound to one variable for the whole trace, so a block reached along several paths can read it
//! without phi nodes.
//!
//! [`HostCodeGenerator`]: crate::host::HostCodeGenerator

use crate::arch::{GuestAddr, RegId};
use crate::profile::BranchKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var(pub u32);

impl Var {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Imm(u64),
    Var(Var),
}

impl From<Var> for Operand {
    fn from(v: Var) -> Self {
        Operand::Var(v)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    ShrU,
    ShrS,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    LtS,
    LtU,
    LeS,
    LeU,
    GtS,
    GtU,
    GeS,
    GeU,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemSize {
    U8,
    U16,
    U32,
    U64,
}

impl MemSize {
    pub const fn bytes(self) -> usize {
        match self {
            MemSize::U8 => 1,
            MemSize::U16 => 2,
            MemSize::U32 => 4,
            MemSize::U64 => 8,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instr {
    /// Load a guest register from persistent process state.
    Fill { dst: Var, reg: RegId },
    /// Store a guest register back to persistent process state.
    Spill { reg: RegId, src: Var },
    Mov { dst: Var, src: Operand },
    Bin {
        dst: Var,
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
    /// `dst = (lhs op rhs) as u64` (0 or 1).
    Cmp {
        dst: Var,
        op: CmpOp,
        lhs: Operand,
        rhs: Operand,
    },
    Select {
        dst: Var,
        cond: Operand,
        if_true: Operand,
        if_false: Operand,
    },
    /// Guest memory read. With `faulted` set, a failing access writes 1 there (0 on success) and
    /// execution carries on to a terminator that tests it. Without it, a fault leaves the trace on
    /// the spot.
    Load {
        dst: Var,
        addr: Operand,
        size: MemSize,
        faulted: Option<Var>,
    },
    /// Guest memory write; `faulted` as for [`Instr::Load`].
    Store {
        addr: Operand,
        value: Operand,
        size: MemSize,
        faulted: Option<Var>,
    },
    /// Perform a guest system call against the process state. All registers are spilled before
    /// and refilled after. If the call finishes the process, execution leaves the trace with
    /// `resume_pc` as the next pc.
    SysCall { resume_pc: GuestAddr },
    /// Report a dynamic branch that left the trace through its fallback path to the branch
    /// profile. Calls carry their return address so the call site can be registered.
    RecordBranch {
        site: GuestAddr,
        target: Operand,
        kind: BranchKind,
        return_pc: Option<GuestAddr>,
    },
}

impl Instr {
    /// Guest register touched by a fill/spill, if any.
    pub fn fill_spill_reg(&self) -> Option<RegId> {
        match self {
            Instr::Fill { reg, .. } | Instr::Spill { reg, .. } => Some(*reg),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Placeholder target of a branch recorded as unresolved. A finished graph never contains it.
    pub const UNRESOLVED: BlockId = BlockId(u32::MAX);

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn is_unresolved(self) -> bool {
        self.0 == u32::MAX
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminator {
    Jump(BlockId),
    /// Branch to `taken` when `cond != 0`.
    Branch {
        cond: Operand,
        taken: BlockId,
        not_taken: BlockId,
    },
    /// Multi-way dispatch on `value`.
    Switch {
        value: Operand,
        cases: Vec<(GuestAddr, BlockId)>,
        default: BlockId,
    },
    /// Leave the trace. Only the finish block returns.
    Return { next_pc: Var },
    /// Leave the trace with a bad-instruction fault. State has already been spilled.
    Fault { pc: GuestAddr, bytes: Vec<u8> },
    /// Leave the trace with a fault on the memory access at `addr` made by the instruction at
    /// `pc`. State has already been spilled.
    MemoryFault { pc: GuestAddr, addr: Operand },
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump(t) => vec![*t],
            Terminator::Branch {
                taken, not_taken, ..
            } => vec![*taken, *not_taken],
            Terminator::Switch { cases, default, .. } => {
                let mut out: Vec<BlockId> = cases.iter().map(|(_, b)| *b).collect();
                out.push(*default);
                out
            }
            Terminator::Return { .. }
            | Terminator::Fault { .. }
            | Terminator::MemoryFault { .. } => Vec::new(),
        }
    }
}

/// Edge of a terminator that still points at [`BlockId::UNRESOLVED`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchSlot {
    /// `Jump` target.
    Jump,
    /// `taken` side of a `Branch`.
    Taken,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Block {
    pub instrs: Vec<Instr>,
    pub term: Option<Terminator>,
}

impl Block {
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty() && self.term.is_none()
    }
}

/// Basic blocks of one trace, with an explicit layout order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockGraph {
    blocks: Vec<Block>,
    layout: Vec<BlockId>,
    entry: BlockId,
    var_count: u32,
}

impl Default for BlockGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockGraph {
    /// A graph holding a single empty entry block.
    pub fn new() -> Self {
        let entry = BlockId(0);
        Self {
            blocks: vec![Block::default()],
            layout: vec![entry],
            entry,
            var_count: 0,
        }
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn var_count(&self) -> u32 {
        self.var_count
    }

    pub fn new_var(&mut self) -> Var {
        let v = Var(self.var_count);
        self.var_count = self
            .var_count
            .checked_add(1)
            .expect("trace ran out of host variables");
        v
    }

    /// Blocks in layout order.
    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    /// Iterate `(id, block)` in layout order.
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &Block)> + '_ {
        self.layout.iter().map(move |id| (*id, &self.blocks[id.index()]))
    }

    /// Create an empty block placed directly after `after` in layout order.
    pub fn create_block_after(&mut self, after: BlockId) -> BlockId {
        let id = BlockId(
            self.blocks
                .len()
                .try_into()
                .expect("trace block count overflows u32"),
        );
        self.blocks.push(Block::default());
        let pos = self
            .layout
            .iter()
            .position(|b| *b == after)
            .expect("create_block_after: anchor block is not in the layout");
        self.layout.insert(pos + 1, id);
        id
    }

    pub fn push_instr(&mut self, block: BlockId, instr: Instr) {
        let b = self.block_mut(block);
        assert!(
            b.term.is_none(),
            "appending to block {} after its terminator",
            block.0
        );
        b.instrs.push(instr);
    }

    pub fn is_terminated(&self, block: BlockId) -> bool {
        self.block(block).term.is_some()
    }

    /// # Panics
    ///
    /// Panics if the block already has a terminator: a block ends in exactly one control transfer.
    pub fn set_terminator(&mut self, block: BlockId, term: Terminator) {
        let b = self.block_mut(block);
        assert!(
            b.term.is_none(),
            "block {} already has a terminator ({:?})",
            block.0,
            b.term
        );
        b.term = Some(term);
    }

    /// Point an unresolved edge of `block`'s terminator at `target`.
    pub fn patch(&mut self, block: BlockId, slot: BranchSlot, target: BlockId) {
        let term = self
            .block_mut(block)
            .term
            .as_mut()
            .expect("patching a block without a terminator");
        let edge = match (slot, term) {
            (BranchSlot::Jump, Terminator::Jump(t)) => t,
            (BranchSlot::Taken, Terminator::Branch { taken, .. }) => taken,
            (slot, term) => panic!("branch slot {slot:?} does not match terminator {term:?}"),
        };
        assert!(edge.is_unresolved(), "branch edge resolved twice");
        *edge = target;
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.block(block)
            .term
            .as_ref()
            .map(Terminator::successors)
            .unwrap_or_default()
    }

    /// Drop blocks that cannot be reached from the entry from the layout.
    pub fn prune_unreachable(&mut self) -> usize {
        let mut reachable = vec![false; self.blocks.len()];
        let mut stack = vec![self.entry];
        while let Some(b) = stack.pop() {
            if b.is_unresolved() || reachable[b.index()] {
                continue;
            }
            reachable[b.index()] = true;
            stack.extend(self.successors(b));
        }
        let before = self.layout.len();
        self.layout.retain(|b| reachable[b.index()]);
        before - self.layout.len()
    }

    /// Keep only the instructions for which `keep` returns true, across all laid-out blocks.
    pub fn retain_instrs(&mut self, mut keep: impl FnMut(&Instr) -> bool) -> usize {
        let mut removed = 0;
        for id in &self.layout {
            let block = &mut self.blocks[id.index()];
            let before = block.instrs.len();
            block.instrs.retain(|i| keep(i));
            removed += before - block.instrs.len();
        }
        removed
    }

    pub fn instr_count(&self) -> usize {
        self.iter().map(|(_, b)| b.instrs.len()).sum()
    }

    /// Every laid-out block is terminated and no edge is left unresolved.
    pub fn validate(&self) -> Result<(), BlockId> {
        for (id, block) in self.iter() {
            match &block.term {
                None => return Err(id),
                Some(term) if term.successors().iter().any(|s| s.is_unresolved()) => {
                    return Err(id)
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}
